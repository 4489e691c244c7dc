//! End-to-end tests over synthetic ISO-BMFF files built in memory.

use std::io::Cursor;

use vidthumb::picture::CollectSink;
use vidthumb::{Error, ExtractionMode, extract_to_sink};

// Hand-assembled parameter sets and one coded picture: a Baseline SPS/PPS
// pair for a single-macroblock (16x16) stream and an IDR slice holding one
// I_16x16 DC macroblock with no residual, i.e. a flat mid-gray picture.
const SPS_BLOB: &[u8] = &[0x67, 0x42, 0x00, 0x0a, 0xda, 0x79];
const PPS_BLOB: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
const GRAY_IDR_NAL: &[u8] = &[0x65, 0xb8, 0x4a, 0x27, 0x80];

fn boxed(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(typ);
    out.extend_from_slice(payload);
    out
}

fn full_box(typ: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.extend_from_slice(&(((version as u32) << 24) | (flags & 0xff_ffff)).to_be_bytes());
    body.extend_from_slice(payload);
    boxed(typ, &body)
}

fn ftyp() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(b"isom");
    boxed(b"ftyp", &payload)
}

fn mvhd() -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0u32.to_be_bytes()); // creation
    p.extend_from_slice(&0u32.to_be_bytes()); // modification
    p.extend_from_slice(&1000u32.to_be_bytes()); // timescale
    p.extend_from_slice(&5000u32.to_be_bytes()); // duration
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate
    p.extend_from_slice(&[0u8; 2 + 2 + 8 + 36 + 24]); // volume..pre_defined
    p.extend_from_slice(&2u32.to_be_bytes()); // next track id
    full_box(b"mvhd", 0, 0, &p)
}

fn tkhd(track_id: u32, width: u16, height: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&track_id.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes()); // reserved
    p.extend_from_slice(&5000u32.to_be_bytes()); // duration
    p.extend_from_slice(&[0u8; 8 + 2 + 2 + 2 + 2 + 36]);
    p.extend_from_slice(&((width as u32) << 16).to_be_bytes());
    p.extend_from_slice(&((height as u32) << 16).to_be_bytes());
    full_box(b"tkhd", 0, 7, &p)
}

fn mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&timescale.to_be_bytes());
    p.extend_from_slice(&duration.to_be_bytes());
    p.extend_from_slice(&0x55c4u16.to_be_bytes()); // language: und
    p.extend_from_slice(&0u16.to_be_bytes());
    full_box(b"mdhd", 0, 0, &p)
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
    p.extend_from_slice(handler);
    p.extend_from_slice(&[0u8; 12]);
    p.extend_from_slice(b"handler\0");
    full_box(b"hdlr", 0, 0, &p)
}

fn avcc(length_size_minus_one: u8) -> Vec<u8> {
    let mut p = Vec::new();
    p.push(1); // configurationVersion
    p.push(66);
    p.push(0xc0);
    p.push(10);
    p.push(0xfc | (length_size_minus_one & 0b11));
    p.push(0xe0 | 1);
    p.extend_from_slice(&(SPS_BLOB.len() as u16).to_be_bytes());
    p.extend_from_slice(SPS_BLOB);
    p.push(1);
    p.extend_from_slice(&(PPS_BLOB.len() as u16).to_be_bytes());
    p.extend_from_slice(PPS_BLOB);
    boxed(b"avcC", &p)
}

fn stsd_avc1(width: u16, height: u16) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&[0u8; 6]); // reserved
    entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    entry.extend_from_slice(&[0u8; 16]); // pre_defined/reserved
    entry.extend_from_slice(&width.to_be_bytes());
    entry.extend_from_slice(&height.to_be_bytes());
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution
    entry.extend_from_slice(&0u32.to_be_bytes()); // reserved
    entry.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    entry.extend_from_slice(&[0u8; 32]); // compressorname
    entry.extend_from_slice(&24u16.to_be_bytes()); // depth
    entry.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
    entry.extend_from_slice(&avcc(3));

    let sample_entry = boxed(b"avc1", &entry);
    let mut p = Vec::new();
    p.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    p.extend_from_slice(&sample_entry);
    full_box(b"stsd", 0, 0, &p)
}

fn stts(count: u32, delta: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend_from_slice(&count.to_be_bytes());
    p.extend_from_slice(&delta.to_be_bytes());
    full_box(b"stts", 0, 0, &p)
}

fn stss(ordinals: &[u32]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&(ordinals.len() as u32).to_be_bytes());
    for &o in ordinals {
        p.extend_from_slice(&o.to_be_bytes());
    }
    full_box(b"stss", 0, 0, &p)
}

fn stsc_single_chunk(samples: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend_from_slice(&samples.to_be_bytes());
    p.extend_from_slice(&1u32.to_be_bytes());
    full_box(b"stsc", 0, 0, &p)
}

fn stsz(sizes: &[u32]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0u32.to_be_bytes()); // per-sample sizes follow
    p.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    for &s in sizes {
        p.extend_from_slice(&s.to_be_bytes());
    }
    full_box(b"stsz", 0, 0, &p)
}

fn stco(offsets: &[u32]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for &o in offsets {
        p.extend_from_slice(&o.to_be_bytes());
    }
    full_box(b"stco", 0, 0, &p)
}

fn co64(offsets: &[u64]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for &o in offsets {
        p.extend_from_slice(&o.to_be_bytes());
    }
    full_box(b"co64", 0, 0, &p)
}

fn video_trak(stbl_leaves: Vec<Vec<u8>>) -> Vec<u8> {
    let mut stbl_payload = Vec::new();
    for leaf in stbl_leaves {
        stbl_payload.extend_from_slice(&leaf);
    }
    let stbl = boxed(b"stbl", &stbl_payload);
    let vmhd = full_box(b"vmhd", 0, 1, &[0u8; 8]);
    let minf = boxed(b"minf", &[vmhd, stbl].concat());
    let mdia = boxed(b"mdia", &[mdhd(90000, 450000), hdlr(b"vide"), minf].concat());
    boxed(b"trak", &[tkhd(1, 16, 16), mdia].concat())
}

/// One-video-track file with a single length-prefixed IDR sample.
fn gray_single_sample_mp4() -> Vec<u8> {
    let mut sample = Vec::new();
    sample.extend_from_slice(&(GRAY_IDR_NAL.len() as u32).to_be_bytes());
    sample.extend_from_slice(GRAY_IDR_NAL);

    let ftyp = ftyp();
    let sample_offset = (ftyp.len() + 8) as u32;
    let mdat = boxed(b"mdat", &sample);

    let trak = video_trak(vec![
        stsd_avc1(16, 16),
        stts(1, 3000),
        stss(&[1]),
        stsc_single_chunk(1),
        stsz(&[sample.len() as u32]),
        stco(&[sample_offset]),
    ]);
    let moov = boxed(b"moov", &[mvhd(), trak].concat());

    [ftyp, mdat, moov].concat()
}

#[test]
fn gray_thumbnail_end_to_end() {
    let file = gray_single_sample_mp4();
    let mut sink = CollectSink::default();
    let written = extract_to_sink(
        &mut Cursor::new(&file),
        1,
        ExtractionMode::Distributed,
        &mut sink,
    )
    .unwrap();

    assert_eq!(written, 1);
    assert_eq!(sink.pictures.len(), 1);
    let pic = &sink.pictures[0];
    assert_eq!((pic.width, pic.height), (16, 16));
    assert!(pic.y.data.iter().all(|&v| v == 128));
    assert!(pic.cb.data.iter().all(|&v| v == 128));
}

#[test]
fn unfiltered_mode_also_decodes() {
    let file = gray_single_sample_mp4();
    let mut sink = CollectSink::default();
    let written = extract_to_sink(
        &mut Cursor::new(&file),
        1,
        ExtractionMode::Unfiltered,
        &mut sink,
    )
    .unwrap();
    assert_eq!(written, 1);
}

#[test]
fn corrupt_stco_past_eof_fails_with_container_error() {
    let mut sample = Vec::new();
    sample.extend_from_slice(&(GRAY_IDR_NAL.len() as u32).to_be_bytes());
    sample.extend_from_slice(GRAY_IDR_NAL);

    let ftyp = ftyp();
    let mdat = boxed(b"mdat", &sample);
    let trak = video_trak(vec![
        stsd_avc1(16, 16),
        stts(1, 3000),
        stss(&[1]),
        stsc_single_chunk(1),
        stsz(&[sample.len() as u32]),
        stco(&[0x00ff_ffff]), // far past EOF
    ]);
    let moov = boxed(b"moov", &[mvhd(), trak].concat());
    let file = [ftyp, mdat, moov].concat();

    let mut sink = CollectSink::default();
    let err = extract_to_sink(
        &mut Cursor::new(&file),
        1,
        ExtractionMode::Distributed,
        &mut sink,
    )
    .unwrap_err();

    assert!(matches!(err, Error::Mp4SamplesOutOfBounds { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(sink.pictures.is_empty());
}

#[test]
fn co64_offsets_are_preserved_exactly() {
    // The chunk offset exceeds 2^32; the demuxer must carry it through
    // unchanged even though this test file is far smaller.
    let huge = 0x1_0000_0010u64;
    let trak = video_trak(vec![
        stsd_avc1(16, 16),
        stts(1, 3000),
        stss(&[1]),
        stsc_single_chunk(1),
        stsz(&[9]),
        co64(&[huge]),
    ]);
    let moov = boxed(b"moov", &[mvhd(), trak].concat());
    let file = [ftyp(), moov].concat();

    let mp4 = vidthumb::mp4::parse_mp4(&mut Cursor::new(&file)).unwrap();
    assert_eq!(mp4.tracks.len(), 1);
    let entry = mp4.tracks[0]
        .index
        .media_entries()
        .next()
        .expect("one media sample");
    assert_eq!(entry.byte_offset, huge);
    // Out of bounds for this file, so it must be flagged rather than read.
    assert!(!entry.valid);
}

#[test]
fn track_without_sample_sizes_is_discarded() {
    let trak = video_trak(vec![
        stsd_avc1(16, 16),
        stts(1, 3000),
        stsc_single_chunk(1),
        stco(&[64]),
    ]);
    let moov = boxed(b"moov", &[mvhd(), trak].concat());
    let file = [ftyp(), moov].concat();

    let err = extract_to_sink(
        &mut Cursor::new(&file),
        1,
        ExtractionMode::Distributed,
        &mut CollectSink::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoVideoTrack));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn missing_stss_means_every_sample_is_sync() {
    let mut sample = Vec::new();
    sample.extend_from_slice(&(GRAY_IDR_NAL.len() as u32).to_be_bytes());
    sample.extend_from_slice(GRAY_IDR_NAL);

    let ftyp = ftyp();
    let sample_offset = (ftyp.len() + 8) as u32;
    let mdat = boxed(b"mdat", &sample);
    let trak = video_trak(vec![
        stsd_avc1(16, 16),
        stts(1, 3000),
        stsc_single_chunk(1),
        stsz(&[sample.len() as u32]),
        stco(&[sample_offset]),
    ]);
    let moov = boxed(b"moov", &[mvhd(), trak].concat());
    let file = [ftyp, mdat, moov].concat();

    let mp4 = vidthumb::mp4::parse_mp4(&mut Cursor::new(&file)).unwrap();
    assert_eq!(mp4.tracks[0].index.sample_count_idr, 1);
}

#[test]
fn no_idr_samples_is_exit_code_three() {
    let mut sample = Vec::new();
    sample.extend_from_slice(&(GRAY_IDR_NAL.len() as u32).to_be_bytes());
    sample.extend_from_slice(GRAY_IDR_NAL);

    let ftyp = ftyp();
    let sample_offset = (ftyp.len() + 8) as u32;
    let mdat = boxed(b"mdat", &sample);
    let trak = video_trak(vec![
        stsd_avc1(16, 16),
        stts(1, 3000),
        stss(&[]), // stss present but empty: nothing is a sync sample
        stsc_single_chunk(1),
        stsz(&[sample.len() as u32]),
        stco(&[sample_offset]),
    ]);
    let moov = boxed(b"moov", &[mvhd(), trak].concat());
    let file = [ftyp, mdat, moov].concat();

    let err = extract_to_sink(
        &mut Cursor::new(&file),
        1,
        ExtractionMode::Distributed,
        &mut CollectSink::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSyncSamples));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn probe_reports_track_metadata() {
    let file = gray_single_sample_mp4();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray.mp4");
    std::fs::write(&path, &file).unwrap();

    let tracks = vidthumb::probe(&path).unwrap();
    assert_eq!(tracks.len(), 1);
    let t = &tracks[0];
    assert_eq!(t.handler, "video");
    assert_eq!(t.codec, "avc1");
    assert_eq!(t.timescale, 90000);
    assert_eq!((t.width, t.height), (16, 16));
    assert_eq!(t.sample_count, 1);
    assert_eq!(t.idr_count, 1);
    assert_eq!(t.config_count, 2);
    assert_eq!(t.chroma_format_idc, 1);
    assert_eq!(t.bit_depth, 8);

    let json = serde_json::to_string(&tracks).unwrap();
    assert!(json.contains("\"codec\":\"avc1\""));
}

#[test]
fn file_without_moov_is_unsupported() {
    let file = [ftyp(), boxed(b"mdat", &[0u8; 32])].concat();
    let err = extract_to_sink(
        &mut Cursor::new(&file),
        1,
        ExtractionMode::Distributed,
        &mut CollectSink::default(),
    )
    .unwrap_err();
    assert_eq!(err.exit_code(), 1);
}
