use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::params::Sps;
use crate::samples::{SampleEntry, SampleIndex, SampleKind, StreamKind};

// -----------------------------
// ISO-BMFF box tree (MP4/MOV/3GP/F4V)
// -----------------------------

/// Hard cap on honoured tracks; extra `trak` boxes are ignored with a warning.
const MAX_TRACKS: usize = 16;

#[derive(Debug, Clone)]
pub struct Mp4 {
    pub major_brand: Option<[u8; 4]>,
    /// File-level timescale from `mvhd`, ticks per second.
    pub timescale: u32,
    pub duration: u64,
    pub creation_time: u64,
    pub modification_time: u64,
    pub tracks: Vec<Track>,
    /// Total file size, used for sample bounds validation.
    pub file_size: u64,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub handler: HandlerKind,
    pub codec: Codec,
    /// Track timescale from `mdhd`, ticks per second.
    pub timescale: u32,
    pub duration: u64,
    /// Display size from `tkhd` (integer part of the 16.16 value).
    pub width: u16,
    pub height: u16,
    /// From the first SPS when the codec is AVC; container defaults otherwise.
    pub chroma_format_idc: u8,
    pub bit_depth: u8,
    pub index: SampleIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Video,
    Audio,
    Hint,
    Meta,
    Other([u8; 4]),
}

impl HandlerKind {
    fn from_fourcc(t: [u8; 4]) -> Self {
        match &t {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            b"hint" => Self::Hint,
            b"meta" => Self::Meta,
            _ => Self::Other(t),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Hint => "hint",
            Self::Meta => "meta",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Codec {
    Avc(AvcConfig),
    /// Indexed but never decoded (e.g. `mp4a` audio, non-AVC video).
    Unknown([u8; 4]),
}

impl Codec {
    pub fn name(&self) -> String {
        match self {
            Codec::Avc(_) => "avc1".to_string(),
            Codec::Unknown(t) => fourcc_to_string(*t),
        }
    }
}

/// Decoded `AVCDecoderConfigurationRecord` (`avcC`), ISO/IEC 14496-15.
///
/// SPS/PPS blobs are kept verbatim (NAL header byte included) so the
/// orchestrator can splice them ahead of each access unit.
#[derive(Debug, Clone)]
pub struct AvcConfig {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    /// NAL length prefix size in bytes: `lengthSizeMinusOne + 1`.
    pub length_size: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
    /// Absolute file spans of the blobs above, for the config index entries.
    pub sps_spans: Vec<(u64, u32)>,
    pub pps_spans: Vec<(u64, u32)>,
}

// -----------------------------
// Low-level readers
// -----------------------------

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_be_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_be_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_be_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

#[derive(Debug, Clone)]
struct BoxHeader {
    typ: [u8; 4],
    size: u64,
    header_len: u64,
}

fn read_box_header<R: Read>(r: &mut R) -> io::Result<BoxHeader> {
    let size32 = read_be_u32(r)? as u64;
    let mut typ = [0u8; 4];
    r.read_exact(&mut typ)?;
    let (size, mut header_len) = if size32 == 1 {
        (read_be_u64(r)?, 16)
    } else {
        (size32, 8)
    };
    if typ == *b"uuid" {
        // The 16-byte user type follows the (large)size; we have no use for
        // its value, only for its contribution to the header length.
        let mut usertype = [0u8; 16];
        r.read_exact(&mut usertype)?;
        header_len += 16;
    }
    Ok(BoxHeader {
        typ,
        size,
        header_len,
    })
}

/// FullBox prologue: one version byte and a 24-bit flag field.
fn read_full_box<R: Read>(r: &mut R) -> io::Result<(u8, u32)> {
    let v = read_be_u32(r)?;
    Ok(((v >> 24) as u8, v & 0x00ff_ffff))
}

fn fourcc(s: &str) -> [u8; 4] {
    let b = s.as_bytes();
    [b[0], b[1], b[2], b[3]]
}

fn fourcc_to_string(t: [u8; 4]) -> String {
    t.iter()
        .map(|&c| if c.is_ascii_graphic() { c as char } else { '.' })
        .collect()
}

fn safe_box_end(ctx: &'static str, start: u64, hdr: &BoxHeader, limit: u64) -> Result<u64> {
    // ISO-BMFF: size==0 means "extends to end of file" (or end of the containing box).
    let mut size = hdr.size;
    if size == 0 {
        size = limit.saturating_sub(start);
    }
    if size < hdr.header_len {
        return Err(Error::Mp4InvalidBox {
            context: ctx,
            box_type: fourcc_to_string(hdr.typ),
            offset: start,
            message: format!("size {size} < header_len {}", hdr.header_len),
        });
    }

    let end = start.saturating_add(size);
    if end > limit {
        return Err(Error::Mp4InvalidBox {
            context: ctx,
            box_type: fourcc_to_string(hdr.typ),
            offset: start,
            message: format!("box end {end} exceeds parent end {limit}"),
        });
    }

    // Guarantee forward progress.
    if end <= start {
        return Err(Error::Mp4InvalidBox {
            context: ctx,
            box_type: fourcc_to_string(hdr.typ),
            offset: start,
            message: format!("non-advancing end {end}"),
        });
    }

    Ok(end)
}

// -----------------------------
// Raw sample tables (stbl leaves before expansion)
// -----------------------------

#[derive(Debug, Clone)]
pub(crate) struct StscEntry {
    pub(crate) first_chunk: u32,
    pub(crate) samples_per_chunk: u32,
    #[allow(dead_code)]
    pub(crate) sample_description_index: u32,
}

#[derive(Debug, Clone)]
enum SampleSizes {
    Uniform { size: u32, count: u32 },
    PerSample(Vec<u32>),
}

impl SampleSizes {
    fn count(&self) -> usize {
        match self {
            SampleSizes::Uniform { count, .. } => *count as usize,
            SampleSizes::PerSample(v) => v.len(),
        }
    }

    fn get(&self, i: usize) -> u32 {
        match self {
            SampleSizes::Uniform { size, .. } => *size,
            SampleSizes::PerSample(v) => v[i],
        }
    }
}

#[derive(Debug, Default)]
struct SampleTables {
    codec: Option<Codec>,
    /// `{sample_count, delta}` runs from `stts`.
    time_deltas: Vec<(u32, u32)>,
    /// `{sample_count, offset}` runs from `ctts` (signed for version 1).
    composition_offsets: Vec<(u32, i32)>,
    /// 1-indexed sync sample ordinals; `None` means every sample is sync.
    sync_samples: Option<Vec<u32>>,
    stsc: Vec<StscEntry>,
    sizes: Option<SampleSizes>,
    chunk_offsets: Option<Vec<u64>>,
}

#[derive(Debug, Default)]
struct TrackHeader {
    id: u32,
    width: u16,
    height: u16,
}

#[derive(Debug, Default)]
struct MediaHeader {
    timescale: u32,
    duration: u64,
}

// -----------------------------
// Box tree walk
// -----------------------------

pub fn parse_mp4<R: Read + Seek>(f: &mut R) -> Result<Mp4> {
    let file_len = f.seek(SeekFrom::End(0))?;
    let mut pos = 0u64;

    let mut mp4 = Mp4 {
        major_brand: None,
        timescale: 0,
        duration: 0,
        creation_time: 0,
        modification_time: 0,
        tracks: Vec::new(),
        file_size: file_len,
    };
    let mut saw_moov = false;

    while pos + 8 <= file_len {
        f.seek(SeekFrom::Start(pos))?;
        let hdr = read_box_header(f)?;
        let start = pos;
        let end = safe_box_end("top", start, &hdr, file_len)?;
        let payload_start = start + hdr.header_len;
        trace!(
            "top box {} at {} size {}",
            fourcc_to_string(hdr.typ),
            start,
            end - start
        );

        match hdr.typ {
            t if t == fourcc("ftyp") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let mut brand = [0u8; 4];
                f.read_exact(&mut brand)?;
                mp4.major_brand = Some(brand);
            }
            t if t == fourcc("moov") => {
                saw_moov = true;
                parse_moov(f, payload_start, end, &mut mp4)?;
            }
            // Media payload and dead weight; nothing to parse here.
            t if t == fourcc("mdat")
                || t == fourcc("free")
                || t == fourcc("skip")
                || t == fourcc("udta")
                || t == fourcc("uuid") => {}
            _ => {
                trace!("skipping unknown top-level box {}", fourcc_to_string(hdr.typ));
            }
        }

        pos = end;
    }

    if !saw_moov {
        return Err(Error::Mp4MissingSampleTables {
            missing: "moov".to_string(),
        });
    }

    for track in &mut mp4.tracks {
        let invalid = track.index.validate_bounds(file_len);
        if invalid > 0 {
            warn!(
                "track {}: {invalid} sample(s) point outside the file and will be skipped",
                track.id
            );
        }
    }

    Ok(mp4)
}

fn parse_moov<R: Read + Seek>(f: &mut R, mut pos: u64, end: u64, mp4: &mut Mp4) -> Result<()> {
    while pos + 8 <= end {
        f.seek(SeekFrom::Start(pos))?;
        let hdr = read_box_header(f)?;
        let start = pos;
        let box_end = safe_box_end("moov", start, &hdr, end)?;
        let payload_start = start + hdr.header_len;

        match hdr.typ {
            t if t == fourcc("mvhd") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (version, _flags) = read_full_box(f)?;
                if version == 1 {
                    mp4.creation_time = read_be_u64(f)?;
                    mp4.modification_time = read_be_u64(f)?;
                    mp4.timescale = read_be_u32(f)?;
                    mp4.duration = read_be_u64(f)?;
                } else {
                    mp4.creation_time = read_be_u32(f)? as u64;
                    mp4.modification_time = read_be_u32(f)? as u64;
                    mp4.timescale = read_be_u32(f)?;
                    mp4.duration = read_be_u32(f)? as u64;
                }
            }
            t if t == fourcc("trak") => {
                if mp4.tracks.len() >= MAX_TRACKS {
                    warn!("more than {MAX_TRACKS} tracks; ignoring the rest");
                } else {
                    // A malformed box inside one trak discards that track only.
                    match parse_trak(f, payload_start, box_end) {
                        Ok(Some(track)) => mp4.tracks.push(track),
                        Ok(None) => {}
                        Err(Error::Io(e)) => return Err(Error::Io(e)),
                        Err(e) => warn!("discarding track: {e}"),
                    }
                }
            }
            _ => {}
        }

        pos = box_end;
    }
    Ok(())
}

fn parse_trak<R: Read + Seek>(f: &mut R, mut pos: u64, end: u64) -> Result<Option<Track>> {
    let mut tkhd = TrackHeader::default();
    let mut mdhd = MediaHeader::default();
    let mut handler: Option<HandlerKind> = None;
    let mut tables: Option<SampleTables> = None;

    while pos + 8 <= end {
        f.seek(SeekFrom::Start(pos))?;
        let hdr = read_box_header(f)?;
        let start = pos;
        let box_end = safe_box_end("trak", start, &hdr, end)?;
        let payload_start = start + hdr.header_len;

        match hdr.typ {
            t if t == fourcc("tkhd") => {
                tkhd = parse_tkhd(f, payload_start)?;
            }
            t if t == fourcc("mdia") => {
                parse_mdia(f, payload_start, box_end, &mut mdhd, &mut handler, &mut tables)?;
            }
            _ => {}
        }

        pos = box_end;
    }

    let handler = match handler {
        Some(h) => h,
        None => {
            warn!("track {}: no hdlr box, discarding", tkhd.id);
            return Ok(None);
        }
    };

    let Some(tables) = tables else {
        warn!("track {} ({}): no sample tables, discarding", tkhd.id, handler.as_str());
        return Ok(None);
    };

    let mut missing: Vec<&'static str> = Vec::new();
    if tables.codec.is_none() {
        missing.push("stsd");
    }
    if tables.sizes.is_none() {
        missing.push("stsz/stz2");
    }
    if tables.chunk_offsets.is_none() {
        missing.push("stco/co64");
    }
    if tables.stsc.is_empty() {
        missing.push("stsc");
    }
    if !missing.is_empty() {
        warn!(
            "track {} ({}): missing {}, discarding",
            tkhd.id,
            handler.as_str(),
            missing.join(", ")
        );
        return Ok(None);
    }

    build_track(tkhd, mdhd, handler, tables).map(Some)
}

fn parse_tkhd<R: Read + Seek>(f: &mut R, payload_start: u64) -> Result<TrackHeader> {
    f.seek(SeekFrom::Start(payload_start))?;
    let (version, _flags) = read_full_box(f)?;

    let id;
    if version == 1 {
        let _creation = read_be_u64(f)?;
        let _modification = read_be_u64(f)?;
        id = read_be_u32(f)?;
        let _reserved = read_be_u32(f)?;
        let _duration = read_be_u64(f)?;
    } else {
        let _creation = read_be_u32(f)?;
        let _modification = read_be_u32(f)?;
        id = read_be_u32(f)?;
        let _reserved = read_be_u32(f)?;
        let _duration = read_be_u32(f)?;
    }

    // reserved[2], layer, alternate_group, volume, reserved, matrix[9]
    let mut skip = [0u8; 8 + 2 + 2 + 2 + 2 + 36];
    f.read_exact(&mut skip)?;

    // Display size as 16.16 fixed point; keep the integer part.
    let width = (read_be_u32(f)? >> 16) as u16;
    let height = (read_be_u32(f)? >> 16) as u16;

    Ok(TrackHeader { id, width, height })
}

fn parse_mdia<R: Read + Seek>(
    f: &mut R,
    mut pos: u64,
    end: u64,
    mdhd: &mut MediaHeader,
    handler: &mut Option<HandlerKind>,
    tables: &mut Option<SampleTables>,
) -> Result<()> {
    while pos + 8 <= end {
        f.seek(SeekFrom::Start(pos))?;
        let hdr = read_box_header(f)?;
        let start = pos;
        let box_end = safe_box_end("mdia", start, &hdr, end)?;
        let payload_start = start + hdr.header_len;

        match hdr.typ {
            t if t == fourcc("mdhd") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (version, _flags) = read_full_box(f)?;
                if version == 1 {
                    let _creation = read_be_u64(f)?;
                    let _modification = read_be_u64(f)?;
                    mdhd.timescale = read_be_u32(f)?;
                    mdhd.duration = read_be_u64(f)?;
                } else {
                    let _creation = read_be_u32(f)?;
                    let _modification = read_be_u32(f)?;
                    mdhd.timescale = read_be_u32(f)?;
                    mdhd.duration = read_be_u32(f)? as u64;
                }
            }
            t if t == fourcc("hdlr") => {
                // hdlr: version/flags (4) + pre_defined (4) + handler_type (4)
                f.seek(SeekFrom::Start(payload_start + 8))?;
                let mut ht = [0u8; 4];
                f.read_exact(&mut ht)?;
                *handler = Some(HandlerKind::from_fourcc(ht));
            }
            t if t == fourcc("minf") => {
                parse_minf(f, payload_start, box_end, tables)?;
            }
            _ => {}
        }

        pos = box_end;
    }
    Ok(())
}

fn parse_minf<R: Read + Seek>(
    f: &mut R,
    mut pos: u64,
    end: u64,
    tables: &mut Option<SampleTables>,
) -> Result<()> {
    while pos + 8 <= end {
        f.seek(SeekFrom::Start(pos))?;
        let hdr = read_box_header(f)?;
        let start = pos;
        let box_end = safe_box_end("minf", start, &hdr, end)?;
        let payload_start = start + hdr.header_len;

        if hdr.typ == fourcc("stbl") {
            *tables = Some(parse_stbl(f, payload_start, box_end)?);
        }

        pos = box_end;
    }
    Ok(())
}

fn parse_stbl<R: Read + Seek>(f: &mut R, mut pos: u64, end: u64) -> Result<SampleTables> {
    let mut tables = SampleTables::default();

    while pos + 8 <= end {
        f.seek(SeekFrom::Start(pos))?;
        let hdr = read_box_header(f)?;
        let start = pos;
        let box_end = safe_box_end("stbl", start, &hdr, end)?;
        let payload_start = start + hdr.header_len;

        match hdr.typ {
            t if t == fourcc("stsd") => {
                tables.codec = Some(parse_stsd(f, payload_start, box_end)?);
            }
            t if t == fourcc("stts") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (_v, _fl) = read_full_box(f)?;
                let count = read_be_u32(f)?;
                for _ in 0..count {
                    let sample_count = read_be_u32(f)?;
                    let delta = read_be_u32(f)?;
                    tables.time_deltas.push((sample_count, delta));
                }
            }
            t if t == fourcc("ctts") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (version, _fl) = read_full_box(f)?;
                let count = read_be_u32(f)?;
                for _ in 0..count {
                    let sample_count = read_be_u32(f)?;
                    let raw = read_be_u32(f)?;
                    // Version 1 offsets are signed; version 0 values are small
                    // enough in practice that the reinterpretation is lossless.
                    let offset = if version == 1 {
                        raw as i32
                    } else {
                        raw.min(i32::MAX as u32) as i32
                    };
                    tables.composition_offsets.push((sample_count, offset));
                }
            }
            t if t == fourcc("stss") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (_v, _fl) = read_full_box(f)?;
                let count = read_be_u32(f)?;
                let mut v = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    v.push(read_be_u32(f)?);
                }
                tables.sync_samples = Some(v);
            }
            t if t == fourcc("stsc") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (_v, _fl) = read_full_box(f)?;
                let count = read_be_u32(f)?;
                for _ in 0..count {
                    tables.stsc.push(StscEntry {
                        first_chunk: read_be_u32(f)?,
                        samples_per_chunk: read_be_u32(f)?,
                        sample_description_index: read_be_u32(f)?,
                    });
                }
            }
            t if t == fourcc("stsz") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (_v, _fl) = read_full_box(f)?;
                let sample_size = read_be_u32(f)?;
                let count = read_be_u32(f)?;
                if sample_size != 0 {
                    tables.sizes = Some(SampleSizes::Uniform {
                        size: sample_size,
                        count,
                    });
                } else {
                    let mut v = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        v.push(read_be_u32(f)?);
                    }
                    tables.sizes = Some(SampleSizes::PerSample(v));
                }
            }
            t if t == fourcc("stz2") => {
                tables.sizes = Some(parse_stz2(f, payload_start, start)?);
            }
            t if t == fourcc("stco") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (_v, _fl) = read_full_box(f)?;
                let count = read_be_u32(f)?;
                let mut v = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    v.push(read_be_u32(f)? as u64);
                }
                tables.chunk_offsets = Some(v);
            }
            t if t == fourcc("co64") => {
                f.seek(SeekFrom::Start(payload_start))?;
                let (_v, _fl) = read_full_box(f)?;
                let count = read_be_u32(f)?;
                let mut v = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    v.push(read_be_u64(f)?);
                }
                tables.chunk_offsets = Some(v);
            }
            _ => {
                trace!("skipping stbl leaf {}", fourcc_to_string(hdr.typ));
            }
        }

        pos = box_end;
    }

    Ok(tables)
}

fn parse_stz2<R: Read + Seek>(f: &mut R, payload_start: u64, box_start: u64) -> Result<SampleSizes> {
    f.seek(SeekFrom::Start(payload_start))?;
    let (_v, _fl) = read_full_box(f)?;
    // 3 reserved bytes, then the field size in bits.
    let mut reserved = [0u8; 3];
    f.read_exact(&mut reserved)?;
    let field_size = read_u8(f)?;
    let count = read_be_u32(f)? as usize;

    let mut v = Vec::with_capacity(count);
    match field_size {
        4 => {
            // Two entries per byte, high nibble first.
            let mut i = 0;
            while i < count {
                let b = read_u8(f)?;
                v.push((b >> 4) as u32);
                i += 1;
                if i < count {
                    v.push((b & 0x0f) as u32);
                    i += 1;
                }
            }
        }
        8 => {
            for _ in 0..count {
                v.push(read_u8(f)? as u32);
            }
        }
        16 => {
            for _ in 0..count {
                v.push(read_be_u16(f)? as u32);
            }
        }
        _ => {
            return Err(Error::Mp4InvalidBox {
                context: "stbl",
                box_type: "stz2".to_string(),
                offset: box_start,
                message: format!("invalid field size {field_size}"),
            });
        }
    }
    Ok(SampleSizes::PerSample(v))
}

fn parse_stsd<R: Read + Seek>(f: &mut R, payload_start: u64, stsd_end: u64) -> Result<Codec> {
    // stsd: version/flags (4) + entry_count (4) + sample entries...
    f.seek(SeekFrom::Start(payload_start))?;
    let (_v, _fl) = read_full_box(f)?;
    let entry_count = read_be_u32(f)?;
    if entry_count == 0 {
        return Err(Error::Mp4MissingSampleTables {
            missing: "stsd sample entry".to_string(),
        });
    }

    // Sample entries are box-shaped: size + fourcc, then a fixed header.
    let entry_pos = payload_start + 8;
    f.seek(SeekFrom::Start(entry_pos))?;
    let entry_size = read_be_u32(f)? as u64;
    let mut entry_type = [0u8; 4];
    f.read_exact(&mut entry_type)?;

    let entry_payload_start = entry_pos + 8;
    let entry_end = if entry_size == 0 {
        stsd_end
    } else {
        (entry_pos + entry_size).min(stsd_end)
    };

    if entry_type != fourcc("avc1") {
        debug!("non-AVC sample entry {}", fourcc_to_string(entry_type));
        return Ok(Codec::Unknown(entry_type));
    }

    // VisualSampleEntry is 78 bytes after size+type; child boxes follow.
    let mut p = entry_payload_start + 78;
    while p + 8 <= entry_end {
        f.seek(SeekFrom::Start(p))?;
        let hdr = read_box_header(f)?;
        let child_end = safe_box_end("stsd", p, &hdr, entry_end)?;
        let payload = p + hdr.header_len;

        if hdr.typ == fourcc("avcC") {
            return parse_avcc(f, payload).map(Codec::Avc);
        }

        p = child_end;
    }

    Err(Error::Mp4MissingSampleTables {
        missing: "avcC".to_string(),
    })
}

/// AVCDecoderConfigurationRecord, ISO/IEC 14496-15 section 5.2.4.1.
fn parse_avcc<R: Read + Seek>(f: &mut R, payload_start: u64) -> Result<AvcConfig> {
    f.seek(SeekFrom::Start(payload_start))?;
    let _config_version = read_u8(f)?;
    let profile = read_u8(f)?;
    let profile_compat = read_u8(f)?;
    let level = read_u8(f)?;
    let length_size = (read_u8(f)? & 0b11) + 1;

    let sps_count = (read_u8(f)? & 0b1_1111) as usize;
    let mut pos = payload_start + 6;
    let mut sps = Vec::with_capacity(sps_count);
    let mut sps_spans = Vec::with_capacity(sps_count);
    for _ in 0..sps_count {
        let len = read_be_u16(f)? as usize;
        pos += 2;
        let mut blob = vec![0u8; len];
        f.read_exact(&mut blob)?;
        sps_spans.push((pos, len as u32));
        sps.push(blob);
        pos += len as u64;
    }

    let pps_count = read_u8(f)? as usize;
    pos += 1;
    let mut pps = Vec::with_capacity(pps_count);
    let mut pps_spans = Vec::with_capacity(pps_count);
    for _ in 0..pps_count {
        let len = read_be_u16(f)? as usize;
        pos += 2;
        let mut blob = vec![0u8; len];
        f.read_exact(&mut blob)?;
        pps_spans.push((pos, len as u32));
        pps.push(blob);
        pos += len as u64;
    }

    Ok(AvcConfig {
        profile,
        profile_compat,
        level,
        length_size,
        sps,
        pps,
        sps_spans,
        pps_spans,
    })
}

// -----------------------------
// Sample table expansion
// -----------------------------

/// Turn stsc + stco + sizes into per-sample absolute file offsets.
///
/// MP4 chunk numbers are 1-based in stsc; each run applies until the next
/// run's first_chunk.
fn build_sample_offsets(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sizes: &SampleSizes,
) -> Result<Vec<u64>> {
    let mut chunk_samples: Vec<u32> = vec![0; chunk_offsets.len()];

    for i in 0..stsc.len() {
        let cur = &stsc[i];
        let next_first = stsc
            .get(i + 1)
            .map(|e| e.first_chunk)
            .unwrap_or((chunk_offsets.len() as u32) + 1);

        for chunk_idx_1based in cur.first_chunk..next_first {
            let idx0 = (chunk_idx_1based - 1) as usize;
            if idx0 < chunk_samples.len() {
                chunk_samples[idx0] = cur.samples_per_chunk;
            }
        }
    }

    // Some files can be slightly malformed (or use unexpected stsc ordering).
    // Fill any zeros with the previous non-zero value so we still walk all chunks.
    let mut last = 0u32;
    for v in &mut chunk_samples {
        if *v == 0 {
            *v = last;
        } else {
            last = *v;
        }
    }

    let sample_count = sizes.count();
    let mut sample_offsets = Vec::with_capacity(sample_count);
    let mut sample_index = 0usize;

    for (chunk_i, &chunk_off) in chunk_offsets.iter().enumerate() {
        let spc = chunk_samples[chunk_i] as usize;
        let mut off = chunk_off;

        for _ in 0..spc {
            if sample_index >= sample_count {
                break;
            }
            sample_offsets.push(off);
            off += sizes.get(sample_index) as u64;
            sample_index += 1;
        }
    }

    if sample_offsets.len() != sample_count {
        return Err(Error::Mp4InconsistentSampleTables {
            sample_sizes: sample_count,
            sample_offsets: sample_offsets.len(),
            chunk_offsets: chunk_offsets.len(),
        });
    }

    Ok(sample_offsets)
}

/// Expand stts runs to per-sample decode timestamps by prefix sum.
fn build_decode_times(time_deltas: &[(u32, u32)], sample_count: usize) -> Vec<i64> {
    let mut dts = Vec::with_capacity(sample_count);
    let mut t = 0i64;
    for &(count, delta) in time_deltas {
        for _ in 0..count {
            if dts.len() == sample_count {
                return dts;
            }
            dts.push(t);
            t += delta as i64;
        }
    }
    // A short stts table keeps ticking with the last delta.
    let last_delta = time_deltas.last().map(|&(_, d)| d).unwrap_or(0) as i64;
    while dts.len() < sample_count {
        dts.push(t);
        t += last_delta;
    }
    dts
}

/// Expand ctts runs to per-sample composition offsets.
fn build_composition_offsets(runs: &[(u32, i32)], sample_count: usize) -> Vec<i64> {
    let mut offsets = Vec::with_capacity(sample_count);
    for &(count, offset) in runs {
        for _ in 0..count {
            if offsets.len() == sample_count {
                return offsets;
            }
            offsets.push(offset as i64);
        }
    }
    while offsets.len() < sample_count {
        offsets.push(0);
    }
    offsets
}

fn build_track(
    tkhd: TrackHeader,
    mdhd: MediaHeader,
    handler: HandlerKind,
    tables: SampleTables,
) -> Result<Track> {
    let sizes = tables.sizes.expect("checked by caller");
    let chunk_offsets = tables.chunk_offsets.expect("checked by caller");
    let codec = tables.codec.expect("checked by caller");

    let offsets = build_sample_offsets(&tables.stsc, &chunk_offsets, &sizes)?;
    let sample_count = sizes.count();
    let dts = build_decode_times(&tables.time_deltas, sample_count);
    let ctts = build_composition_offsets(&tables.composition_offsets, sample_count);

    let stream_kind = if handler == HandlerKind::Video {
        StreamKind::Video
    } else {
        StreamKind::Audio
    };
    let mut index = SampleIndex::new(stream_kind);

    let mut chroma_format_idc = 1u8;
    let mut bit_depth = 8u8;
    let mut coded_width = tkhd.width;
    let mut coded_height = tkhd.height;

    if let Codec::Avc(config) = &codec {
        // Config entries first so the elementary stream can be re-synthesised
        // from the index alone.
        for &(off, len) in config.sps_spans.iter().chain(config.pps_spans.iter()) {
            index.push(SampleEntry {
                kind: SampleKind::Config,
                byte_offset: off,
                byte_size: len,
                pts: 0,
                dts: 0,
                valid: true,
            });
        }

        match config.sps.first().map(|blob| Sps::parse_blob(blob)) {
            Some(Ok(sps)) => {
                chroma_format_idc = sps.chroma_format_idc;
                bit_depth = sps.bit_depth_luma_minus8 + 8;
                coded_width = sps.width() as u16;
                coded_height = sps.height() as u16;
            }
            Some(Err(e)) => warn!("track {}: unparsable SPS in avcC: {e}", tkhd.id),
            None => warn!("track {}: avcC carries no SPS", tkhd.id),
        }
    }

    let is_sync = |ordinal0: usize| -> bool {
        match &tables.sync_samples {
            // Absence of stss means every sample is a random access point.
            None => true,
            Some(v) => v.binary_search(&((ordinal0 + 1) as u32)).is_ok(),
        }
    };

    for i in 0..sample_count {
        let kind = match stream_kind {
            StreamKind::Audio => SampleKind::Audio,
            StreamKind::Video => {
                if is_sync(i) {
                    SampleKind::VideoIdr
                } else {
                    SampleKind::VideoNonIdr
                }
            }
        };
        index.push(SampleEntry {
            kind,
            byte_offset: offsets[i],
            byte_size: sizes.get(i),
            pts: dts[i] + ctts[i],
            dts: dts[i],
            valid: true,
        });
    }

    debug!(
        "track {} ({}, {}): {} samples, {} sync, timescale {}",
        tkhd.id,
        handler.as_str(),
        codec.name(),
        sample_count,
        index.sample_count_idr,
        mdhd.timescale
    );

    Ok(Track {
        id: tkhd.id,
        handler,
        codec,
        timescale: mdhd.timescale,
        duration: mdhd.duration,
        width: coded_width,
        height: coded_height,
        chroma_format_idc,
        bit_depth,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn box_header_compact_and_large() {
        let mut data = Vec::new();
        data.extend_from_slice(&20u32.to_be_bytes());
        data.extend_from_slice(b"moov");
        let hdr = read_box_header(&mut Cursor::new(&data)).unwrap();
        assert_eq!(hdr.typ, *b"moov");
        assert_eq!(hdr.size, 20);
        assert_eq!(hdr.header_len, 8);

        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&0x1_0000_0000u64.to_be_bytes());
        let hdr = read_box_header(&mut Cursor::new(&data)).unwrap();
        assert_eq!(hdr.size, 0x1_0000_0000);
        assert_eq!(hdr.header_len, 16);
    }

    #[test]
    fn box_overrunning_parent_is_rejected() {
        let hdr = BoxHeader {
            typ: *b"stts",
            size: 100,
            header_len: 8,
        };
        assert!(safe_box_end("stbl", 0, &hdr, 50).is_err());

        let hdr = BoxHeader {
            typ: *b"stts",
            size: 4,
            header_len: 8,
        };
        assert!(safe_box_end("stbl", 0, &hdr, 50).is_err());
    }

    #[test]
    fn stsc_expansion_walks_chunks() {
        // Two chunks of 2 samples, then one chunk of 1.
        let stsc = vec![
            StscEntry {
                first_chunk: 1,
                samples_per_chunk: 2,
                sample_description_index: 1,
            },
            StscEntry {
                first_chunk: 3,
                samples_per_chunk: 1,
                sample_description_index: 1,
            },
        ];
        let chunk_offsets = vec![1000, 2000, 3000];
        let sizes = SampleSizes::PerSample(vec![10, 20, 30, 40, 50]);

        let offsets = build_sample_offsets(&stsc, &chunk_offsets, &sizes).unwrap();
        assert_eq!(offsets, vec![1000, 1010, 2000, 2030, 3000]);
    }

    #[test]
    fn stsc_expansion_detects_truncation() {
        let stsc = vec![StscEntry {
            first_chunk: 1,
            samples_per_chunk: 1,
            sample_description_index: 1,
        }];
        let chunk_offsets = vec![1000];
        let sizes = SampleSizes::PerSample(vec![10, 20]);
        assert!(build_sample_offsets(&stsc, &chunk_offsets, &sizes).is_err());
    }

    #[test]
    fn decode_times_prefix_sum() {
        let dts = build_decode_times(&[(3, 100), (2, 50)], 5);
        assert_eq!(dts, vec![0, 100, 200, 300, 350]);
    }

    #[test]
    fn composition_offsets_expand() {
        let ctts = build_composition_offsets(&[(2, 100), (1, -50)], 3);
        assert_eq!(ctts, vec![100, 100, -50]);
    }

    #[test]
    fn stz2_unpacks_nibbles() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes()); // version/flags
        data.extend_from_slice(&[0, 0, 0, 4]); // reserved + field_size
        data.extend_from_slice(&3u32.to_be_bytes()); // count
        data.push(0x5a);
        data.push(0x70);
        let sizes = parse_stz2(&mut Cursor::new(&data), 0, 0).unwrap();
        match sizes {
            SampleSizes::PerSample(v) => assert_eq!(v, vec![5, 10, 7]),
            _ => panic!("expected per-sample sizes"),
        }
    }

    #[test]
    fn avcc_record_roundtrip() {
        let sps_blob: &[u8] = &[
            0x67, 0x42, 0x00, 0x1f, 0xac, 0x34, 0xc8, 0x14, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00,
            0x00, 0x03, 0x00, 0xf0, 0x3c, 0x60, 0xc6, 0x58,
        ];
        let pps_blob: &[u8] = &[0x68, 0xee, 0x3c, 0x80];

        let mut data = Vec::new();
        data.push(1); // configurationVersion
        data.push(66); // profile
        data.push(0xc0);
        data.push(31); // level
        data.push(0xfc | 0b11); // lengthSizeMinusOne = 3
        data.push(0xe0 | 1); // 1 SPS
        data.extend_from_slice(&(sps_blob.len() as u16).to_be_bytes());
        data.extend_from_slice(sps_blob);
        data.push(1); // 1 PPS
        data.extend_from_slice(&(pps_blob.len() as u16).to_be_bytes());
        data.extend_from_slice(pps_blob);

        let config = parse_avcc(&mut Cursor::new(&data), 0).unwrap();
        assert_eq!(config.profile, 66);
        assert_eq!(config.level, 31);
        assert_eq!(config.length_size, 4);
        assert_eq!(config.sps.len(), 1);
        assert_eq!(config.sps[0], sps_blob);
        assert_eq!(config.pps[0], pps_blob);
        assert_eq!(config.sps_spans[0], (8, sps_blob.len() as u32));
    }
}
