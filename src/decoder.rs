use std::io::{Read, Seek, SeekFrom};

use log::{debug, info, warn};

use crate::bitreader::BitReader;
use crate::deblock::deblock_picture;
use crate::error::{Error, Result};
use crate::macroblock::MbGrid;
use crate::mp4::AvcConfig;
use crate::nal::{AnnexBUnits, Nal, NalUnitType, parse_sei_messages, rewrite_avcc_to_annex_b};
use crate::params::{ParameterSetStore, ScalingMatrix, Sps};
use crate::picture::{Picture, PictureSink};
use crate::samples::{SampleIndex, SampleKind};
use crate::slice::{SliceHeader, decode_slice_data};
use crate::transform::QuantTables;

/// Abort the run once this many access units failed without an intervening
/// success.
const ERROR_LIMIT: u32 = 64;

/// Read buffer floor; most coded samples fit without reallocation.
const SAMPLE_BUFFER_MIN: usize = 256 * 1024;

/// Per-run counters, exposed to the caller for exit-code mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeStats {
    pub idr_count: u32,
    pub frame_count: u32,
    pub error_count: u32,
    pub sink_errors: u32,
    pub pictures_written: u32,
    pub invalid_samples: u32,
}

/// Orchestrator phases over the filtered sample list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Build the ordered work list of media samples from the sample index.
    Indexing,
    /// Pick the next selected sample and materialise its access unit.
    Dispatching,
    /// Run the NAL loop over the materialised bytes.
    Decoding,
    /// Hand a completed picture to the sink.
    Emitting,
    Terminating,
}

/// Picture under reconstruction, alive from the first slice of an access
/// unit until emission.
struct CurrentPicture {
    grid: MbGrid,
    pic: Picture,
    crop_width: usize,
    crop_height: usize,
    chroma_qp_offset: i32,
    slice_count: u32,
}

/// H.264 decoding context: parameter-set state plus the picture in flight.
pub struct Decoder {
    store: ParameterSetStore,
    length_size: usize,
    config_stream: Vec<u8>,
    current: Option<CurrentPicture>,
    pub stats: DecodeStats,
}

impl Decoder {
    /// Build a context from the track's `avcC` record. The SPS/PPS blobs are
    /// spliced ahead of every access unit rather than pre-activated, so a
    /// stream that re-sends parameter sets overwrites them naturally.
    pub fn new(config: &AvcConfig) -> Self {
        let mut config_stream = Vec::new();
        for blob in config.sps.iter().chain(config.pps.iter()) {
            config_stream.extend_from_slice(&[0, 0, 0, 1]);
            config_stream.extend_from_slice(blob);
        }
        Self {
            store: ParameterSetStore::new(),
            length_size: config.length_size as usize,
            config_stream,
            current: None,
            stats: DecodeStats::default(),
        }
    }

    /// Decode the selected samples of `index`, emitting up to `target`
    /// pictures into `sink`. Returns the number of pictures written.
    ///
    /// Runs the Indexing -> Dispatching -> Decoding -> Emitting ->
    /// Terminating state machine: Indexing turns the (already demuxed and
    /// filtered) sample index into the run's work list; the remaining
    /// phases cycle once per access unit.
    pub fn run<R: Read + Seek>(
        &mut self,
        file: &mut R,
        index: &SampleIndex,
        target: u32,
        sink: &mut dyn PictureSink,
    ) -> Result<u32> {
        if target == 0 {
            return Ok(0);
        }

        let mut entries: Vec<usize> = Vec::new();
        let mut au = Vec::with_capacity(SAMPLE_BUFFER_MIN);
        let mut cursor = 0usize;
        let mut pending: Option<Picture> = None;
        let mut phase = Phase::Indexing;

        while phase != Phase::Terminating {
            phase = match phase {
                Phase::Indexing => {
                    entries = index
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.kind != SampleKind::Config)
                        .map(|(i, _)| i)
                        .collect();
                    debug!("indexed {} media samples for decoding", entries.len());
                    Phase::Dispatching
                }

                Phase::Dispatching => {
                    let Some(&entry_idx) = entries.get(cursor) else {
                        break;
                    };
                    cursor += 1;
                    let entry = &index.entries[entry_idx];

                    if !entry.valid {
                        self.stats.invalid_samples += 1;
                        self.stats.error_count += 1;
                        warn!(
                            "skipping invalid sample at offset {} ({} bytes)",
                            entry.byte_offset, entry.byte_size
                        );
                        self.check_error_limit()?;
                        Phase::Dispatching
                    } else if entry.kind != SampleKind::VideoIdr {
                        // Unfiltered runs still walk non-IDR samples; there
                        // is nothing to decode in them.
                        debug!("skipping non-IDR sample");
                        Phase::Dispatching
                    } else {
                        au.clear();
                        au.extend_from_slice(&self.config_stream);

                        let mut sample = vec![0u8; entry.byte_size as usize];
                        file.seek(SeekFrom::Start(entry.byte_offset))?;
                        file.read_exact(&mut sample)?;

                        match rewrite_avcc_to_annex_b(&sample, self.length_size, &mut au) {
                            Ok(()) => Phase::Decoding,
                            Err(e) => {
                                warn!("sample framing error: {e}");
                                self.stats.error_count += 1;
                                self.check_error_limit()?;
                                Phase::Dispatching
                            }
                        }
                    }
                }

                Phase::Decoding => {
                    let pts = index.entries[entries[cursor - 1]].pts;
                    match self.decode_access_unit(&au, pts) {
                        Ok(Some(picture)) => {
                            pending = Some(picture);
                            Phase::Emitting
                        }
                        Ok(None) => {
                            self.stats.error_count += 1;
                            self.check_error_limit()?;
                            Phase::Dispatching
                        }
                        Err(e) => return Err(e),
                    }
                }

                Phase::Emitting => {
                    let picture = pending.take().expect("picture pending in Emitting phase");
                    self.stats.idr_count += 1;
                    self.stats.frame_count += 1;
                    self.stats.error_count = 0;

                    match sink.emit(&picture, self.stats.pictures_written, picture.pts) {
                        Ok(()) => self.stats.pictures_written += 1,
                        Err(e) => {
                            warn!("picture sink failed: {e}");
                            self.stats.sink_errors += 1;
                            self.stats.error_count += 1;
                        }
                    }

                    if self.stats.idr_count >= target {
                        info!("decoded {} IDR pictures, stopping", self.stats.idr_count);
                        Phase::Terminating
                    } else {
                        Phase::Dispatching
                    }
                }

                Phase::Terminating => unreachable!(),
            };
        }

        Ok(self.stats.pictures_written)
    }

    fn check_error_limit(&self) -> Result<()> {
        if self.stats.error_count > ERROR_LIMIT {
            return Err(Error::TooManyErrors(self.stats.error_count));
        }
        Ok(())
    }

    /// NAL loop over one access unit. Returns the reconstructed picture, or
    /// None when the unit had to be abandoned (counted by the caller).
    fn decode_access_unit(&mut self, au: &[u8], pts: i64) -> Result<Option<Picture>> {
        self.current = None;
        let mut abandoned = false;

        for unit in AnnexBUnits::new(au) {
            let nal = match Nal::parse(unit) {
                Ok(nal) => nal,
                Err(e) => {
                    warn!("bad NAL unit: {e}");
                    abandoned = true;
                    continue;
                }
            };

            match nal.unit_type {
                // Parameter-set failures only matter if they leave the store
                // without the sets a slice needs; the slice reports that.
                NalUnitType::Sps => match Sps::parse(&nal.to_rbsp()) {
                    Ok(sps) => self.store.put_sps(sps),
                    Err(e) => warn!("SPS parse failed: {e}"),
                },
                NalUnitType::Pps => match crate::params::Pps::parse(&nal.to_rbsp(), &self.store) {
                    Ok(pps) => self.store.put_pps(pps),
                    Err(e) => warn!("PPS parse failed: {e}"),
                },
                NalUnitType::Sei => self.handle_sei(&nal.to_rbsp()),
                NalUnitType::IdrSlice => {
                    if let Err(e) = self.decode_idr_slice(&nal.to_rbsp(), pts) {
                        warn!("IDR slice abandoned: {e}");
                        self.current = None;
                        abandoned = true;
                    }
                }
                NalUnitType::NonIdrSlice => {
                    debug!("non-IDR slice skipped (intra-only decoder)");
                }
                NalUnitType::AccessUnitDelimiter
                | NalUnitType::EndOfSequence
                | NalUnitType::EndOfStream
                | NalUnitType::Filler => {}
                NalUnitType::Other(t) => {
                    debug!("unsupported NAL unit type {t} skipped");
                }
            }
        }

        if abandoned {
            self.current = None;
            return Ok(None);
        }

        Ok(self.finish_picture())
    }

    fn decode_idr_slice(&mut self, rbsp: &[u8], pts: i64) -> Result<()> {
        let mut reader = BitReader::new(rbsp);
        let header = SliceHeader::parse(&mut reader, true, &self.store)?;
        let (sps, pps) = self.store.active_pair(header.pic_parameter_set_id)?;

        let matrix = pps
            .scaling_matrix
            .clone()
            .or_else(|| sps.scaling_matrix.clone())
            .unwrap_or_else(ScalingMatrix::flat);
        let quant = QuantTables::new(&matrix);

        if header.first_mb_in_slice == 0 || self.current.is_none() {
            let width_mbs = sps.pic_width_in_mbs as usize;
            let height_mbs = sps.pic_height_in_mbs() as usize;
            self.current = Some(CurrentPicture {
                grid: MbGrid::new(width_mbs, height_mbs),
                pic: Picture::new(width_mbs * 16, height_mbs * 16, pts),
                crop_width: sps.width() as usize,
                crop_height: sps.height() as usize,
                chroma_qp_offset: pps.chroma_qp_index_offset,
                slice_count: 0,
            });
        }

        let pps = pps.clone();
        let current = self.current.as_mut().expect("picture allocated above");
        current.slice_count += 1;
        decode_slice_data(
            &mut reader,
            &header,
            &pps,
            &quant,
            &mut current.grid,
            &mut current.pic,
            current.slice_count,
        )
    }

    /// Deblock and crop the picture once every macroblock is in.
    fn finish_picture(&mut self) -> Option<Picture> {
        let current = self.current.take()?;
        let CurrentPicture {
            grid,
            mut pic,
            crop_width,
            crop_height,
            chroma_qp_offset,
            ..
        } = current;

        let missing = grid.mbs.iter().filter(|m| !m.decoded).count();
        if missing > 0 {
            warn!("picture incomplete: {missing} macroblocks missing");
            return None;
        }

        deblock_picture(&mut pic, &grid, chroma_qp_offset);
        Some(pic.cropped(crop_width, crop_height))
    }

    fn handle_sei(&self, rbsp: &[u8]) {
        for (payload_type, payload) in parse_sei_messages(rbsp) {
            match payload_type {
                6 => {
                    // Recovery point: log the frame count for diagnostics.
                    let mut r = BitReader::new(&payload);
                    if let Ok(recovery_frame_cnt) = r.read_ue() {
                        debug!("SEI recovery point: recovery_frame_cnt {recovery_frame_cnt}");
                    }
                }
                0 => debug!("SEI buffering period"),
                1 => debug!("SEI picture timing"),
                other => debug!("SEI payload type {other} ({} bytes) skipped", payload.len()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::CollectSink;
    use crate::samples::{SampleEntry, StreamKind};
    use std::io::Cursor;

    /// In-memory "file" with one coded sample that decodes to a flat gray
    /// 16x16 IDR picture, plus the avcC-style config blobs.
    fn gray_fixture() -> (Vec<u8>, AvcConfig, SampleIndex) {
        use crate::bitreader::BitWriter;
        use crate::nal::rbsp_to_ebsp;

        // SPS for a single-macroblock picture (see slice tests).
        let mut w = BitWriter::new();
        w.put_bits(66, 8);
        w.put_bits(0, 8);
        w.put_bits(10, 8);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(2);
        w.put_ue(1);
        w.put_bit(false);
        w.put_ue(0);
        w.put_ue(0);
        w.put_bit(true);
        w.put_bit(true);
        w.put_bit(false);
        w.put_bit(false);
        let mut sps_blob = vec![0x67];
        sps_blob.extend(rbsp_to_ebsp(&w.finish()));

        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(0);
        w.put_bit(false);
        w.put_bit(false);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(0);
        w.put_bit(false);
        w.put_bits(0, 2);
        w.put_se(0);
        w.put_se(0);
        w.put_se(0);
        w.put_bit(true);
        w.put_bit(false);
        w.put_bit(false);
        let mut pps_blob = vec![0x68];
        pps_blob.extend(rbsp_to_ebsp(&w.finish()));

        // IDR slice: gray I_16x16 macroblock.
        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(2);
        w.put_ue(0);
        w.put_bits(0, 4);
        w.put_ue(0);
        w.put_bit(false);
        w.put_bit(false);
        w.put_se(0);
        w.put_ue(1);
        w.put_ue(3);
        w.put_ue(0);
        w.put_se(0);
        w.put_bit(true);
        let mut idr_nal = vec![0x65];
        idr_nal.extend(rbsp_to_ebsp(&w.finish()));

        // Length-prefixed sample as it would sit in mdat.
        let mut file = vec![0u8; 16]; // unrelated leading bytes
        let sample_offset = file.len() as u64;
        file.extend_from_slice(&(idr_nal.len() as u32).to_be_bytes());
        file.extend_from_slice(&idr_nal);
        let sample_size = (file.len() as u64 - sample_offset) as u32;

        let config = AvcConfig {
            profile: 66,
            profile_compat: 0,
            level: 10,
            length_size: 4,
            sps: vec![sps_blob],
            pps: vec![pps_blob],
            sps_spans: vec![(0, 0)],
            pps_spans: vec![(0, 0)],
        };

        let mut index = SampleIndex::new(StreamKind::Video);
        index.push(SampleEntry {
            kind: SampleKind::VideoIdr,
            byte_offset: sample_offset,
            byte_size: sample_size,
            pts: 9000,
            dts: 9000,
            valid: true,
        });

        (file, config, index)
    }

    #[test]
    fn decodes_gray_idr_end_to_end() {
        let (file, config, index) = gray_fixture();
        let mut decoder = Decoder::new(&config);
        let mut sink = CollectSink::default();

        let written = decoder
            .run(&mut Cursor::new(&file), &index, 1, &mut sink)
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(decoder.stats.idr_count, 1);
        assert_eq!(decoder.stats.error_count, 0);
        let pic = &sink.pictures[0];
        assert_eq!((pic.width, pic.height), (16, 16));
        assert_eq!(pic.pts, 9000);
        assert!(pic.y.data.iter().all(|&v| v == 128));
    }

    #[test]
    fn zero_target_writes_nothing() {
        let (file, config, index) = gray_fixture();
        let mut decoder = Decoder::new(&config);
        let mut sink = CollectSink::default();
        let written = decoder
            .run(&mut Cursor::new(&file), &index, 0, &mut sink)
            .unwrap();
        assert_eq!(written, 0);
        assert!(sink.pictures.is_empty());
    }

    #[test]
    fn invalid_entries_are_skipped_and_counted() {
        let (file, config, mut index) = gray_fixture();
        index.entries[0].valid = false;
        let mut decoder = Decoder::new(&config);
        let mut sink = CollectSink::default();
        let written = decoder
            .run(&mut Cursor::new(&file), &index, 1, &mut sink)
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(decoder.stats.invalid_samples, 1);
        assert_eq!(decoder.stats.error_count, 1);
    }

    #[test]
    fn sink_failure_counts_but_does_not_abort() {
        struct FailingSink;
        impl PictureSink for FailingSink {
            fn emit(&mut self, _: &Picture, _: u32, _: i64) -> Result<()> {
                Err(Error::Sink("disk full".into()))
            }
        }

        let (file, config, index) = gray_fixture();
        let mut decoder = Decoder::new(&config);
        let written = decoder
            .run(&mut Cursor::new(&file), &index, 1, &mut FailingSink)
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(decoder.stats.idr_count, 1);
        assert_eq!(decoder.stats.sink_errors, 1);
    }
}
