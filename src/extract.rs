use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use log::{debug, info, warn};
use serde::Serialize;

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::filter::{ExtractionMode, idr_filter};
use crate::mp4::{Codec, HandlerKind, Mp4, Track, parse_mp4};
use crate::output::{ImageFormat, ImageWriter};
use crate::picture::PictureSink;

/// Everything the thumbnail pipeline needs besides the input file.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub format: ImageFormat,
    /// JPEG quality, 1..=100.
    pub quality: u8,
    /// Number of thumbnails to extract.
    pub count: u32,
    pub mode: ExtractionMode,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            quality: 75,
            count: 1,
            mode: ExtractionMode::Distributed,
        }
    }
}

/// Extract thumbnails from `input` into `output_dir`.
///
/// Returns the number of pictures actually written. Output files are named
/// `<stem>_<index>.<ext>` after the input file stem.
pub fn extract_thumbnails(input: &Path, output_dir: &Path, options: &ExtractOptions) -> Result<u32> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "thumbnail".to_string());
    let mut sink = ImageWriter::new(output_dir, &stem, options.format, options.quality);

    let mut file = File::open(input)?;
    extract_to_sink(&mut file, options.count, options.mode, &mut sink)
}

/// Core pipeline over any seekable reader: demux, select, decode, emit.
pub fn extract_to_sink<R: Read + Seek>(
    reader: &mut R,
    count: u32,
    mode: ExtractionMode,
    sink: &mut dyn PictureSink,
) -> Result<u32> {
    let mp4 = parse_mp4(reader)?;
    let track = select_video_track(&mp4)?;
    let config = match &track.codec {
        Codec::Avc(config) => config.clone(),
        Codec::Unknown(fourcc) => {
            return Err(Error::UnsupportedCodec(
                fourcc.iter().map(|&c| c as char).collect(),
            ));
        }
    };

    info!(
        "video track {}: {}x{}, {} samples, {} IDR",
        track.id,
        track.width,
        track.height,
        track.index.media_entries().count(),
        track.index.sample_count_idr
    );

    if track.index.sample_count_idr == 0 {
        return Err(Error::NoSyncSamples);
    }

    let (index, selected) = idr_filter(track.index.clone(), count as usize, mode);
    if count > 0 && selected == 0 {
        warn!("no IDR samples survived filtering");
        return Err(Error::NoSyncSamples);
    }
    debug!("selected {selected} of {} IDR samples", track.index.sample_count_idr);

    let mut decoder = Decoder::new(&config);
    let written = decoder.run(reader, &index, selected as u32, sink)?;

    if written == 0 && count > 0 {
        let stats = decoder.stats;
        if stats.sink_errors > 0 {
            return Err(Error::Sink(format!(
                "{} picture(s) decoded but none could be written",
                stats.idr_count
            )));
        }
        if stats.invalid_samples > 0 {
            return Err(Error::Mp4SamplesOutOfBounds {
                invalid: stats.invalid_samples as usize,
            });
        }
        return Err(Error::Slice(format!(
            "no picture decoded ({} access-unit errors)",
            stats.error_count
        )));
    }

    Ok(written)
}

fn select_video_track(mp4: &Mp4) -> Result<&Track> {
    // Files sometimes carry a tiny preview track next to the main program;
    // pick the video track with the most samples.
    mp4.tracks
        .iter()
        .filter(|t| t.handler == HandlerKind::Video)
        .max_by_key(|t| t.index.media_entries().count())
        .ok_or(Error::NoVideoTrack)
}

/// Track-level metadata surfaced by `--dump-index` and the library probe.
#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub id: u32,
    pub handler: &'static str,
    pub codec: String,
    pub timescale: u32,
    pub duration: u64,
    pub width: u16,
    pub height: u16,
    pub chroma_format_idc: u8,
    pub bit_depth: u8,
    pub sample_count: usize,
    pub idr_count: usize,
    pub config_count: usize,
}

/// Parse the container and report per-track metadata without decoding.
pub fn probe(input: &Path) -> Result<Vec<TrackInfo>> {
    let mut file = File::open(input)?;
    let mp4 = parse_mp4(&mut file)?;
    Ok(mp4
        .tracks
        .iter()
        .map(|t| TrackInfo {
            id: t.id,
            handler: t.handler.as_str(),
            codec: t.codec.name(),
            timescale: t.timescale,
            duration: t.duration,
            width: t.width,
            height: t.height,
            chroma_format_idc: t.chroma_format_idc,
            bit_depth: t.bit_depth,
            sample_count: t.index.media_entries().count(),
            idr_count: t.index.sample_count_idr,
            config_count: t.index.config_count,
        })
        .collect())
}
