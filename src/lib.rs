//! `vidthumb` extracts still-image thumbnails from MP4-family video files.
//!
//! The pipeline demuxes the ISO base media container, indexes the coded
//! samples of the video track, picks a requested number of IDR frames spread
//! across the program, decodes them with the built-in H.264 intra decoder
//! (Baseline/Main/High, 4:2:0, 8-bit, CAVLC) and hands the reconstructed
//! pictures to an image sink.
//!
//! ## Quick start
//! - [`extract_thumbnails`] runs the whole pipeline against a file path and
//!   writes images into a directory.
//! - [`extract_to_sink`] does the same over any `Read + Seek` input with a
//!   custom [`PictureSink`], which is the flexible entry point for embedding.
//! - [`probe`] parses the container and returns per-track metadata only.

pub mod error;

pub mod bitreader;
pub mod cavlc;
pub mod deblock;
pub mod decoder;
pub mod filter;
pub mod intra;
pub mod macroblock;
pub mod mp4;
pub mod nal;
pub mod params;
pub mod picture;
pub mod samples;
pub mod slice;
pub mod transform;

mod output;

pub mod extract;

pub use error::Error;
pub use extract::{ExtractOptions, TrackInfo, extract_thumbnails, extract_to_sink, probe};
pub use filter::ExtractionMode;
pub use output::ImageFormat;
pub use picture::{Picture, PictureSink};
