use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Passthrough for IO errors (open/read/seek).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// MP4 structure is malformed or violates expected ISO-BMFF invariants.
    #[error("mp4 parse error in {context}: box {box_type} at offset {offset}: {message}")]
    Mp4InvalidBox {
        context: &'static str,
        box_type: String,
        offset: u64,
        message: String,
    },

    /// Required tables/structures for extraction are missing.
    #[error("mp4 missing required sample tables: {missing}")]
    Mp4MissingSampleTables { missing: String },

    /// MP4 sample tables are internally inconsistent.
    #[error(
        "mp4 inconsistent sample tables: sample_sizes={sample_sizes} derived_offsets={sample_offsets} chunk_offsets={chunk_offsets}"
    )]
    Mp4InconsistentSampleTables {
        sample_sizes: usize,
        sample_offsets: usize,
        chunk_offsets: usize,
    },

    /// Sample data points outside the file and nothing could be decoded.
    #[error("mp4 sample data out of file bounds ({invalid} invalid samples)")]
    Mp4SamplesOutOfBounds { invalid: usize },

    /// The video track's codec is not one this crate decodes.
    #[error("unsupported video codec: {0}")]
    UnsupportedCodec(String),

    /// The container was parsed but no usable video track was found.
    #[error("no video track with sample tables found")]
    NoVideoTrack,

    /// The video track exists but contains no random-access points.
    #[error("no IDR samples in the video track")]
    NoSyncSamples,

    /// Ran out of bits, or a syntax element was out of range.
    #[error("bitstream error: {0}")]
    Bitstream(String),

    #[error("malformed sequence parameter set: {0}")]
    MalformedSps(String),

    #[error("malformed picture parameter set: {0}")]
    MalformedPps(String),

    #[error("no sequence parameter set with id {0}")]
    MissingSps(u8),

    #[error("no picture parameter set with id {0}")]
    MissingPps(u8),

    /// The bitstream uses a coding tool outside the supported profile subset.
    #[error("unsupported bitstream feature: {0}")]
    Unsupported(String),

    #[error("slice decode error: {0}")]
    Slice(String),

    /// Cumulative per-access-unit error count crossed the abort threshold.
    #[error("decoder error count exceeded {0}")]
    TooManyErrors(u32),

    /// Every selected picture failed to be written by the sink.
    #[error("picture sink error: {0}")]
    Sink(String),
}

impl Error {
    /// Process exit code for the CLI shell.
    ///
    /// 0 is reserved for success with at least one picture written.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_)
            | Error::Mp4InvalidBox { .. }
            | Error::Mp4MissingSampleTables { .. }
            | Error::Mp4InconsistentSampleTables { .. }
            | Error::Mp4SamplesOutOfBounds { .. }
            | Error::UnsupportedCodec(_) => 1,
            Error::NoVideoTrack => 2,
            Error::NoSyncSamples => 3,
            Error::Bitstream(_)
            | Error::MalformedSps(_)
            | Error::MalformedPps(_)
            | Error::MissingSps(_)
            | Error::MissingPps(_)
            | Error::Unsupported(_)
            | Error::Slice(_)
            | Error::TooManyErrors(_) => 4,
            Error::Sink(_) => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
