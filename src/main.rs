use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use vidthumb::{ExtractOptions, ExtractionMode, ImageFormat, extract_thumbnails, probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Jpeg,
    Png,
    Bmp,
    Tga,
    Yuv420p,
}

impl From<FormatArg> for ImageFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Jpeg => ImageFormat::Jpeg,
            FormatArg::Png => ImageFormat::Png,
            FormatArg::Bmp => ImageFormat::Bmp,
            FormatArg::Tga => ImageFormat::Tga,
            FormatArg::Yuv420p => ImageFormat::Yuv420p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Unfiltered,
    Ordered,
    Distributed,
}

impl From<ModeArg> for ExtractionMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Unfiltered => ExtractionMode::Unfiltered,
            ModeArg::Ordered => ExtractionMode::Ordered,
            ModeArg::Distributed => ExtractionMode::Distributed,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vidthumb")]
#[command(about = "Extract still-image thumbnails from MP4 video files", long_about = None)]
struct Cli {
    /// Input MP4/MOV file
    #[arg(value_name = "INPUT.mp4")]
    input: PathBuf,

    /// Output directory for the extracted pictures
    #[arg(short = 'o', long = "output", value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Picture file format
    #[arg(long = "format", value_enum, default_value_t = FormatArg::Jpeg)]
    format: FormatArg,

    /// Number of thumbnails to extract
    #[arg(short = 'n', long = "count", value_name = "N", default_value_t = 1)]
    count: u32,

    /// How thumbnails are picked from the available IDR frames
    #[arg(long = "mode", value_enum, default_value_t = ModeArg::Distributed)]
    mode: ModeArg,

    /// JPEG quality [1-100]
    #[arg(short = 'q', long = "quality", value_name = "Q", default_value_t = 75)]
    quality: u8,

    /// Print per-track container metadata as JSON and exit
    #[arg(long = "dump-index", action = clap::ArgAction::SetTrue)]
    dump_index: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.dump_index {
        return match probe(&cli.input) {
            Ok(tracks) => {
                // probe output is machine-readable; everything else logs.
                println!(
                    "{}",
                    serde_json::to_string_pretty(&tracks).expect("track info serialises")
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("vidthumb: {e}");
                ExitCode::from(e.exit_code() as u8)
            }
        };
    }

    let options = ExtractOptions {
        format: cli.format.into(),
        quality: cli.quality.clamp(1, 100),
        count: cli.count.max(1),
        mode: cli.mode.into(),
    };

    match extract_thumbnails(&cli.input, &cli.output, &options) {
        Ok(written) => {
            println!("{written} picture(s) written to {}", cli.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("vidthumb: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
