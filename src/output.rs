use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::picture::{Picture, PictureSink};

/// Still-image container for emitted thumbnails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
    Tga,
    /// Raw planar YCbCr dump, Y then Cb then Cr.
    Yuv420p,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tga => "tga",
            ImageFormat::Yuv420p => "yuv",
        }
    }
}

/// Video-range YCbCr to RGB, integer arithmetic.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = cb as i32 - 128;
    let e = cr as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

/// Interleave the planar picture into RGB, upsampling chroma by replication.
pub fn picture_to_rgb(picture: &Picture) -> RgbImage {
    let mut img = RgbImage::new(picture.width as u32, picture.height as u32);
    for y in 0..picture.height {
        for x in 0..picture.width {
            let luma = picture.y.get(x, y);
            let cb = picture.cb.get(x / 2, y / 2);
            let cr = picture.cr.get(x / 2, y / 2);
            img.put_pixel(x as u32, y as u32, image::Rgb(ycbcr_to_rgb(luma, cb, cr)));
        }
    }
    img
}

/// Writes each emitted picture as `<stem>_<index>.<ext>` in the output
/// directory.
pub struct ImageWriter {
    dir: PathBuf,
    stem: String,
    format: ImageFormat,
    quality: u8,
}

impl ImageWriter {
    pub fn new(dir: &Path, stem: &str, format: ImageFormat, quality: u8) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            format,
            quality: quality.clamp(1, 100),
        }
    }

    fn target_path(&self, ordinal: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{}.{}", self.stem, ordinal, self.format.extension()))
    }
}

impl PictureSink for ImageWriter {
    fn emit(&mut self, picture: &Picture, ordinal: u32, pts: i64) -> Result<()> {
        let path = self.target_path(ordinal);
        debug!(
            "writing {}x{} picture (pts {pts}) to {}",
            picture.width,
            picture.height,
            path.display()
        );

        let sink_err = |e: &dyn std::fmt::Display| Error::Sink(format!("{}: {e}", path.display()));

        match self.format {
            ImageFormat::Yuv420p => {
                let file = File::create(&path).map_err(|e| sink_err(&e))?;
                let mut out = BufWriter::new(file);
                out.write_all(&picture.y.data).map_err(|e| sink_err(&e))?;
                out.write_all(&picture.cb.data).map_err(|e| sink_err(&e))?;
                out.write_all(&picture.cr.data).map_err(|e| sink_err(&e))?;
                out.flush().map_err(|e| sink_err(&e))?;
            }
            ImageFormat::Jpeg => {
                let img = picture_to_rgb(picture);
                let file = File::create(&path).map_err(|e| sink_err(&e))?;
                let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), self.quality);
                img.write_with_encoder(encoder).map_err(|e| sink_err(&e))?;
            }
            ImageFormat::Png | ImageFormat::Bmp | ImageFormat::Tga => {
                let img = picture_to_rgb(picture);
                let fmt = match self.format {
                    ImageFormat::Png => image::ImageFormat::Png,
                    ImageFormat::Bmp => image::ImageFormat::Bmp,
                    _ => image::ImageFormat::Tga,
                };
                img.save_with_format(&path, fmt).map_err(|e| sink_err(&e))?;
            }
        }

        info!("wrote {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_picture() -> Picture {
        let mut pic = Picture::new(32, 16, 0);
        for y in 0..16 {
            for x in 0..32 {
                pic.y.set(x, y, (x * 8) as u8);
            }
        }
        for y in 0..8 {
            for x in 0..16 {
                pic.cb.set(x, y, 128);
                pic.cr.set(x, y, 128);
            }
        }
        pic
    }

    #[test]
    fn conversion_handles_range_extremes() {
        assert_eq!(ycbcr_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(ycbcr_to_rgb(235, 128, 128), [255, 255, 255]);
        // Mid gray stays neutral.
        let [r, g, b] = ycbcr_to_rgb(126, 128, 128);
        assert_eq!(r, g);
        assert_eq!(g, b);
    }

    #[test]
    fn rgb_image_matches_dimensions() {
        let img = picture_to_rgb(&gradient_picture());
        assert_eq!(img.dimensions(), (32, 16));
        // Gray chroma keeps the gradient monochrome.
        let p = img.get_pixel(20, 5);
        assert_eq!(p.0[0], p.0[1]);
    }

    #[test]
    fn yuv_dump_is_planar_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ImageWriter::new(dir.path(), "clip", ImageFormat::Yuv420p, 75);
        writer.emit(&gradient_picture(), 0, 0).unwrap();

        let data = std::fs::read(dir.path().join("clip_0.yuv")).unwrap();
        assert_eq!(data.len(), 32 * 16 + 2 * (16 * 8));
        assert_eq!(data[0], 0);
        assert_eq!(data[31], 248);
    }

    #[test]
    fn png_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ImageWriter::new(dir.path(), "clip", ImageFormat::Png, 75);
        writer.emit(&gradient_picture(), 3, 0).unwrap();

        let img = image::open(dir.path().join("clip_3.png")).unwrap();
        assert_eq!(img.width(), 32);
        assert_eq!(img.height(), 16);
    }

    #[test]
    fn unwritable_directory_is_a_sink_error() {
        let mut writer = ImageWriter::new(
            Path::new("/nonexistent-vidthumb-test"),
            "clip",
            ImageFormat::Yuv420p,
            75,
        );
        let err = writer.emit(&gradient_picture(), 0, 0).unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(err.exit_code(), 5);
    }
}
