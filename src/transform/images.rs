use anyhow::Context;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageFormat};

use super::{StageOptions, Transform, TransformJob};

/// Raster recompression via the `image` crate, keeping the source format.
///
/// GIFs and formats the encoder side doesn't cover pass through untouched.
pub(crate) struct Raster;

impl Transform for Raster {
    fn rewrite_ext(&self) -> Option<&'static str> {
        None
    }

    fn apply(&self, job: TransformJob<'_>) -> anyhow::Result<Vec<u8>> {
        let level = match job.options {
            StageOptions::Optimize(opts) => opts.compression_level,
            _ => 5,
        };

        let format = match image::guess_format(job.data) {
            Ok(format) => format,
            // Not a raster image we understand; leave the bytes alone.
            Err(_) => return Ok(job.data.to_vec()),
        };

        match format {
            ImageFormat::Png => recompress_png(job, level),
            ImageFormat::Jpeg => recompress_jpeg(job, level),
            _ => Ok(job.data.to_vec()),
        }
    }
}

fn recompress_png(job: TransformJob<'_>, level: u32) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory(job.data)
        .with_context(|| format!("decoding image '{}'", job.source))?;
    let (w, h) = (img.width(), img.height());

    let compression = match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    };

    let mut out = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut out, compression, FilterType::Adaptive);

    image::ImageEncoder::write_image(encoder, &img.to_rgba8(), w, h, ExtendedColorType::Rgba8)
        .with_context(|| format!("encoding image '{}'", job.source))?;

    Ok(out)
}

fn recompress_jpeg(job: TransformJob<'_>, level: u32) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory(job.data)
        .with_context(|| format!("decoding image '{}'", job.source))?;
    let (w, h) = (img.width(), img.height());

    let quality = (95 - level * 5).clamp(50, 95) as u8;

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);

    image::ImageEncoder::write_image(encoder, &img.to_rgb8(), w, h, ExtendedColorType::Rgb8)
        .with_context(|| format!("encoding image '{}'", job.source))?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    fn png_fixture() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([120, 30, 200, 255]));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_png_stays_png() {
        let data = png_fixture();
        let out = Raster
            .apply(TransformJob {
                source: Utf8Path::new("a.png"),
                data: &data,
                options: &StageOptions::Optimize(Default::default()),
            })
            .unwrap();

        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_unknown_bytes_pass_through() {
        let data = b"not an image".to_vec();
        let out = Raster
            .apply(TransformJob {
                source: Utf8Path::new("a.bin"),
                data: &data,
                options: &StageOptions::None,
            })
            .unwrap();

        assert_eq!(out, data);
    }
}
