//! Watermark subsystem
//!
//! At most one watermark source (inline base64, file path or URL) is
//! loaded at startup through the same guarded ingestion path as
//! request sources, decoded once and cached for the process. The
//! configured global opacity and the per-request directives are both
//! applied at composite time, so the stored image keeps its original
//! alpha.

use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::RgbaImage;

use crate::config::Config;
use crate::error::ServiceError;
use crate::fetch::Fetcher;
use crate::options::WatermarkOptions;
use crate::pipeline::{backend, geometry};
use crate::server::deadline::Deadline;

/// The process-wide watermark image. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Watermark {
    image: RgbaImage,
    /// Global opacity from configuration, multiplied with the
    /// per-request opacity at composite time.
    opacity: f64,
}

impl Watermark {
    /// Loads the configured watermark source, if any.
    pub async fn load(conf: &Config, fetcher: &Fetcher) -> anyhow::Result<Option<Watermark>> {
        let fetched = if !conf.watermark_data.is_empty() {
            let bytes = STANDARD
                .decode(&conf.watermark_data)
                .context("can't decode watermark data")?;
            Some(fetcher.ingest(bytes).map_err(|e| {
                anyhow::anyhow!("can't decode watermark: {}", e.internal_message())
            })?)
        } else if !conf.watermark_path.is_empty() {
            let bytes = std::fs::read(&conf.watermark_path)
                .with_context(|| format!("can't read watermark: {}", conf.watermark_path))?;
            Some(fetcher.ingest(bytes).map_err(|e| {
                anyhow::anyhow!("can't read watermark: {}", e.internal_message())
            })?)
        } else if !conf.watermark_url.is_empty() {
            let deadline = Deadline::after(Duration::from_secs(conf.download_timeout));
            Some(
                fetcher
                    .download(&conf.watermark_url, deadline)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("can't download watermark: {}", e.internal_message())
                    })?,
            )
        } else {
            None
        };

        let Some(fetched) = fetched else {
            return Ok(None);
        };

        let decoded = backend::decode(fetched.data.bytes(), fetched.data.format)
            .map_err(|e| anyhow::anyhow!("can't decode watermark: {}", e.internal_message()))?;

        Ok(Some(Watermark {
            image: decoded.image,
            opacity: conf.watermark_opacity,
        }))
    }

    /// Builds a watermark directly from a decoded image; used by tests
    /// and embedded setups.
    pub fn from_image(image: RgbaImage, opacity: f64) -> Watermark {
        Watermark { image, opacity }
    }

    /// Composites the watermark onto `image` per the request
    /// directives: scale, replicate or embed with gravity, then an
    /// alpha blend that preserves the image's own alpha channel.
    pub fn apply(
        &self,
        image: RgbaImage,
        opts: &WatermarkOptions,
    ) -> Result<RgbaImage, ServiceError> {
        let (img_w, img_h) = image.dimensions();

        let scaled = if opts.scale > 0.0 {
            let box_w = ((f64::from(img_w) * opts.scale) as u32).max(1);
            let box_h = ((f64::from(img_h) * opts.scale) as u32).max(1);
            self.scaled_to_fit(box_w, box_h)?
        } else {
            self.image.clone()
        };

        // Build a full-canvas overlay so the blend below is uniform.
        let overlay = if opts.replicate {
            backend::replicate(&scaled, img_w, img_h)
        } else {
            let (left, top) = geometry::calc_embed(
                img_w,
                img_h,
                scaled.width(),
                scaled.height(),
                &opts.gravity,
                opts.offset_x,
                opts.offset_y,
            );
            backend::embed(&scaled, img_w, img_h, left, top, None)
        };

        let opacity = (self.opacity * opts.opacity).clamp(0.0, 1.0);
        Ok(blend(image, &overlay, opacity))
    }

    /// Aspect-fit resize into a bounding box, never collapsing below
    /// one pixel.
    fn scaled_to_fit(&self, box_w: u32, box_h: u32) -> Result<RgbaImage, ServiceError> {
        let (wm_w, wm_h) = self.image.dimensions();
        let wr = f64::from(box_w) / f64::from(wm_w);
        let hr = f64::from(box_h) / f64::from(wm_h);
        let mut scale = wr.min(hr);

        if f64::from(wm_w) * scale < 1.0 {
            scale = 1.0 / f64::from(wm_w);
        }
        if f64::from(wm_h) * scale < 1.0 {
            scale = 1.0 / f64::from(wm_h);
        }

        backend::resize(self.image.clone(), scale, true, false)
    }
}

/// Source-over blend of the overlay's color channels weighted by its
/// alpha and the effective opacity; the base image's alpha channel is
/// left untouched.
fn blend(mut image: RgbaImage, overlay: &RgbaImage, opacity: f64) -> RgbaImage {
    for (dst, src) in image.pixels_mut().zip(overlay.pixels()) {
        let alpha = f64::from(src[3]) / 255.0 * opacity;
        if alpha <= 0.0 {
            continue;
        }
        for c in 0..3 {
            let blended = f64::from(src[c]) * alpha + f64::from(dst[c]) * (1.0 - alpha);
            dst[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Gravity, GravityKind};
    use image::Rgba;

    fn base(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]))
    }

    fn white_mark(width: u32, height: u32) -> Watermark {
        Watermark::from_image(
            RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])),
            1.0,
        )
    }

    fn opts() -> WatermarkOptions {
        WatermarkOptions {
            enabled: true,
            opacity: 1.0,
            replicate: false,
            gravity: Gravity::new(GravityKind::SouthEast),
            offset_x: 0,
            offset_y: 0,
            scale: 0.0,
        }
    }

    #[test]
    fn test_embed_south_east() {
        let out = white_mark(4, 4).apply(base(16, 16), &opts()).unwrap();
        // Bottom-right corner carries the mark, top-left does not.
        assert_eq!(out.get_pixel(15, 15), &Rgba([255, 255, 255, 255]));
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_replicate_covers_canvas() {
        let mut o = opts();
        o.replicate = true;
        let out = white_mark(4, 4).apply(base(16, 16), &o).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(out.get_pixel(15, 15), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_opacity_blends() {
        let mut o = opts();
        o.opacity = 0.5;
        o.replicate = true;
        let out = white_mark(4, 4).apply(base(16, 16), &o).unwrap();
        let pixel = out.get_pixel(8, 8);
        assert!(pixel[0] > 100 && pixel[0] < 155, "got {:?}", pixel);
    }

    #[test]
    fn test_global_opacity_multiplies() {
        let mark = Watermark::from_image(
            RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255])),
            0.5,
        );
        let mut o = opts();
        o.opacity = 0.5;
        o.replicate = true;
        let out = mark.apply(base(8, 8), &o).unwrap();
        let pixel = out.get_pixel(4, 4);
        // 0.5 * 0.5 = 0.25 effective opacity.
        assert!(pixel[0] > 40 && pixel[0] < 90, "got {:?}", pixel);
    }

    #[test]
    fn test_scale_relative_to_image() {
        let mut o = opts();
        o.scale = 0.5;
        o.gravity = Gravity::new(GravityKind::NorthWest);
        let out = white_mark(100, 100).apply(base(64, 64), &o).unwrap();
        // Watermark fits a 32x32 box: inside is white, outside black.
        assert_eq!(out.get_pixel(10, 10), &Rgba([255, 255, 255, 255]));
        assert_eq!(out.get_pixel(50, 50), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_transparent_watermark_pixels_skip() {
        let mark = Watermark::from_image(
            RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 0])),
            1.0,
        );
        let mut o = opts();
        o.replicate = true;
        let out = mark.apply(base(8, 8), &o).unwrap();
        assert_eq!(out.get_pixel(4, 4), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_base_alpha_preserved() {
        let base = RgbaImage::from_pixel(8, 8, Rgba([10, 10, 10, 128]));
        let mut o = opts();
        o.replicate = true;
        let out = white_mark(2, 2).apply(base, &o).unwrap();
        assert!(out.pixels().all(|p| p[3] == 128));
    }
}
