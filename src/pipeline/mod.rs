//! Transform engine
//!
//! The strict stage sequence from source bytes to encoded output:
//! format resolution, SVG passthrough, EXIF orientation planning,
//! scale computation with decoder pre-shrink, resize, orientation fix,
//! crops, flatten, blur/sharpen, extend, watermark and encoding. The
//! whole engine runs synchronously on one OS thread per request; the
//! deadline token is consulted before each major stage.

pub mod animation;
pub mod backend;
pub mod geometry;

use image::RgbaImage;

use crate::error::ServiceError;
use crate::fetch::ImageData;
use crate::meta::ImageMeta;
use crate::options::{Color, GravityKind, ImageType, ProcessingOptions};
use crate::server::deadline::Deadline;
use crate::watermark::Watermark;
use backend::{EncodeParams, Orientation};

/// Immutable per-process pipeline settings.
pub struct PipelineContext<'a> {
    pub jpeg_progressive: bool,
    pub png_interlaced: bool,
    pub use_linear_colorspace: bool,
    pub max_animation_frames: usize,
    pub max_src_resolution: u64,
    pub max_src_dimension: u32,
    pub watermark: Option<&'a Watermark>,
}

/// The encoded result with its final type and dimensions.
#[derive(Debug)]
pub struct ProcessedImage {
    pub data: Vec<u8>,
    pub format: ImageType,
    pub width: u32,
    pub height: u32,
}

/// Everything a single frame transform needs, computed once per
/// request and shared with the animated path.
pub(crate) struct FramePlan<'a> {
    pub po: &'a ProcessingOptions,
    pub target_format: ImageType,
    pub source_type: ImageType,
    pub orientation: Orientation,
    pub linear: bool,
    pub watermark: Option<&'a Watermark>,
    /// Decoder pre-shrink only applies to still images.
    pub allow_scale_on_load: bool,
}

/// Runs the full pipeline over an ingested source.
pub fn process_image(
    data: &ImageData,
    meta: &ImageMeta,
    po: &ProcessingOptions,
    ctx: &PipelineContext,
    deadline: Deadline,
) -> Result<ProcessedImage, ServiceError> {
    let source_type = data.format;
    let target_format = resolve_format(source_type, po);

    // SVG never enters the raster pipeline: same-format requests pass
    // the document through verbatim, everything else is unsupported.
    if target_format == ImageType::Svg {
        if source_type == ImageType::Svg {
            return Ok(ProcessedImage {
                data: data.bytes().to_vec(),
                format: ImageType::Svg,
                width: meta.width,
                height: meta.height,
            });
        }
        return Err(ServiceError::SvgConversionUnsupported);
    }
    if source_type == ImageType::Svg {
        return Err(ServiceError::SourceTypeUnsupported);
    }

    let orientation = match source_type {
        ImageType::Jpeg | ImageType::Tiff => backend::exif_orientation(data.bytes()),
        _ => Orientation::default(),
    };

    let mut plan = FramePlan {
        po,
        target_format,
        source_type,
        orientation,
        linear: ctx.use_linear_colorspace,
        watermark: po.watermark.enabled.then_some(ctx.watermark).flatten(),
        allow_scale_on_load: true,
    };

    if source_type == ImageType::Gif
        && target_format == ImageType::Gif
        && ctx.max_animation_frames > 1
    {
        plan.allow_scale_on_load = false;
        return animation::process_animated(data.bytes(), &plan, ctx, deadline);
    }

    let decoded = backend::decode(data.bytes(), source_type)?;
    deadline.check()?;

    let image = transform_frame(decoded.image, decoded.has_alpha, &plan, deadline)?;
    let (width, height) = image.dimensions();

    let encoded = encode_with_budget(&image, target_format, po, ctx)?;
    deadline.check()?;

    Ok(ProcessedImage {
        data: encoded,
        format: target_format,
        width,
        height,
    })
}

/// Target-format resolution: an explicit format wins, otherwise WebP
/// when negotiated, then the source type when it is a reasonable web
/// output, then JPEG. WebP enforcement overrides everything.
fn resolve_format(source_type: ImageType, po: &ProcessingOptions) -> ImageType {
    let mut format = po.format;

    if format == ImageType::Unknown {
        format = if source_type == ImageType::Svg {
            // SVG stays on the passthrough path unless a raster format
            // was requested explicitly.
            ImageType::Svg
        } else if po.prefer_webp && ImageType::Webp.supports_save() {
            ImageType::Webp
        } else if source_type.supports_save() && source_type.good_for_web() {
            source_type
        } else {
            ImageType::Jpeg
        };
    }

    if po.enforce_webp && format != ImageType::Svg && ImageType::Webp.supports_save() {
        format = ImageType::Webp;
    }

    format
}

/// The geometric and photometric stage sequence for one frame.
pub(crate) fn transform_frame(
    mut image: RgbaImage,
    has_alpha: bool,
    plan: &FramePlan,
    deadline: Deadline,
) -> Result<RgbaImage, ServiceError> {
    let po = plan.po;

    // Intrinsic dimensions as the viewer will see them: orientations
    // with a 90/270 rotation swap the axes.
    let (mut src_w, mut src_h) = oriented_dims(&image, plan.orientation);

    // DPR multiplies the requested dimensions. Targets larger than the
    // source are tolerated here; the scale computation refuses to
    // enlarge and the target crop clamps to the image.
    let target_w = scale_dim(po.width, po.dpr);
    let target_h = scale_dim(po.height, po.dpr);

    let resize_type =
        geometry::resolve_resize_type(po.resize, src_w, src_h, target_w, target_h);

    if geometry::need_to_scale(src_w, src_h, po, target_w, target_h) {
        // An explicit crop rectangle bounds the dimensions the scale
        // is computed against.
        let scale_src_w = positive_min(po.crop.map_or(0, |c| c.width), src_w);
        let scale_src_h = positive_min(po.crop.map_or(0, |c| c.height), src_h);

        let mut scale = geometry::calc_scale(
            scale_src_w,
            scale_src_h,
            target_w,
            target_h,
            resize_type,
            po.enlarge,
            plan.source_type,
        );

        if scale < 1.0 && plan.allow_scale_on_load {
            let shrink = geometry::calc_shrink(scale, plan.source_type);
            if shrink > 1 {
                image = backend::pre_shrink(image, shrink)?;
                let dims = oriented_dims(&image, plan.orientation);
                scale = geometry::calc_scale(
                    positive_min(po.crop.map_or(0, |c| c.width), dims.0),
                    positive_min(po.crop.map_or(0, |c| c.height), dims.1),
                    target_w,
                    target_h,
                    resize_type,
                    po.enlarge,
                    plan.source_type,
                );
            }
        }

        if scale != 1.0 {
            image = backend::resize(image, scale, has_alpha, plan.linear)?;
        }
    }
    deadline.check()?;

    if !plan.orientation.is_identity() {
        image = backend::orient(image, plan.orientation);
    }
    (src_w, src_h) = image.dimensions();
    deadline.check()?;

    // Explicit crop first, with its own gravity.
    if let Some(crop_opts) = &po.crop {
        let cw = positive_min(crop_opts.width, src_w);
        let ch = positive_min(crop_opts.height, src_h);
        if cw < src_w || ch < src_h {
            let gravity = crop_opts.gravity.unwrap_or(po.gravity);
            let (left, top) = if gravity.kind == GravityKind::Smart {
                backend::smart_crop_offset(&image, cw, ch)
            } else {
                geometry::calc_crop(src_w, src_h, cw, ch, &gravity)
            };
            image = backend::crop(&image, left, top, cw, ch);
            (src_w, src_h) = image.dimensions();
        }
    }

    // Then the target-size crop with the request gravity.
    let final_w = if target_w == 0 { src_w } else { target_w.min(src_w) };
    let final_h = if target_h == 0 { src_h } else { target_h.min(src_h) };
    if final_w < src_w || final_h < src_h {
        let (left, top) = if po.gravity.kind == GravityKind::Smart {
            backend::smart_crop_offset(&image, final_w, final_h)
        } else {
            geometry::calc_crop(src_w, src_h, final_w, final_h, &po.gravity)
        };
        image = backend::crop(&image, left, top, final_w, final_h);
    }
    deadline.check()?;

    if has_alpha && (po.flatten || plan.target_format == ImageType::Jpeg) {
        let background = po.background.unwrap_or(Color::new(255, 255, 255));
        image = backend::flatten(&image, background);
    }

    if po.blur > 0.0 {
        image = backend::blur(&image, po.blur);
    }
    if po.sharpen > 0.0 {
        image = backend::sharpen(&image, po.sharpen);
    }
    deadline.check()?;

    // Letterbox to the exact requested size.
    if po.extend && target_w > 0 && target_h > 0 {
        let (img_w, img_h) = image.dimensions();
        if target_w > img_w || target_h > img_h {
            let canvas_w = target_w.max(img_w);
            let canvas_h = target_h.max(img_h);
            let (left, top) = geometry::calc_embed(
                canvas_w,
                canvas_h,
                img_w,
                img_h,
                &crate::options::Gravity::default(),
                0,
                0,
            );
            image = backend::embed(&image, canvas_w, canvas_h, left, top, po.background);
        }
    }

    if let Some(watermark) = plan.watermark {
        image = watermark.apply(image, &po.watermark)?;
    }

    Ok(image)
}

/// Encodes and, when a byte budget is set, re-encodes quality-capable
/// formats at decayed quality until the output fits.
fn encode_with_budget(
    image: &RgbaImage,
    format: ImageType,
    po: &ProcessingOptions,
    ctx: &PipelineContext,
) -> Result<Vec<u8>, ServiceError> {
    let mut quality = po.quality;
    let mut params = EncodeParams {
        quality,
        jpeg_progressive: ctx.jpeg_progressive,
        png_interlaced: ctx.png_interlaced,
    };

    let mut encoded = backend::encode(image, format, params)?;

    if po.max_bytes > 0 && matches!(format, ImageType::Jpeg | ImageType::Webp) {
        while encoded.len() > po.max_bytes && quality > 10 {
            quality = ((f32::from(quality)) * 0.7) as u8;
            params.quality = quality.max(1);
            encoded = backend::encode(image, format, params)?;
        }
    }

    Ok(encoded)
}

fn oriented_dims(image: &RgbaImage, orientation: Orientation) -> (u32, u32) {
    if orientation.transposes() {
        (image.height(), image.width())
    } else {
        image.dimensions()
    }
}

fn scale_dim(dim: u32, dpr: f64) -> u32 {
    if dim == 0 || dpr == 1.0 {
        dim
    } else {
        (f64::from(dim) * dpr).round() as u32
    }
}

/// Smallest positive of the two; zero means "unbounded".
fn positive_min(a: u32, b: u32) -> u32 {
    if a == 0 {
        b
    } else {
        a.min(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::pool::BufferPool;
    use crate::options::{CropOptions, Gravity, ResizeType, WatermarkOptions};
    use image::Rgba;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx<'a>() -> PipelineContext<'a> {
        PipelineContext {
            jpeg_progressive: false,
            png_interlaced: false,
            use_linear_colorspace: false,
            max_animation_frames: 1,
            max_src_resolution: 16_800_000,
            max_src_dimension: 0,
            watermark: None,
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    fn options() -> ProcessingOptions {
        ProcessingOptions::new(80)
    }

    fn png_source(width: u32, height: u32) -> (Vec<u8>, ImageMeta) {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 100, 255])
        });
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        (
            buf.into_inner(),
            ImageMeta {
                format: ImageType::Png,
                width,
                height,
            },
        )
    }

    fn image_data(bytes: Vec<u8>, format: ImageType) -> ImageData {
        let pool = Arc::new(BufferPool::new(1, 0));
        let mut buf = pool.get(bytes.len());
        buf.extend_from_slice(&bytes);
        ImageData::from_parts(buf, format, pool)
    }

    fn run(
        bytes: Vec<u8>,
        meta: ImageMeta,
        po: &ProcessingOptions,
    ) -> Result<ProcessedImage, ServiceError> {
        let data = image_data(bytes, meta.format);
        process_image(&data, &meta, po, &ctx(), deadline())
    }

    #[test]
    fn test_fit_preserves_aspect() {
        let (bytes, meta) = png_source(400, 200);
        let mut po = options();
        po.resize = ResizeType::Fit;
        po.width = 100;
        po.height = 100;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (100, 50));
        assert_eq!(out.format, ImageType::Png);
    }

    #[test]
    fn test_fill_crops_to_exact_size() {
        let (bytes, meta) = png_source(400, 200);
        let mut po = options();
        po.resize = ResizeType::Fill;
        po.width = 100;
        po.height = 100;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (100, 100));
    }

    #[test]
    fn test_fit_never_enlarges_by_default() {
        let (bytes, meta) = png_source(50, 50);
        let mut po = options();
        po.width = 200;
        po.height = 200;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (50, 50));
    }

    #[test]
    fn test_enlarge_allows_upscale() {
        let (bytes, meta) = png_source(50, 50);
        let mut po = options();
        po.width = 200;
        po.height = 200;
        po.enlarge = true;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (200, 200));
    }

    #[test]
    fn test_dpr_multiplies_target() {
        let (bytes, meta) = png_source(400, 400);
        let mut po = options();
        po.width = 100;
        po.height = 100;
        po.dpr = 2.0;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (200, 200));
    }

    #[test]
    fn test_format_conversion_to_jpeg() {
        let (bytes, meta) = png_source(20, 20);
        let mut po = options();
        po.format = ImageType::Jpeg;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!(out.format, ImageType::Jpeg);
        assert_eq!(&out.data[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_unknown_format_keeps_web_friendly_source() {
        let (bytes, meta) = png_source(20, 20);
        let po = options();
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!(out.format, ImageType::Png);
    }

    #[test]
    fn test_prefer_webp_resolution() {
        let (bytes, meta) = png_source(20, 20);
        let mut po = options();
        po.prefer_webp = true;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!(out.format, ImageType::Webp);
        assert_eq!(&out.data[0..4], b"RIFF");
    }

    #[test]
    fn test_enforce_webp_overrides_explicit_format() {
        let (bytes, meta) = png_source(20, 20);
        let mut po = options();
        po.format = ImageType::Jpeg;
        po.enforce_webp = true;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!(out.format, ImageType::Webp);
    }

    #[test]
    fn test_bmp_source_defaults_to_jpeg() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 255]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Bmp)
            .unwrap();
        let meta = ImageMeta {
            format: ImageType::Bmp,
            width: 8,
            height: 8,
        };
        let out = run(buf.into_inner(), meta, &options()).unwrap();
        assert_eq!(out.format, ImageType::Jpeg);
    }

    #[test]
    fn test_svg_passthrough() {
        let svg = b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>".to_vec();
        let meta = ImageMeta {
            format: ImageType::Svg,
            width: 0,
            height: 0,
        };
        let mut po = options();
        po.format = ImageType::Svg;
        let data = image_data(svg.clone(), ImageType::Svg);
        let out = process_image(&data, &meta, &po, &ctx(), deadline()).unwrap();
        assert_eq!(out.data, svg);
        assert_eq!(out.format, ImageType::Svg);
    }

    #[test]
    fn test_raster_to_svg_fails() {
        let (bytes, meta) = png_source(8, 8);
        let mut po = options();
        po.format = ImageType::Svg;
        let err = run(bytes, meta, &po).unwrap_err();
        assert_eq!(err, ServiceError::SvgConversionUnsupported);
    }

    #[test]
    fn test_explicit_crop_then_resize() {
        let (bytes, meta) = png_source(200, 200);
        let mut po = options();
        po.crop = Some(CropOptions {
            width: 100,
            height: 50,
            gravity: Some(Gravity::new(GravityKind::NorthWest)),
        });
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (100, 50));
    }

    #[test]
    fn test_extend_letterboxes() {
        let (bytes, meta) = png_source(50, 100);
        let mut po = options();
        po.width = 100;
        po.height = 100;
        po.extend = true;
        po.background = Some(Color::new(0, 0, 0));
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (100, 100));
    }

    #[test]
    fn test_flatten_for_jpeg_targets() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([200, 10, 10, 0]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        let meta = ImageMeta {
            format: ImageType::Png,
            width: 10,
            height: 10,
        };
        let mut po = options();
        po.format = ImageType::Jpeg;
        let out = run(buf.into_inner(), meta, &po).unwrap();
        assert_eq!(out.format, ImageType::Jpeg);
    }

    #[test]
    fn test_expired_deadline_aborts() {
        let (bytes, meta) = png_source(100, 100);
        let data = image_data(bytes, ImageType::Png);
        let expired = Deadline::after(Duration::from_secs(0));
        let err = process_image(&data, &meta, &options(), &ctx(), expired).unwrap_err();
        assert_eq!(err, ServiceError::Timeout);
    }

    #[test]
    fn test_max_bytes_decays_quality() {
        let (bytes, meta) = png_source(256, 256);
        let mut po = options();
        po.format = ImageType::Jpeg;
        let unbounded = run(bytes.clone(), meta, &po).unwrap();
        assert!(unbounded.data.len() > 1200);

        po.max_bytes = 1200;
        let bounded = run(bytes, meta, &po).unwrap();
        assert!(
            bounded.data.len() < unbounded.data.len(),
            "budget loop did not shrink the output: {} vs {}",
            bounded.data.len(),
            unbounded.data.len()
        );
    }

    #[test]
    fn test_blur_and_sharpen_run() {
        let (bytes, meta) = png_source(64, 64);
        let mut po = options();
        po.blur = 2.0;
        po.sharpen = 1.0;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (64, 64));
    }

    #[test]
    fn test_smart_gravity_crop() {
        let (bytes, meta) = png_source(200, 100);
        let mut po = options();
        po.resize = ResizeType::Fill;
        po.width = 50;
        po.height = 50;
        po.gravity = Gravity::new(GravityKind::Smart);
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (50, 50));
    }

    #[test]
    fn test_watermark_options_ignored_without_image() {
        let (bytes, meta) = png_source(32, 32);
        let mut po = options();
        po.watermark = WatermarkOptions {
            enabled: true,
            ..WatermarkOptions::default()
        };
        // No process-wide watermark configured: options are a no-op.
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (32, 32));
    }

    #[test]
    fn test_auto_resize_picks_fill_for_matching_aspect() {
        let (bytes, meta) = png_source(400, 200);
        let mut po = options();
        po.resize = ResizeType::Auto;
        po.width = 100;
        po.height = 50;
        let out = run(bytes, meta, &po).unwrap();
        assert_eq!((out.width, out.height), (100, 50));
    }
}
