//! Imaging backend
//!
//! The operation surface the transform engine is written against:
//! decode, resize (with alpha premultiply bracket and optional
//! linear-light path), rotate/flip, crop, content-aware crop offset,
//! flatten, blur, sharpen, embed and the per-format encoders. All
//! functions are synchronous and run on the request's pipeline thread.

use std::io::Cursor;
use std::num::NonZeroU32;
use std::panic;

use fast_image_resize as fr;
use image::io::Reader as ImageReader;
use image::{imageops, DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::error::ServiceError;
use crate::options::{Color, ImageType};

/// Post-resize orientation plan extracted from EXIF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Orientation {
    /// Clockwise rotation: 0, 90, 180 or 270.
    pub angle: u16,
    /// Horizontal flip after rotation.
    pub flip: bool,
}

impl Orientation {
    /// Orientations 5..=8 swap the intrinsic axes.
    pub fn transposes(&self) -> bool {
        self.angle == 90 || self.angle == 270
    }

    pub fn is_identity(&self) -> bool {
        self.angle == 0 && !self.flip
    }
}

/// Reads the EXIF orientation tag; unreadable or absent EXIF means
/// identity.
pub fn exif_orientation(data: &[u8]) -> Orientation {
    let reader = exif::Reader::new();
    let Ok(parsed) = reader.read_from_container(&mut Cursor::new(data)) else {
        return Orientation::default();
    };
    let Some(field) = parsed.get_field(exif::Tag::Orientation, exif::In::PRIMARY) else {
        return Orientation::default();
    };
    match field.value.get_uint(0) {
        Some(2) => Orientation { angle: 0, flip: true },
        Some(3) => Orientation { angle: 180, flip: false },
        Some(4) => Orientation { angle: 180, flip: true },
        Some(5) => Orientation { angle: 90, flip: true },
        Some(6) => Orientation { angle: 90, flip: false },
        Some(7) => Orientation { angle: 270, flip: true },
        Some(8) => Orientation { angle: 270, flip: false },
        _ => Orientation::default(),
    }
}

fn image_format(img_type: ImageType) -> Option<ImageFormat> {
    match img_type {
        ImageType::Jpeg => Some(ImageFormat::Jpeg),
        ImageType::Png => Some(ImageFormat::Png),
        ImageType::Webp => Some(ImageFormat::WebP),
        ImageType::Gif => Some(ImageFormat::Gif),
        ImageType::Ico => Some(ImageFormat::Ico),
        ImageType::Tiff => Some(ImageFormat::Tiff),
        ImageType::Bmp => Some(ImageFormat::Bmp),
        _ => None,
    }
}

/// Decoded working raster plus whether the source carried an alpha
/// channel (decides flatten and the premultiply bracket).
pub struct Decoded {
    pub image: RgbaImage,
    pub has_alpha: bool,
}

/// Decodes the source into RGBA. For ICO the decoder resolves the best
/// (largest) directory page.
pub fn decode(data: &[u8], img_type: ImageType) -> Result<Decoded, ServiceError> {
    let format = image_format(img_type).ok_or(ServiceError::SourceTypeUnsupported)?;

    let mut reader = ImageReader::new(Cursor::new(data));
    reader.set_format(format);
    let dynamic = reader
        .decode()
        .map_err(|e| ServiceError::processing(format!("failed to decode image: {}", e)))?;

    let has_alpha = dynamic.color().has_alpha();
    Ok(Decoded {
        image: dynamic.to_rgba8(),
        has_alpha,
    })
}

/// Integer box pre-shrink standing in for decoder-native
/// scale-on-load. Keeps the downstream pipeline identical to a decoder
/// that shrank natively.
pub fn pre_shrink(image: RgbaImage, factor: u32) -> Result<RgbaImage, ServiceError> {
    if factor <= 1 {
        return Ok(image);
    }
    let width = (image.width() / factor).max(1);
    let height = (image.height() / factor).max(1);
    resize_raw(image, width, height, fr::FilterType::Box, false)
}

/// Resizes by `scale` with Lanczos3, premultiplying and
/// unpremultiplying alpha around the convolution when the image has an
/// alpha channel. `linear` routes the convolution through linear light
/// at 16-bit depth.
pub fn resize(
    image: RgbaImage,
    scale: f64,
    has_alpha: bool,
    linear: bool,
) -> Result<RgbaImage, ServiceError> {
    let width = ((f64::from(image.width()) * scale).round() as u32).max(1);
    let height = ((f64::from(image.height()) * scale).round() as u32).max(1);
    if width == image.width() && height == image.height() {
        return Ok(image);
    }
    if linear {
        resize_linear(image, width, height, has_alpha)
    } else {
        resize_raw(image, width, height, fr::FilterType::Lanczos3, has_alpha)
    }
}

fn nz(value: u32, what: &str) -> Result<NonZeroU32, ServiceError> {
    NonZeroU32::new(value)
        .ok_or_else(|| ServiceError::processing(format!("{} must not be zero", what)))
}

fn resize_raw(
    image: RgbaImage,
    dst_w: u32,
    dst_h: u32,
    filter: fr::FilterType,
    premultiply: bool,
) -> Result<RgbaImage, ServiceError> {
    let src_w = nz(image.width(), "source width")?;
    let src_h = nz(image.height(), "source height")?;
    let dst_w_nz = nz(dst_w, "target width")?;
    let dst_h_nz = nz(dst_h, "target height")?;

    let mut src =
        fr::Image::from_vec_u8(src_w, src_h, image.into_raw(), fr::PixelType::U8x4)
            .map_err(|e| ServiceError::processing(format!("resize failed: {:?}", e)))?;
    let mut dst = fr::Image::new(dst_w_nz, dst_h_nz, fr::PixelType::U8x4);

    let mul_div = fr::MulDiv::default();
    if premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src.view_mut())
            .map_err(|e| ServiceError::processing(format!("premultiply failed: {:?}", e)))?;
    }

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(filter));
    resizer
        .resize(&src.view(), &mut dst.view_mut())
        .map_err(|e| ServiceError::processing(format!("resize failed: {:?}", e)))?;

    if premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst.view_mut())
            .map_err(|e| ServiceError::processing(format!("unpremultiply failed: {:?}", e)))?;
    }

    RgbaImage::from_raw(dst_w, dst_h, dst.into_vec())
        .ok_or_else(|| ServiceError::processing("resize produced a malformed buffer"))
}

/// sRGB transfer function, exact rather than gamma-approximated.
fn srgb_to_linear(value: f64) -> f64 {
    if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f64) -> f64 {
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

/// Linear-light resize at 16-bit depth to avoid shadow banding.
fn resize_linear(
    image: RgbaImage,
    dst_w: u32,
    dst_h: u32,
    premultiply: bool,
) -> Result<RgbaImage, ServiceError> {
    let to_linear: Vec<u16> = (0..=255u32)
        .map(|v| (srgb_to_linear(f64::from(v) / 255.0) * 65535.0).round() as u16)
        .collect();

    let (src_w, src_h) = (image.width(), image.height());
    let raw = image.into_raw();
    let mut wide: Vec<u8> = Vec::with_capacity(raw.len() * 2);
    for (i, &value) in raw.iter().enumerate() {
        // Alpha stays linear; only color channels pass the transfer.
        let sample = if i % 4 == 3 {
            u16::from(value) * 257
        } else {
            to_linear[value as usize]
        };
        wide.extend_from_slice(&sample.to_le_bytes());
    }

    let mut src = fr::Image::from_vec_u8(
        nz(src_w, "source width")?,
        nz(src_h, "source height")?,
        wide,
        fr::PixelType::U16x4,
    )
    .map_err(|e| ServiceError::processing(format!("resize failed: {:?}", e)))?;
    let mut dst = fr::Image::new(
        nz(dst_w, "target width")?,
        nz(dst_h, "target height")?,
        fr::PixelType::U16x4,
    );

    let mul_div = fr::MulDiv::default();
    if premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src.view_mut())
            .map_err(|e| ServiceError::processing(format!("premultiply failed: {:?}", e)))?;
    }

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
    resizer
        .resize(&src.view(), &mut dst.view_mut())
        .map_err(|e| ServiceError::processing(format!("resize failed: {:?}", e)))?;

    if premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst.view_mut())
            .map_err(|e| ServiceError::processing(format!("unpremultiply failed: {:?}", e)))?;
    }

    let wide = dst.into_vec();
    let mut out: Vec<u8> = Vec::with_capacity(wide.len() / 2);
    for (i, chunk) in wide.chunks_exact(2).enumerate() {
        let sample = u16::from_le_bytes([chunk[0], chunk[1]]);
        let value = if i % 4 == 3 {
            (sample / 257) as u8
        } else {
            (linear_to_srgb(f64::from(sample) / 65535.0) * 255.0).round() as u8
        };
        out.push(value);
    }

    RgbaImage::from_raw(dst_w, dst_h, out)
        .ok_or_else(|| ServiceError::processing("resize produced a malformed buffer"))
}

/// Applies the recorded EXIF plan: rotate, then flip horizontally.
pub fn orient(image: RgbaImage, orientation: Orientation) -> RgbaImage {
    let rotated = match orientation.angle {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    };
    if orientation.flip {
        imageops::flip_horizontal(&rotated)
    } else {
        rotated
    }
}

pub fn crop(image: &RgbaImage, left: u32, top: u32, width: u32, height: u32) -> RgbaImage {
    imageops::crop_imm(image, left, top, width, height).to_image()
}

/// Content-aware crop offset: samples candidate windows on a coarse
/// grid and keeps the one with the highest color variance.
pub fn smart_crop_offset(image: &RgbaImage, target_w: u32, target_h: u32) -> (u32, u32) {
    let src_w = image.width();
    let src_h = image.height();
    if src_w <= target_w && src_h <= target_h {
        return (0, 0);
    }

    let max_x = src_w.saturating_sub(target_w);
    let max_y = src_h.saturating_sub(target_h);
    let step_x = (max_x / 5).max(1);
    let step_y = (max_y / 5).max(1);

    let mut best = (max_x / 2, max_y / 2);
    let mut best_score = 0.0f32;

    let mut x = 0;
    while x <= max_x {
        let mut y = 0;
        while y <= max_y {
            let score = region_variance(image, x, y, target_w, target_h);
            if score > best_score {
                best_score = score;
                best = (x, y);
            }
            y += step_y;
        }
        x += step_x;
    }

    best
}

/// Channel variance over a sampled region, a cheap entropy proxy.
fn region_variance(image: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> f32 {
    const SAMPLE_STEP: u32 = 4;

    let mut sums = [0u64; 3];
    let mut squares = [0u64; 3];
    let mut count = 0u64;

    let mut py = y;
    while py < (y + height).min(image.height()) {
        let mut px = x;
        while px < (x + width).min(image.width()) {
            let pixel = image.get_pixel(px, py);
            for c in 0..3 {
                let v = u64::from(pixel[c]);
                sums[c] += v;
                squares[c] += v * v;
            }
            count += 1;
            px += SAMPLE_STEP;
        }
        py += SAMPLE_STEP;
    }

    if count == 0 {
        return 0.0;
    }

    (0..3)
        .map(|c| {
            let mean = sums[c] as f32 / count as f32;
            squares[c] as f32 / count as f32 - mean * mean
        })
        .sum()
}

/// Composites the image over a solid background, discarding alpha.
pub fn flatten(image: &RgbaImage, background: Color) -> RgbaImage {
    let mut out = RgbaImage::new(image.width(), image.height());
    for (dst, src) in out.pixels_mut().zip(image.pixels()) {
        let alpha = u32::from(src[3]);
        let inverse = 255 - alpha;
        *dst = Rgba([
            ((u32::from(src[0]) * alpha + u32::from(background.r) * inverse) / 255) as u8,
            ((u32::from(src[1]) * alpha + u32::from(background.g) * inverse) / 255) as u8,
            ((u32::from(src[2]) * alpha + u32::from(background.b) * inverse) / 255) as u8,
            255,
        ]);
    }
    out
}

pub fn blur(image: &RgbaImage, sigma: f32) -> RgbaImage {
    imageops::blur(image, sigma)
}

pub fn sharpen(image: &RgbaImage, sigma: f32) -> RgbaImage {
    imageops::unsharpen(image, sigma, 1)
}

/// Places the image on a `width`×`height` canvas at the given offset,
/// filling the rest with the background (transparent when none).
pub fn embed(
    image: &RgbaImage,
    width: u32,
    height: u32,
    left: i64,
    top: i64,
    background: Option<Color>,
) -> RgbaImage {
    let fill = background
        .map(|c| Rgba([c.r, c.g, c.b, 255]))
        .unwrap_or(Rgba([0, 0, 0, 0]));
    let mut canvas = RgbaImage::from_pixel(width, height, fill);
    imageops::overlay(&mut canvas, image, left, top);
    canvas
}

/// Tiles the image across a `width`×`height` canvas starting at the
/// origin.
pub fn replicate(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let mut canvas = RgbaImage::new(width, height);
    let (tile_w, tile_h) = (image.width().max(1), image.height().max(1));
    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            imageops::overlay(&mut canvas, image, i64::from(x), i64::from(y));
            x += tile_w;
        }
        y += tile_h;
    }
    canvas
}

/// Encoder settings shared by all formats.
#[derive(Debug, Clone, Copy)]
pub struct EncodeParams {
    pub quality: u8,
    pub jpeg_progressive: bool,
    pub png_interlaced: bool,
}

/// Encodes the working image, dispatching on the target type.
pub fn encode(
    image: &RgbaImage,
    img_type: ImageType,
    params: EncodeParams,
) -> Result<Vec<u8>, ServiceError> {
    match img_type {
        ImageType::Jpeg => encode_jpeg(image, params),
        ImageType::Webp => encode_webp(image, params.quality),
        ImageType::Png | ImageType::Gif | ImageType::Tiff | ImageType::Bmp => {
            let format = image_format(img_type).expect("saveable type has a format");
            let mut out = Cursor::new(Vec::new());
            DynamicImage::ImageRgba8(image.clone())
                .write_to(&mut out, format)
                .map_err(|e| {
                    ServiceError::processing(format!(
                        "failed to encode {}: {}",
                        img_type.ext(),
                        e
                    ))
                })?;
            Ok(out.into_inner())
        }
        _ => Err(ServiceError::processing(format!(
            "no encoder for {}",
            img_type.ext()
        ))),
    }
}

/// JPEG via mozjpeg: quality, optimized coding and optional
/// progressive scan script. mozjpeg aborts through panics, so the
/// whole compression runs under `catch_unwind`.
fn encode_jpeg(image: &RgbaImage, params: EncodeParams) -> Result<Vec<u8>, ServiceError> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut rgb = Vec::with_capacity(width * height * 3);
    for pixel in image.pixels() {
        rgb.extend_from_slice(&[pixel[0], pixel[1], pixel[2]]);
    }

    let result = panic::catch_unwind(move || -> Result<Vec<u8>, String> {
        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width, height);
        comp.set_color_space(mozjpeg::ColorSpace::JCS_YCbCr);
        comp.set_quality(f32::from(params.quality));
        comp.set_optimize_coding(true);
        if params.jpeg_progressive {
            comp.set_progressive_mode();
        }

        let mut output = Vec::with_capacity((width * height * 3 / 10).max(4096));
        let mut writer = comp
            .start_compress(&mut output)
            .map_err(|e| format!("failed to start compress: {:?}", e))?;
        for row in rgb.chunks(width * 3) {
            writer
                .write_scanlines(row)
                .map_err(|e| format!("failed to write scanlines: {:?}", e))?;
        }
        writer.finish().map_err(|e| format!("failed to finish: {:?}", e))?;
        Ok(output)
    });

    match result {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(ServiceError::processing(format!("failed to encode jpeg: {}", e))),
        Err(_) => Err(ServiceError::processing("jpeg encoder panicked")),
    }
}

/// Lossy WebP through libwebp.
fn encode_webp(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, ServiceError> {
    let encoder = webp::Encoder::from_rgba(image.as_raw(), image.width(), image.height());
    Ok(encoder.encode(f32::from(quality)).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([
                ((x * 255) / width.max(1)) as u8,
                ((y * 255) / height.max(1)) as u8,
                128,
                255,
            ])
        })
    }

    fn params(quality: u8) -> EncodeParams {
        EncodeParams {
            quality,
            jpeg_progressive: false,
            png_interlaced: false,
        }
    }

    #[test]
    fn test_decode_roundtrip() {
        let png = encode(&gradient(8, 6), ImageType::Png, params(80)).unwrap();
        let decoded = decode(&png, ImageType::Png).unwrap();
        assert_eq!(decoded.image.dimensions(), (8, 6));
        assert!(decoded.has_alpha);
    }

    #[test]
    fn test_decode_wrong_format_fails() {
        assert!(decode(b"not a png", ImageType::Png).is_err());
    }

    #[test]
    fn test_resize_scales_dimensions() {
        let out = resize(gradient(100, 50), 0.5, false, false).unwrap();
        assert_eq!(out.dimensions(), (50, 25));
    }

    #[test]
    fn test_resize_identity_is_noop() {
        let out = resize(gradient(10, 10), 1.0, false, false).unwrap();
        assert_eq!(out.dimensions(), (10, 10));
    }

    #[test]
    fn test_resize_linear_path() {
        let out = resize(gradient(64, 64), 0.25, true, true).unwrap();
        assert_eq!(out.dimensions(), (16, 16));
    }

    #[test]
    fn test_pre_shrink_integer_factor() {
        let out = pre_shrink(gradient(100, 80), 4).unwrap();
        assert_eq!(out.dimensions(), (25, 20));
        let out = pre_shrink(gradient(100, 80), 1).unwrap();
        assert_eq!(out.dimensions(), (100, 80));
    }

    #[test]
    fn test_orient_rotations() {
        let img = gradient(30, 20);
        let out = orient(img.clone(), Orientation { angle: 90, flip: false });
        assert_eq!(out.dimensions(), (20, 30));
        let out = orient(img.clone(), Orientation { angle: 180, flip: false });
        assert_eq!(out.dimensions(), (30, 20));
        let out = orient(img, Orientation { angle: 0, flip: true });
        assert_eq!(out.dimensions(), (30, 20));
    }

    #[test]
    fn test_exif_orientation_absent_is_identity() {
        let png = encode(&gradient(4, 4), ImageType::Png, params(80)).unwrap();
        assert!(exif_orientation(&png).is_identity());
    }

    #[test]
    fn test_crop_region() {
        let img = gradient(40, 40);
        let out = crop(&img, 10, 5, 20, 30);
        assert_eq!(out.dimensions(), (20, 30));
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(10, 5));
    }

    #[test]
    fn test_smart_crop_prefers_detail() {
        // Uniform left half, checkerboard right half.
        let img = RgbaImage::from_fn(200, 100, |x, y| {
            if x >= 100 && (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else if x >= 100 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([127, 127, 127, 255])
            }
        });
        let (left, _) = smart_crop_offset(&img, 100, 100);
        assert!(left >= 50, "expected the detailed half, got left={}", left);
    }

    #[test]
    fn test_flatten_removes_alpha() {
        let mut img = gradient(4, 4);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 0]));
        let out = flatten(&img, Color::new(0, 255, 0));
        // Fully transparent pixel becomes the background.
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 255, 0, 255]));
        assert!(out.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn test_embed_centers_with_background() {
        let img = gradient(10, 10);
        let out = embed(&img, 30, 30, 10, 10, Some(Color::new(9, 9, 9)));
        assert_eq!(out.dimensions(), (30, 30));
        assert_eq!(out.get_pixel(0, 0), &Rgba([9, 9, 9, 255]));
        assert_eq!(out.get_pixel(10, 10), img.get_pixel(0, 0));
    }

    #[test]
    fn test_replicate_tiles() {
        let tile = RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 255]));
        let out = replicate(&tile, 10, 7);
        assert_eq!(out.dimensions(), (10, 7));
        assert_eq!(out.get_pixel(9, 6), &Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn test_encode_jpeg_magic() {
        let data = encode(&gradient(16, 16), ImageType::Jpeg, params(80)).unwrap();
        assert_eq!(&data[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encode_jpeg_quality_affects_size() {
        let img = gradient(64, 64);
        let high = encode(&img, ImageType::Jpeg, params(95)).unwrap();
        let low = encode(&img, ImageType::Jpeg, params(40)).unwrap();
        assert!(high.len() > low.len());
    }

    #[test]
    fn test_encode_webp_magic() {
        let data = encode(&gradient(16, 16), ImageType::Webp, params(80)).unwrap();
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn test_encode_png_magic() {
        let data = encode(&gradient(16, 16), ImageType::Png, params(80)).unwrap();
        assert_eq!(&data[0..4], &[0x89, 0x50, 0x4E, 0x47]);
    }

    #[test]
    fn test_encode_unsupported_type_fails() {
        assert!(encode(&gradient(4, 4), ImageType::Heic, params(80)).is_err());
        assert!(encode(&gradient(4, 4), ImageType::Svg, params(80)).is_err());
    }
}
