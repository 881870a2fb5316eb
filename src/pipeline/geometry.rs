//! Scale, shrink and crop arithmetic
//!
//! Pure math shared by the transform engine: resolving Auto resize,
//! the scale factor, decoder pre-shrink selection, and crop/embed
//! rectangle placement for every gravity kind.

use crate::options::{Gravity, GravityKind, ImageType, ProcessingOptions, ResizeType};

/// Auto picks Fill when source and target lean the same way
/// (both landscape or both portrait), Fit otherwise.
pub fn resolve_resize_type(
    resize: ResizeType,
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> ResizeType {
    match resize {
        ResizeType::Auto => {
            if (src_w >= src_h) == (dst_w >= dst_h) {
                ResizeType::Fill
            } else {
                ResizeType::Fit
            }
        }
        other => other,
    }
}

/// Whether the resize stage fires at all. The deprecated Crop type
/// performs no scaling.
pub fn need_to_scale(src_w: u32, src_h: u32, po: &ProcessingOptions, dst_w: u32, dst_h: u32) -> bool {
    ((dst_w != 0 && dst_w != src_w) || (dst_h != 0 && dst_h != src_h))
        && !matches!(po.resize, ResizeType::Crop)
}

/// The uniform scale factor for the resize stage. `dst_w`/`dst_h`
/// already include the DPR multiplier; a zero axis is free.
pub fn calc_scale(
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    resize: ResizeType,
    enlarge: bool,
    src_type: ImageType,
) -> f64 {
    let (fw, fh) = (f64::from(src_w), f64::from(src_h));
    let wr = f64::from(dst_w) / fw;
    let hr = f64::from(dst_h) / fh;

    let mut scale = if dst_w == 0 {
        hr
    } else if dst_h == 0 {
        wr
    } else if matches!(resize, ResizeType::Fit) {
        wr.min(hr)
    } else {
        wr.max(hr)
    };

    // Never collapse an axis below one pixel.
    if fw * scale < 1.0 {
        scale = 1.0 / fw;
    }
    if fh * scale < 1.0 {
        scale = 1.0 / fh;
    }

    if !enlarge && scale > 1.0 && src_type != ImageType::Svg {
        scale = 1.0;
    }

    scale
}

/// Decoder pre-shrink factor for scale-on-load. JPEG decoders take
/// power-of-two divisors; WebP accepts any integer factor; other
/// formats decode at full size.
pub fn calc_shrink(scale: f64, img_type: ImageType) -> u32 {
    if scale >= 1.0 {
        return 1;
    }
    let inverse = (1.0 / scale) as u32;
    match img_type {
        ImageType::Webp => inverse.max(1),
        ImageType::Jpeg => match inverse {
            0..=3 => 1,
            4..=7 => 2,
            8..=15 => 4,
            _ => 8,
        },
        _ => 1,
    }
}

/// Top-left corner of a `cw`×`ch` crop inside a `width`×`height`
/// image. Offsets and focal-point fractions come from the gravity;
/// the rectangle is clamped inside the image.
pub fn calc_crop(width: u32, height: u32, cw: u32, ch: u32, gravity: &Gravity) -> (u32, u32) {
    let max_left = i64::from(width) - i64::from(cw);
    let max_top = i64::from(height) - i64::from(ch);

    if gravity.kind == GravityKind::FocusPoint {
        let point_x = (f64::from(width) * gravity.x) as i64;
        let point_y = (f64::from(height) * gravity.y) as i64;
        let left = (point_x - i64::from(cw) / 2).clamp(0, max_left.max(0));
        let top = (point_y - i64::from(ch) / 2).clamp(0, max_top.max(0));
        return (left as u32, top as u32);
    }

    let off_x = gravity.x as i64;
    let off_y = gravity.y as i64;

    let mut left = (i64::from(width) - i64::from(cw) + 1) / 2 + off_x;
    let mut top = (i64::from(height) - i64::from(ch) + 1) / 2 + off_y;

    use GravityKind::*;
    match gravity.kind {
        North | NorthEast | NorthWest => top = off_y,
        South | SouthEast | SouthWest => top = max_top - off_y,
        _ => {}
    }
    match gravity.kind {
        East | NorthEast | SouthEast => left = max_left - off_x,
        West | NorthWest | SouthWest => left = off_x,
        _ => {}
    }

    (
        left.clamp(0, max_left.max(0)) as u32,
        top.clamp(0, max_top.max(0)) as u32,
    )
}

/// Placement of an `item_w`×`item_h` image on a `width`×`height`
/// canvas for embed operations (extend, watermark). May be negative;
/// positions pushing the item fully outside snap back to an edge.
pub fn calc_embed(
    width: u32,
    height: u32,
    item_w: u32,
    item_h: u32,
    gravity: &Gravity,
    off_x: i32,
    off_y: i32,
) -> (i64, i64) {
    let (w, h) = (i64::from(width), i64::from(height));
    let (iw, ih) = (i64::from(item_w), i64::from(item_h));
    let (off_x, off_y) = (i64::from(off_x), i64::from(off_y));

    let mut left = (w - iw + 1) / 2 + off_x;
    let mut top = (h - ih + 1) / 2 + off_y;

    use GravityKind::*;
    match gravity.kind {
        North | NorthEast | NorthWest => top = off_y,
        South | SouthEast | SouthWest => top = h - ih - off_y,
        _ => {}
    }
    match gravity.kind {
        East | NorthEast | SouthEast => left = w - iw - off_x,
        West | NorthWest | SouthWest => left = off_x,
        _ => {}
    }

    if left > w {
        left = w - iw;
    } else if left < -iw {
        left = 0;
    }
    if top > h {
        top = h - ih;
    } else if top < -ih {
        top = 0;
    }

    (left, top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Gravity;

    fn gravity(kind: GravityKind) -> Gravity {
        Gravity::new(kind)
    }

    #[test]
    fn test_auto_resolves_by_aspect_sign() {
        // Landscape source, landscape target: fill.
        assert_eq!(
            resolve_resize_type(ResizeType::Auto, 200, 100, 40, 20),
            ResizeType::Fill
        );
        // Landscape source, portrait target: fit.
        assert_eq!(
            resolve_resize_type(ResizeType::Auto, 200, 100, 20, 40),
            ResizeType::Fit
        );
        assert_eq!(
            resolve_resize_type(ResizeType::Fit, 200, 100, 40, 20),
            ResizeType::Fit
        );
    }

    #[test]
    fn test_calc_scale_fit_uses_smaller_ratio() {
        let scale = calc_scale(400, 200, 100, 100, ResizeType::Fit, false, ImageType::Png);
        assert!((scale - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_calc_scale_fill_uses_larger_ratio() {
        let scale = calc_scale(400, 200, 100, 100, ResizeType::Fill, false, ImageType::Png);
        assert!((scale - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_calc_scale_free_axis() {
        let scale = calc_scale(400, 200, 100, 0, ResizeType::Fit, false, ImageType::Png);
        assert!((scale - 0.25).abs() < 1e-9);
        let scale = calc_scale(400, 200, 0, 100, ResizeType::Fit, false, ImageType::Png);
        assert!((scale - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_calc_scale_no_enlarge() {
        let scale = calc_scale(100, 100, 400, 400, ResizeType::Fit, false, ImageType::Png);
        assert_eq!(scale, 1.0);
        let scale = calc_scale(100, 100, 400, 400, ResizeType::Fit, true, ImageType::Png);
        assert!((scale - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_calc_scale_keeps_one_pixel() {
        let scale = calc_scale(1000, 10, 1, 0, ResizeType::Fit, false, ImageType::Png);
        // Height would collapse below one pixel; scale is raised back.
        assert!(10.0 * scale >= 1.0);
    }

    #[test]
    fn test_calc_shrink_jpeg_steps() {
        assert_eq!(calc_shrink(1.0, ImageType::Jpeg), 1);
        assert_eq!(calc_shrink(0.5, ImageType::Jpeg), 1);
        assert_eq!(calc_shrink(0.25, ImageType::Jpeg), 2);
        assert_eq!(calc_shrink(0.125, ImageType::Jpeg), 4);
        assert_eq!(calc_shrink(0.05, ImageType::Jpeg), 8);
    }

    #[test]
    fn test_calc_shrink_webp_fractional() {
        assert_eq!(calc_shrink(0.3, ImageType::Webp), 3);
        assert_eq!(calc_shrink(0.5, ImageType::Webp), 2);
        assert_eq!(calc_shrink(0.7, ImageType::Png), 1);
    }

    #[test]
    fn test_calc_crop_center() {
        assert_eq!(calc_crop(100, 100, 50, 50, &gravity(GravityKind::Center)), (25, 25));
    }

    #[test]
    fn test_calc_crop_corners() {
        assert_eq!(calc_crop(100, 100, 40, 40, &gravity(GravityKind::NorthWest)), (0, 0));
        assert_eq!(calc_crop(100, 100, 40, 40, &gravity(GravityKind::SouthEast)), (60, 60));
        assert_eq!(calc_crop(100, 100, 40, 40, &gravity(GravityKind::North)), (30, 0));
        assert_eq!(calc_crop(100, 100, 40, 40, &gravity(GravityKind::West)), (0, 30));
    }

    #[test]
    fn test_calc_crop_offsets_clamped() {
        let mut g = gravity(GravityKind::NorthWest);
        g.x = 500.0;
        g.y = 10.0;
        let (left, top) = calc_crop(100, 100, 40, 40, &g);
        assert_eq!((left, top), (60, 10));
    }

    #[test]
    fn test_calc_crop_focus_point() {
        let mut g = gravity(GravityKind::FocusPoint);
        g.x = 0.0;
        g.y = 1.0;
        assert_eq!(calc_crop(100, 100, 40, 40, &g), (0, 60));

        g.x = 0.5;
        g.y = 0.5;
        assert_eq!(calc_crop(100, 100, 40, 40, &g), (30, 30));
    }

    #[test]
    fn test_calc_embed_gravity() {
        let (l, t) = calc_embed(200, 100, 20, 10, &gravity(GravityKind::SouthEast), 5, 5);
        assert_eq!((l, t), (175, 85));

        let (l, t) = calc_embed(200, 100, 20, 10, &gravity(GravityKind::Center), 0, 0);
        assert_eq!((l, t), (90, 45));
    }

    #[test]
    fn test_calc_embed_snaps_outside_positions() {
        let g = gravity(GravityKind::NorthWest);
        let (l, _) = calc_embed(100, 100, 20, 20, &g, 0, 0);
        assert_eq!(l, 0);
        let (l, _) = calc_embed(100, 100, 20, 20, &g, 300, 0);
        assert_eq!(l, 80);
    }
}
