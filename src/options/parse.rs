//! URL path parsing for both grammars
//!
//! Simple: `/<sig>/<resize>/<w>/<h>/<gravity>/<enlarge>/<b64url>[.<ext>]`
//! Advanced: `/<sig>/<opt>:<arg>[:<arg>…]/…/<b64url>[.<ext>]`
//!
//! The grammar is selected by whether the first segment after the
//! signature names a resize type. In the advanced grammar the first
//! segment without a `:` starts the base64 source URL, which may span
//! several `/`-separated segments.

use std::collections::HashSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use super::presets::Presets;
use super::{
    Color, CropOptions, Gravity, GravityKind, ImageType, ProcessingOptions, ResizeType,
};
use crate::error::ServiceError;

/// Everything the URL asked for.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub source_url: String,
    pub options: ProcessingOptions,
}

/// Parser context shared by both grammars.
pub struct ParseContext<'a> {
    pub presets: &'a Presets,
    pub default_quality: u8,
    /// Budget for the crop-area invariant.
    pub max_src_resolution: u64,
    /// Prepended to decoded source URLs when configured.
    pub base_url: Option<&'a str>,
}

/// Splits the raw request path into the signature segment and the
/// signed remainder (with its leading slash).
pub fn split_signature(path: &str) -> Result<(&str, &str), ServiceError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let sig_end = trimmed
        .find('/')
        .ok_or_else(|| ServiceError::invalid_path("too few path segments"))?;
    let signature = &trimmed[..sig_end];
    if signature.is_empty() {
        return Err(ServiceError::invalid_path("empty signature segment"));
    }
    Ok((signature, &trimmed[sig_end..]))
}

/// Parses the signed remainder of the path (everything after the
/// signature, without its leading slash already split away).
pub fn parse_path(signed_path: &str, ctx: &ParseContext) -> Result<ParsedRequest, ServiceError> {
    let parts: Vec<&str> = signed_path
        .strip_prefix('/')
        .unwrap_or(signed_path)
        .split('/')
        .collect();
    if parts.len() < 2 {
        return Err(ServiceError::invalid_path("too few path segments"));
    }

    let mut options = ProcessingOptions::new(ctx.default_quality);
    let mut visited = HashSet::new();
    if ctx.presets.contains("default") {
        apply_preset(&mut options, "default", ctx.presets, &mut visited)?;
    }

    if parts[0].parse::<ResizeType>().is_ok() {
        parse_simple(parts, options, ctx)
    } else {
        parse_advanced(parts, options, ctx)
    }
}

fn parse_simple(
    parts: Vec<&str>,
    mut po: ProcessingOptions,
    ctx: &ParseContext,
) -> Result<ParsedRequest, ServiceError> {
    if parts.len() < 6 {
        return Err(ServiceError::invalid_path("invalid simple path"));
    }

    po.resize = parts[0].parse()?;
    apply_width(&mut po, &[parts[1]])?;
    apply_height(&mut po, &[parts[2]])?;
    apply_gravity(&mut po, &[parts[3]])?;
    apply_enlarge(&mut po, &[parts[4]])?;

    let (url, format) = decode_source_url(&parts[5..], ctx.base_url)?;
    apply_format_type(&mut po, format)?;

    check_crop_budget(&po, ctx)?;
    Ok(ParsedRequest {
        source_url: url,
        options: po,
    })
}

fn parse_advanced(
    parts: Vec<&str>,
    mut po: ProcessingOptions,
    ctx: &ParseContext,
) -> Result<ParsedRequest, ServiceError> {
    let mut url_start = None;

    for (i, part) in parts.iter().enumerate() {
        let args: Vec<&str> = part.split(':').collect();
        if args.len() == 1 {
            url_start = Some(i);
            break;
        }
        let mut visited = HashSet::new();
        apply_option(&mut po, args[0], &args[1..], ctx.presets, &mut visited)?;
    }

    let url_start = url_start.ok_or_else(|| ServiceError::invalid_path("missing source url"))?;
    let (url, format) = decode_source_url(&parts[url_start..], ctx.base_url)?;
    apply_format_type(&mut po, format)?;

    check_crop_budget(&po, ctx)?;
    Ok(ParsedRequest {
        source_url: url,
        options: po,
    })
}

/// Rejoins the trailing segments, splits off the optional extension and
/// base64-decodes the source URL. The decoded value must be an absolute
/// URL unless a base URL is configured.
fn decode_source_url(
    parts: &[&str],
    base_url: Option<&str>,
) -> Result<(String, ImageType), ServiceError> {
    let joined = parts.concat();
    let url_parts: Vec<&str> = joined.split('.').collect();
    if url_parts.len() > 2 {
        return Err(ServiceError::invalid_path("invalid url encoding"));
    }

    let format = if url_parts.len() == 2 {
        ImageType::from_ext(url_parts[1])
            .ok_or_else(|| ServiceError::invalid_path(format!("invalid extension: {}", url_parts[1])))?
    } else {
        ImageType::Unknown
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(url_parts[0])
        .map_err(|_| ServiceError::invalid_path("invalid url encoding"))?;
    let mut url = String::from_utf8(decoded)
        .map_err(|_| ServiceError::invalid_path("source url is not valid utf-8"))?;

    if let Some(base) = base_url {
        url = format!("{}{}", base.trim_end_matches('/'), ensure_leading_slash(&url));
    } else if !is_absolute_url(&url) {
        return Err(ServiceError::invalid_path(format!(
            "source url is not absolute: {}",
            url
        )));
    }

    Ok((url, format))
}

fn ensure_leading_slash(url: &str) -> String {
    if url.starts_with('/') {
        url.to_string()
    } else {
        format!("/{}", url)
    }
}

fn is_absolute_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        && !rest.is_empty()
}

fn check_crop_budget(po: &ProcessingOptions, ctx: &ParseContext) -> Result<(), ServiceError> {
    if let Some(crop) = &po.crop {
        if u64::from(crop.width) * u64::from(crop.height) > ctx.max_src_resolution {
            return Err(ServiceError::invalid_path("crop area exceeds resolution budget"));
        }
    }
    Ok(())
}

/// Option dispatch table. Presets expand in place through the same
/// entry point; `visited` breaks preset cycles.
pub(crate) fn apply_option(
    po: &mut ProcessingOptions,
    name: &str,
    args: &[&str],
    presets: &Presets,
    visited: &mut HashSet<String>,
) -> Result<(), ServiceError> {
    match name {
        "resize" | "rs" => apply_resize(po, args),
        "size" | "s" => apply_size(po, args),
        "width" | "w" => apply_width(po, args),
        "height" | "h" => apply_height(po, args),
        "enlarge" | "el" => apply_enlarge(po, args),
        "extend" | "ex" => apply_extend(po, args),
        "gravity" | "g" => apply_gravity(po, args),
        "crop" | "c" => apply_crop(po, args),
        "dpr" => apply_dpr(po, args),
        "quality" | "q" => apply_quality(po, args),
        "background" | "bg" => apply_background(po, args),
        "blur" | "bl" => apply_blur(po, args),
        "sharpen" | "sh" => apply_sharpen(po, args),
        "watermark" | "wm" => apply_watermark(po, args),
        "preset" | "pr" => {
            for preset in args {
                apply_preset(po, preset, presets, visited)?;
            }
            Ok(())
        }
        "format" | "f" | "ext" => apply_format(po, args),
        "max_bytes" | "mb" => apply_max_bytes(po, args),
        // Exists only to vary CDN cache keys.
        "cache_buster" | "cb" => one_arg(name, args).map(|_| ()),
        _ => Err(ServiceError::invalid_path(format!("unknown option: {}", name))),
    }
}

fn apply_preset(
    po: &mut ProcessingOptions,
    name: &str,
    presets: &Presets,
    visited: &mut HashSet<String>,
) -> Result<(), ServiceError> {
    if !visited.insert(name.to_string()) {
        return Err(ServiceError::invalid_path(format!("preset cycle at: {}", name)));
    }

    let entries = presets
        .get(name)
        .ok_or_else(|| ServiceError::invalid_path(format!("unknown preset: {}", name)))?;

    for (opt, args) in entries {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        apply_option(po, opt, &arg_refs, presets, visited)?;
    }

    po.used_presets.push(name.to_string());
    visited.remove(name);
    Ok(())
}

fn one_arg<'a>(name: &str, args: &'a [&str]) -> Result<&'a str, ServiceError> {
    if args.len() != 1 {
        return Err(ServiceError::invalid_path(format!(
            "invalid {} arguments: {:?}",
            name, args
        )));
    }
    Ok(args[0])
}

fn parse_u32(name: &str, arg: &str) -> Result<u32, ServiceError> {
    arg.parse::<u32>()
        .map_err(|_| ServiceError::invalid_path(format!("invalid {}: {}", name, arg)))
}

fn parse_f64(name: &str, arg: &str) -> Result<f64, ServiceError> {
    arg.parse::<f64>()
        .map_err(|_| ServiceError::invalid_path(format!("invalid {}: {}", name, arg)))
}

fn apply_width(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    po.width = parse_u32("width", one_arg("width", args)?)?;
    Ok(())
}

fn apply_height(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    po.height = parse_u32("height", one_arg("height", args)?)?;
    Ok(())
}

fn apply_enlarge(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    po.enlarge = one_arg("enlarge", args)? != "0";
    Ok(())
}

fn apply_extend(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    po.extend = one_arg("extend", args)? != "0";
    Ok(())
}

/// `size:w[:h[:enlarge[:extend]]]`
fn apply_size(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    if args.is_empty() || args.len() > 4 {
        return Err(ServiceError::invalid_path(format!(
            "invalid size arguments: {:?}",
            args
        )));
    }
    apply_width(po, &args[0..1])?;
    if args.len() >= 2 {
        apply_height(po, &args[1..2])?;
    }
    if args.len() >= 3 {
        apply_enlarge(po, &args[2..3])?;
    }
    if args.len() == 4 {
        apply_extend(po, &args[3..4])?;
    }
    Ok(())
}

/// `resize:type[:size args…]`
fn apply_resize(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    if args.is_empty() || args.len() > 5 {
        return Err(ServiceError::invalid_path(format!(
            "invalid resize arguments: {:?}",
            args
        )));
    }
    po.resize = args[0].parse()?;
    if args.len() > 1 {
        apply_size(po, &args[1..])?;
    }
    Ok(())
}

/// `gravity:kind`, `gravity:kind:offx:offy`, `gravity:fp:x:y`
fn apply_gravity(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    po.gravity = parse_gravity(args)?;
    Ok(())
}

fn parse_gravity(args: &[&str]) -> Result<Gravity, ServiceError> {
    if args.is_empty() {
        return Err(ServiceError::invalid_path("missing gravity"));
    }
    let kind = Gravity::kind_from_str(args[0])
        .ok_or_else(|| ServiceError::invalid_path(format!("invalid gravity: {}", args[0])))?;

    let mut gravity = Gravity::new(kind);
    match kind {
        GravityKind::FocusPoint => {
            if args.len() != 3 {
                return Err(ServiceError::invalid_path("focus point needs x and y"));
            }
            gravity.x = parse_f64("gravity x", args[1])?;
            gravity.y = parse_f64("gravity y", args[2])?;
            if !(0.0..=1.0).contains(&gravity.x) || !(0.0..=1.0).contains(&gravity.y) {
                return Err(ServiceError::invalid_path("focus point out of range"));
            }
        }
        GravityKind::Smart => {
            if args.len() != 1 {
                return Err(ServiceError::invalid_path("smart gravity takes no arguments"));
            }
        }
        _ => match args.len() {
            1 => {}
            3 => {
                gravity.x = parse_f64("gravity x", args[1])?;
                gravity.y = parse_f64("gravity y", args[2])?;
            }
            _ => {
                return Err(ServiceError::invalid_path(format!(
                    "invalid gravity arguments: {:?}",
                    args
                )))
            }
        },
    }
    Ok(gravity)
}

/// `crop:w:h[:gravity[:args…]]`
fn apply_crop(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    if args.len() < 2 {
        return Err(ServiceError::invalid_path(format!(
            "invalid crop arguments: {:?}",
            args
        )));
    }
    let width = parse_u32("crop width", args[0])?;
    let height = parse_u32("crop height", args[1])?;
    let gravity = if args.len() > 2 {
        Some(parse_gravity(&args[2..])?)
    } else {
        None
    };
    po.crop = Some(CropOptions {
        width,
        height,
        gravity,
    });
    Ok(())
}

fn apply_dpr(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    let dpr = parse_f64("dpr", one_arg("dpr", args)?)?;
    if dpr <= 0.0 {
        return Err(ServiceError::invalid_path(format!("invalid dpr: {}", dpr)));
    }
    po.dpr = dpr;
    Ok(())
}

fn apply_quality(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    let quality = parse_u32("quality", one_arg("quality", args)?)?;
    if !(1..=100).contains(&quality) {
        return Err(ServiceError::invalid_path(format!(
            "quality must be within 1 and 100: {}",
            quality
        )));
    }
    po.quality = quality as u8;
    Ok(())
}

/// `background:` clears, `background:RRGGBB` or `background:R:G:B`.
fn apply_background(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    match args.len() {
        1 if args[0].is_empty() => {
            po.background = None;
            Ok(())
        }
        1 => {
            po.background = Some(Color::from_hex(args[0]).ok_or_else(|| {
                ServiceError::invalid_path(format!("invalid background: {}", args[0]))
            })?);
            Ok(())
        }
        3 => {
            let r = parse_u32("background red", args[0])?;
            let g = parse_u32("background green", args[1])?;
            let b = parse_u32("background blue", args[2])?;
            if r > 255 || g > 255 || b > 255 {
                return Err(ServiceError::invalid_path("background channel out of range"));
            }
            po.background = Some(Color::new(r as u8, g as u8, b as u8));
            Ok(())
        }
        _ => Err(ServiceError::invalid_path(format!(
            "invalid background arguments: {:?}",
            args
        ))),
    }
}

fn apply_blur(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    let sigma = parse_f64("blur", one_arg("blur", args)?)?;
    if sigma < 0.0 {
        return Err(ServiceError::invalid_path("blur sigma must not be negative"));
    }
    po.blur = sigma as f32;
    Ok(())
}

fn apply_sharpen(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    let sigma = parse_f64("sharpen", one_arg("sharpen", args)?)?;
    if sigma < 0.0 {
        return Err(ServiceError::invalid_path("sharpen sigma must not be negative"));
    }
    po.sharpen = sigma as f32;
    Ok(())
}

/// `watermark:opacity[:position[:offx:offy[:scale]]]`; position `re`
/// replicates, anything else is a gravity code.
fn apply_watermark(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    if args.is_empty() || args.len() == 3 || args.len() > 5 {
        return Err(ServiceError::invalid_path(format!(
            "invalid watermark arguments: {:?}",
            args
        )));
    }

    let opacity = parse_f64("watermark opacity", args[0])?;
    if !(0.0..=1.0).contains(&opacity) {
        return Err(ServiceError::invalid_path("watermark opacity out of range"));
    }
    po.watermark.enabled = opacity > 0.0;
    po.watermark.opacity = opacity;

    if args.len() > 1 {
        if args[1] == "re" {
            po.watermark.replicate = true;
        } else {
            let kind = Gravity::kind_from_str(args[1]).ok_or_else(|| {
                ServiceError::invalid_path(format!("invalid watermark position: {}", args[1]))
            })?;
            if kind == GravityKind::Smart || kind == GravityKind::FocusPoint {
                return Err(ServiceError::invalid_path(format!(
                    "invalid watermark position: {}",
                    args[1]
                )));
            }
            po.watermark.gravity = Gravity::new(kind);
        }
    }

    if args.len() > 3 {
        po.watermark.offset_x = args[2]
            .parse()
            .map_err(|_| ServiceError::invalid_path(format!("invalid watermark offset: {}", args[2])))?;
        po.watermark.offset_y = args[3]
            .parse()
            .map_err(|_| ServiceError::invalid_path(format!("invalid watermark offset: {}", args[3])))?;
    }

    if args.len() == 5 {
        let scale = parse_f64("watermark scale", args[4])?;
        if scale < 0.0 {
            return Err(ServiceError::invalid_path("watermark scale must not be negative"));
        }
        po.watermark.scale = scale;
    }

    Ok(())
}

fn apply_format(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    let ext = one_arg("format", args)?;
    let format = ImageType::from_ext(ext)
        .ok_or_else(|| ServiceError::invalid_path(format!("invalid format: {}", ext)))?;
    apply_format_type(po, format)
}

/// SVG is accepted here and resolved by the pipeline's passthrough
/// path; every other format must have an encoder.
fn apply_format_type(po: &mut ProcessingOptions, format: ImageType) -> Result<(), ServiceError> {
    if format == ImageType::Unknown {
        return Ok(());
    }
    if format != ImageType::Svg && !format.supports_save() {
        return Err(ServiceError::invalid_path(format!(
            "resulting image type not supported: {}",
            format.ext()
        )));
    }
    po.format = format;
    Ok(())
}

fn apply_max_bytes(po: &mut ProcessingOptions, args: &[&str]) -> Result<(), ServiceError> {
    po.max_bytes = parse_u32("max_bytes", one_arg("max_bytes", args)?)? as usize;
    Ok(())
}
