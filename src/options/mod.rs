//! Processing-options model
//!
//! Typed representation of everything a request URL can ask for:
//! image types, resize modes, gravity, crop, watermark and the combined
//! `ProcessingOptions` struct the pipeline consumes.

pub mod parse;
pub mod presets;

use std::str::FromStr;

use crate::error::ServiceError;

pub use parse::{parse_path, split_signature, ParsedRequest};
pub use presets::{parse_preset_line, Presets};

/// The closed set of formats the prober can recognize.
///
/// Load/save support reflects what the imaging backend can actually do;
/// `good_for_web` marks formats acceptable as implicit outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Jpeg,
    Png,
    Webp,
    Gif,
    Ico,
    Svg,
    Heic,
    Tiff,
    Bmp,
    Unknown,
}

impl ImageType {
    pub fn mime(&self) -> &'static str {
        match self {
            ImageType::Jpeg => "image/jpeg",
            ImageType::Png => "image/png",
            ImageType::Webp => "image/webp",
            ImageType::Gif => "image/gif",
            ImageType::Ico => "image/x-icon",
            ImageType::Svg => "image/svg+xml",
            ImageType::Heic => "image/heic",
            ImageType::Tiff => "image/tiff",
            ImageType::Bmp => "image/bmp",
            ImageType::Unknown => "application/octet-stream",
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            ImageType::Jpeg => "jpg",
            ImageType::Png => "png",
            ImageType::Webp => "webp",
            ImageType::Gif => "gif",
            ImageType::Ico => "ico",
            ImageType::Svg => "svg",
            ImageType::Heic => "heic",
            ImageType::Tiff => "tiff",
            ImageType::Bmp => "bmp",
            ImageType::Unknown => "",
        }
    }

    /// Whether the backend can decode this format into a raster.
    ///
    /// SVG is handled by a dedicated passthrough path and HEIC is
    /// detected but not decodable, mirroring a backend built without a
    /// HEIF codec.
    pub fn supports_load(&self) -> bool {
        matches!(
            self,
            ImageType::Jpeg
                | ImageType::Png
                | ImageType::Webp
                | ImageType::Gif
                | ImageType::Ico
                | ImageType::Tiff
                | ImageType::Bmp
        )
    }

    /// Whether the backend has an encoder for this format.
    pub fn supports_save(&self) -> bool {
        matches!(
            self,
            ImageType::Jpeg
                | ImageType::Png
                | ImageType::Webp
                | ImageType::Gif
                | ImageType::Tiff
                | ImageType::Bmp
        )
    }

    /// Formats acceptable as an implicit output when the request names
    /// none. Sources outside this set are re-encoded as JPEG.
    pub fn good_for_web(&self) -> bool {
        matches!(
            self,
            ImageType::Jpeg
                | ImageType::Png
                | ImageType::Webp
                | ImageType::Gif
                | ImageType::Ico
                | ImageType::Svg
        )
    }

    pub fn from_ext(ext: &str) -> Option<ImageType> {
        match ext {
            "jpg" | "jpeg" => Some(ImageType::Jpeg),
            "png" => Some(ImageType::Png),
            "webp" => Some(ImageType::Webp),
            "gif" => Some(ImageType::Gif),
            "ico" => Some(ImageType::Ico),
            "svg" => Some(ImageType::Svg),
            "heic" | "heif" => Some(ImageType::Heic),
            "tiff" | "tif" => Some(ImageType::Tiff),
            "bmp" => Some(ImageType::Bmp),
            _ => None,
        }
    }
}

/// Resize behaviour for the scale computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeType {
    #[default]
    Fit,
    Fill,
    /// Fill when source and target aspect lean the same way, Fit otherwise.
    Auto,
    /// Deprecated alias kept for old URLs; behaves like Fill without enlarge.
    Crop,
}

impl FromStr for ResizeType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fit" => Ok(ResizeType::Fit),
            "fill" => Ok(ResizeType::Fill),
            "auto" => Ok(ResizeType::Auto),
            "crop" => Ok(ResizeType::Crop),
            _ => Err(ServiceError::invalid_path(format!(
                "invalid resize type: {}",
                s
            ))),
        }
    }
}

/// Which part of the image survives a crop or anchors an embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GravityKind {
    Center,
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    /// Content-aware crop.
    Smart,
    /// Normalized focal point; `x`/`y` of [`Gravity`] are fractions.
    FocusPoint,
}

/// Gravity with either pixel offsets (cardinal kinds) or normalized
/// focal-point coordinates (`FocusPoint`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gravity {
    pub kind: GravityKind,
    pub x: f64,
    pub y: f64,
}

impl Default for Gravity {
    fn default() -> Self {
        Gravity {
            kind: GravityKind::Center,
            x: 0.0,
            y: 0.0,
        }
    }
}

impl Gravity {
    pub fn new(kind: GravityKind) -> Self {
        Gravity { kind, x: 0.0, y: 0.0 }
    }

    pub fn kind_from_str(s: &str) -> Option<GravityKind> {
        match s {
            "ce" => Some(GravityKind::Center),
            "no" => Some(GravityKind::North),
            "noea" => Some(GravityKind::NorthEast),
            "ea" => Some(GravityKind::East),
            "soea" => Some(GravityKind::SouthEast),
            "so" => Some(GravityKind::South),
            "sowe" => Some(GravityKind::SouthWest),
            "we" => Some(GravityKind::West),
            "nowe" => Some(GravityKind::NorthWest),
            "sm" => Some(GravityKind::Smart),
            "fp" => Some(GravityKind::FocusPoint),
            _ => None,
        }
    }
}

/// RGB background color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }

    /// Parses a six-hex-digit string like `fafafa`.
    pub fn from_hex(hex: &str) -> Option<Color> {
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Color { r, g, b })
    }
}

/// Per-request watermark directives; the watermark image itself is
/// process-wide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatermarkOptions {
    pub enabled: bool,
    /// Extra opacity multiplier in (0, 1].
    pub opacity: f64,
    /// Tile the watermark over the whole image instead of embedding once.
    pub replicate: bool,
    pub gravity: Gravity,
    pub offset_x: i32,
    pub offset_y: i32,
    /// Watermark size relative to the image; 0 keeps the natural size.
    pub scale: f64,
}

impl Default for WatermarkOptions {
    fn default() -> Self {
        WatermarkOptions {
            enabled: false,
            opacity: 1.0,
            replicate: false,
            gravity: Gravity::new(GravityKind::SouthEast),
            offset_x: 0,
            offset_y: 0,
            scale: 0.0,
        }
    }
}

/// Explicit crop rectangle applied before the target-size crop.
/// Zero means unbounded in that axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CropOptions {
    pub width: u32,
    pub height: u32,
    pub gravity: Option<Gravity>,
}

/// The full request intent, assembled from defaults, presets and URL
/// directives in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOptions {
    pub resize: ResizeType,
    pub width: u32,
    pub height: u32,
    pub dpr: f64,
    pub enlarge: bool,
    pub extend: bool,
    pub gravity: Gravity,
    pub crop: Option<CropOptions>,
    pub background: Option<Color>,
    pub blur: f32,
    pub sharpen: f32,
    pub quality: u8,
    pub format: ImageType,
    pub prefer_webp: bool,
    pub enforce_webp: bool,
    pub flatten: bool,
    pub watermark: WatermarkOptions,
    /// Maximum output size in bytes; 0 disables the re-encode loop.
    pub max_bytes: usize,
    /// Presets already expanded into this struct, in application order.
    pub used_presets: Vec<String>,
}

impl ProcessingOptions {
    /// Defaults before presets and URL directives are applied.
    pub fn new(default_quality: u8) -> Self {
        ProcessingOptions {
            resize: ResizeType::Fit,
            width: 0,
            height: 0,
            dpr: 1.0,
            enlarge: false,
            extend: false,
            gravity: Gravity::default(),
            crop: None,
            background: None,
            blur: 0.0,
            sharpen: 0.0,
            quality: default_quality,
            format: ImageType::Unknown,
            prefer_webp: false,
            enforce_webp: false,
            flatten: false,
            watermark: WatermarkOptions::default(),
            max_bytes: 0,
            used_presets: Vec::new(),
        }
    }

    /// Canonical string used for ETag computation. Every field that can
    /// change output bytes must appear here.
    pub fn cache_key(&self) -> String {
        let mut parts = vec![
            format!("rt{:?}", self.resize),
            format!("w{}", self.width),
            format!("h{}", self.height),
            format!("dpr{}", self.dpr),
            format!("el{}", self.enlarge as u8),
            format!("ex{}", self.extend as u8),
            format!("g{:?}:{}:{}", self.gravity.kind, self.gravity.x, self.gravity.y),
            format!("q{}", self.quality),
            format!("f{}", self.format.ext()),
        ];
        if let Some(crop) = &self.crop {
            let g = crop
                .gravity
                .map(|g| format!("{:?}:{}:{}", g.kind, g.x, g.y))
                .unwrap_or_default();
            parts.push(format!("c{}:{}:{}", crop.width, crop.height, g));
        }
        if let Some(bg) = &self.background {
            parts.push(format!("bg{}:{}:{}", bg.r, bg.g, bg.b));
        }
        if self.blur > 0.0 {
            parts.push(format!("bl{}", self.blur));
        }
        if self.sharpen > 0.0 {
            parts.push(format!("sh{}", self.sharpen));
        }
        if self.flatten {
            parts.push("fl".to_string());
        }
        if self.watermark.enabled {
            let wm = &self.watermark;
            parts.push(format!(
                "wm{}:{}:{:?}:{}:{}:{}",
                wm.opacity, wm.replicate as u8, wm.gravity.kind, wm.offset_x, wm.offset_y, wm.scale
            ));
        }
        if self.max_bytes > 0 {
            parts.push(format!("mb{}", self.max_bytes));
        }
        parts.join("/")
    }
}
