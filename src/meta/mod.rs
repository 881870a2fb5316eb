//! Header-only format probing
//!
//! Detects the image format and intrinsic dimensions from a byte prefix
//! without decoding any pixels. The fetcher feeds it the growing
//! download buffer; [`ProbeResult::NeedMore`] asks for more bytes when a
//! header (e.g. a JPEG SOF behind a large EXIF block) has not arrived
//! yet.

use crate::options::ImageType;

/// Probe outcome over a (possibly partial) byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Found(ImageMeta),
    /// The prefix is consistent with a supported format but the
    /// dimension header is not in the buffer yet.
    NeedMore,
    Unsupported,
}

/// Detected format and intrinsic size. ICO, SVG and HEIC report zero
/// dimensions; their sizing is resolved at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMeta {
    pub format: ImageType,
    pub width: u32,
    pub height: u32,
}

impl ImageMeta {
    fn new(format: ImageType, width: u32, height: u32) -> ProbeResult {
        ProbeResult::Found(ImageMeta {
            format,
            width,
            height,
        })
    }
}

/// Minimum bytes before giving a definitive `Unsupported` answer.
const MIN_PROBE_BYTES: usize = 16;

/// Probes `buf`. `eof` marks the buffer as the complete source, turning
/// `NeedMore` into `Unsupported`. `max_svg_bytes` caps the SVG
/// look-ahead.
pub fn probe(buf: &[u8], eof: bool, max_svg_bytes: usize) -> ProbeResult {
    if buf.len() < MIN_PROBE_BYTES && !eof {
        return ProbeResult::NeedMore;
    }
    if buf.len() < 4 {
        return ProbeResult::Unsupported;
    }

    let result = if buf.starts_with(&[0xFF, 0xD8, 0xFF]) {
        probe_jpeg(buf)
    } else if buf.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        probe_png(buf)
    } else if buf.starts_with(b"GIF87a") || buf.starts_with(b"GIF89a") {
        probe_gif(buf)
    } else if buf.starts_with(b"RIFF") && buf.len() >= 12 && &buf[8..12] == b"WEBP" {
        probe_webp(buf)
    } else if buf.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        ImageMeta::new(ImageType::Ico, 0, 0)
    } else if buf.len() >= 12 && &buf[4..8] == b"ftyp" {
        probe_heic(buf)
    } else if buf.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || buf.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        probe_tiff(buf)
    } else if buf.starts_with(b"BM") {
        probe_bmp(buf)
    } else {
        probe_svg(buf, eof, max_svg_bytes)
    };

    match result {
        ProbeResult::NeedMore if eof => ProbeResult::Unsupported,
        other => other,
    }
}

fn be16(buf: &[u8], at: usize) -> u32 {
    u32::from(buf[at]) << 8 | u32::from(buf[at + 1])
}

fn le16(buf: &[u8], at: usize) -> u32 {
    u32::from(buf[at]) | u32::from(buf[at + 1]) << 8
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Walks JPEG segments until a start-of-frame marker carries the
/// dimensions.
fn probe_jpeg(buf: &[u8]) -> ProbeResult {
    let mut i = 2;
    loop {
        if i + 4 > buf.len() {
            return ProbeResult::NeedMore;
        }
        if buf[i] != 0xFF {
            return ProbeResult::Unsupported;
        }
        let mut marker = buf[i + 1];
        // Fill bytes before a marker are legal.
        while marker == 0xFF {
            i += 1;
            if i + 4 > buf.len() {
                return ProbeResult::NeedMore;
            }
            marker = buf[i + 1];
        }
        match marker {
            // SOF0..SOF15 minus DHT/JPG/DAC carry the frame header.
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                if i + 9 > buf.len() {
                    return ProbeResult::NeedMore;
                }
                let height = be16(buf, i + 5);
                let width = be16(buf, i + 7);
                return ImageMeta::new(ImageType::Jpeg, width, height);
            }
            // Standalone markers without a length field.
            0xD0..=0xD9 | 0x01 => {
                i += 2;
            }
            // Start of scan before any SOF means a broken stream.
            0xDA => return ProbeResult::Unsupported,
            _ => {
                let len = be16(buf, i + 2) as usize;
                if len < 2 {
                    return ProbeResult::Unsupported;
                }
                i += 2 + len;
            }
        }
    }
}

fn probe_png(buf: &[u8]) -> ProbeResult {
    if buf.len() < 24 {
        return ProbeResult::NeedMore;
    }
    if &buf[12..16] != b"IHDR" {
        return ProbeResult::Unsupported;
    }
    ImageMeta::new(ImageType::Png, be32(buf, 16), be32(buf, 20))
}

fn probe_gif(buf: &[u8]) -> ProbeResult {
    if buf.len() < 10 {
        return ProbeResult::NeedMore;
    }
    ImageMeta::new(ImageType::Gif, le16(buf, 6), le16(buf, 8))
}

fn probe_webp(buf: &[u8]) -> ProbeResult {
    if buf.len() < 16 {
        return ProbeResult::NeedMore;
    }
    match &buf[12..16] {
        b"VP8 " => {
            if buf.len() < 30 {
                return ProbeResult::NeedMore;
            }
            // Lossy bitstream: sync code then 14-bit dimensions.
            if buf[23] != 0x9D || buf[24] != 0x01 || buf[25] != 0x2A {
                return ProbeResult::Unsupported;
            }
            ImageMeta::new(ImageType::Webp, le16(buf, 26) & 0x3FFF, le16(buf, 28) & 0x3FFF)
        }
        b"VP8L" => {
            if buf.len() < 25 {
                return ProbeResult::NeedMore;
            }
            if buf[20] != 0x2F {
                return ProbeResult::Unsupported;
            }
            let bits = le32(buf, 21);
            let width = (bits & 0x3FFF) + 1;
            let height = ((bits >> 14) & 0x3FFF) + 1;
            ImageMeta::new(ImageType::Webp, width, height)
        }
        b"VP8X" => {
            if buf.len() < 30 {
                return ProbeResult::NeedMore;
            }
            let width = 1 + (le32(buf, 24) & 0x00FF_FFFF);
            let height =
                1 + (u32::from(buf[27]) | u32::from(buf[28]) << 8 | u32::from(buf[29]) << 16);
            ImageMeta::new(ImageType::Webp, width, height)
        }
        _ => ProbeResult::Unsupported,
    }
}

const HEIC_BRANDS: [&[u8; 4]; 10] = [
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"hevm", b"hevs", b"mif1", b"msf1",
];

fn probe_heic(buf: &[u8]) -> ProbeResult {
    let brand = &buf[8..12];
    if HEIC_BRANDS.iter().any(|b| &b[..] == brand) {
        // Dimensions live deep in the meta box; the backend cannot load
        // HEIC anyway, so zero is enough for the guards.
        ImageMeta::new(ImageType::Heic, 0, 0)
    } else {
        ProbeResult::Unsupported
    }
}

/// Bounded IFD walk for ImageWidth (256) / ImageLength (257).
fn probe_tiff(buf: &[u8]) -> ProbeResult {
    let little = buf[0] == 0x49;
    let read16 = |at: usize| if little { le16(buf, at) } else { be16(buf, at) };
    let read32 = |at: usize| if little { le32(buf, at) } else { be32(buf, at) };

    if buf.len() < 8 {
        return ProbeResult::NeedMore;
    }
    let ifd = read32(4) as usize;
    if ifd + 2 > buf.len() {
        return ProbeResult::NeedMore;
    }
    let entries = read16(ifd) as usize;
    if ifd + 2 + entries * 12 > buf.len() {
        return ProbeResult::NeedMore;
    }

    let mut width = 0u32;
    let mut height = 0u32;
    for n in 0..entries {
        let at = ifd + 2 + n * 12;
        let tag = read16(at);
        let kind = read16(at + 2);
        // Inline SHORT or LONG values only.
        let value = match kind {
            3 => read16(at + 8),
            4 => read32(at + 8),
            _ => continue,
        };
        match tag {
            256 => width = value,
            257 => height = value,
            _ => {}
        }
    }

    if width == 0 || height == 0 {
        return ProbeResult::Unsupported;
    }
    ImageMeta::new(ImageType::Tiff, width, height)
}

fn probe_bmp(buf: &[u8]) -> ProbeResult {
    if buf.len() < 26 {
        return ProbeResult::NeedMore;
    }
    let header_size = le32(buf, 14);
    if header_size >= 40 {
        let width = le32(buf, 18) as i32;
        let height = (le32(buf, 22) as i32).unsigned_abs();
        if width <= 0 {
            return ProbeResult::Unsupported;
        }
        ImageMeta::new(ImageType::Bmp, width as u32, height)
    } else if header_size == 12 {
        ImageMeta::new(ImageType::Bmp, le16(buf, 18), le16(buf, 20))
    } else {
        ProbeResult::Unsupported
    }
}

/// SVG check: the document must lead with markup and contain an `<svg`
/// root within the capped look-ahead.
fn probe_svg(buf: &[u8], eof: bool, max_svg_bytes: usize) -> ProbeResult {
    let window = &buf[..buf.len().min(max_svg_bytes)];
    let text = String::from_utf8_lossy(window);
    let trimmed = text.trim_start_matches(['\u{feff}', ' ', '\t', '\r', '\n']);

    if !trimmed.starts_with("<?xml") && !trimmed.starts_with("<svg") && !trimmed.starts_with("<!--")
    {
        return ProbeResult::Unsupported;
    }
    if trimmed.contains("<svg") {
        return ImageMeta::new(ImageType::Svg, 0, 0);
    }
    if buf.len() >= max_svg_bytes || eof {
        ProbeResult::Unsupported
    } else {
        ProbeResult::NeedMore
    }
}
