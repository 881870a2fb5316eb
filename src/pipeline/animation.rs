//! Animated GIF handling
//!
//! Splits the source into composed frames (bounded by the configured
//! frame cap), runs the shared frame transform over each, and joins
//! them back preserving per-frame delays and the loop count. Frames
//! are processed serially on the request's pipeline thread, so the
//! admission bound holds without extra bookkeeping.

use std::io::Cursor;

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::{AnimationDecoder, Frame};

use super::{transform_frame, FramePlan, PipelineContext, ProcessedImage};
use crate::error::ServiceError;
use crate::options::ImageType;
use crate::server::deadline::Deadline;

pub(crate) fn process_animated(
    data: &[u8],
    plan: &FramePlan,
    ctx: &PipelineContext,
    deadline: Deadline,
) -> Result<ProcessedImage, ServiceError> {
    let decoder = GifDecoder::new(Cursor::new(data))
        .map_err(|e| ServiceError::processing(format!("failed to decode gif: {}", e)))?;

    let mut frames: Vec<Frame> = Vec::new();
    for frame in decoder.into_frames() {
        if frames.len() >= ctx.max_animation_frames {
            break;
        }
        let frame =
            frame.map_err(|e| ServiceError::processing(format!("failed to decode gif: {}", e)))?;
        frames.push(frame);
    }
    if frames.is_empty() {
        return Err(ServiceError::processing("gif has no frames"));
    }
    deadline.check()?;

    // The frame stack is one tall image as far as the source guards
    // are concerned; re-check now that the frame count is known.
    let (frame_w, frame_h) = frames[0].buffer().dimensions();
    let stacked_height = u64::from(frame_h) * frames.len() as u64;
    if ctx.max_src_dimension > 0 && stacked_height > u64::from(ctx.max_src_dimension) {
        return Err(ServiceError::SourceDimensionsTooBig);
    }
    if u64::from(frame_w) * stacked_height > ctx.max_src_resolution {
        return Err(ServiceError::SourceResolutionTooBig);
    }

    let loop_count = netscape_loop_count(data);

    let mut transformed: Vec<Frame> = Vec::with_capacity(frames.len());
    for frame in frames {
        let delay = frame.delay();
        let buffer = frame.into_buffer();
        let out = transform_frame(buffer, true, plan, deadline)?;
        transformed.push(Frame::from_parts(out, 0, 0, delay));
    }
    deadline.check()?;

    let (out_w, out_h) = transformed[0].buffer().dimensions();

    let mut encoded = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut encoded, 10);
        let repeat = match loop_count {
            Some(0) => Some(Repeat::Infinite),
            Some(n) => Some(Repeat::Finite(n)),
            None => None,
        };
        if let Some(repeat) = repeat {
            encoder
                .set_repeat(repeat)
                .map_err(|e| ServiceError::processing(format!("failed to encode gif: {}", e)))?;
        }
        encoder
            .encode_frames(transformed)
            .map_err(|e| ServiceError::processing(format!("failed to encode gif: {}", e)))?;
    }

    Ok(ProcessedImage {
        data: encoded,
        format: ImageType::Gif,
        width: out_w,
        height: out_h,
    })
}

/// Scans for the NETSCAPE2.0 application extension carrying the loop
/// count. `Some(0)` means loop forever; `None` means the extension is
/// absent and the animation plays once.
pub(crate) fn netscape_loop_count(data: &[u8]) -> Option<u16> {
    const MARKER: &[u8] = b"NETSCAPE2.0";

    let mut i = 0;
    while i + MARKER.len() + 5 <= data.len() {
        if data[i] == 0x21
            && data[i + 1] == 0xFF
            && data[i + 2] == 0x0B
            && &data[i + 3..i + 3 + MARKER.len()] == MARKER
        {
            // Sub-block: 0x03, 0x01, loop count LE.
            let at = i + 3 + MARKER.len();
            if at + 4 <= data.len() && data[at] == 0x03 && data[at + 1] == 0x01 {
                return Some(u16::from(data[at + 2]) | u16::from(data[at + 3]) << 8);
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ProcessingOptions;
    use image::{Delay, Rgba, RgbaImage};
    use std::time::Duration;

    fn animated_gif(frames: u32, loops: Option<u16>) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new_with_speed(&mut out, 10);
            if let Some(n) = loops {
                let repeat = if n == 0 { Repeat::Infinite } else { Repeat::Finite(n) };
                encoder.set_repeat(repeat).unwrap();
            }
            for i in 0..frames {
                let shade = ((i * 60) % 256) as u8;
                let img = RgbaImage::from_pixel(32, 16, Rgba([shade, 0, 255 - shade, 255]));
                let frame =
                    Frame::from_parts(img, 0, 0, Delay::from_numer_denom_ms(100, 1));
                encoder.encode_frame(frame).unwrap();
            }
        }
        out
    }

    fn plan(po: &ProcessingOptions) -> FramePlan<'_> {
        FramePlan {
            po,
            target_format: ImageType::Gif,
            source_type: ImageType::Gif,
            orientation: Default::default(),
            linear: false,
            watermark: None,
            allow_scale_on_load: false,
        }
    }

    fn ctx(max_frames: usize) -> PipelineContext<'static> {
        PipelineContext {
            jpeg_progressive: false,
            png_interlaced: false,
            use_linear_colorspace: false,
            max_animation_frames: max_frames,
            max_src_resolution: 16_800_000,
            max_src_dimension: 0,
            watermark: None,
        }
    }

    fn count_frames(data: &[u8]) -> usize {
        GifDecoder::new(Cursor::new(data))
            .unwrap()
            .into_frames()
            .count()
    }

    #[test]
    fn test_frame_count_preserved() {
        let gif = animated_gif(4, Some(0));
        let po = ProcessingOptions::new(80);
        let out = process_animated(
            &gif,
            &plan(&po),
            &ctx(10),
            Deadline::after(Duration::from_secs(30)),
        )
        .unwrap();
        assert_eq!(out.format, ImageType::Gif);
        assert_eq!(count_frames(&out.data), 4);
    }

    #[test]
    fn test_frame_cap_applies() {
        let gif = animated_gif(6, Some(0));
        let po = ProcessingOptions::new(80);
        let out = process_animated(
            &gif,
            &plan(&po),
            &ctx(3),
            Deadline::after(Duration::from_secs(30)),
        )
        .unwrap();
        assert_eq!(count_frames(&out.data), 3);
    }

    #[test]
    fn test_frames_are_resized() {
        let gif = animated_gif(3, Some(0));
        let mut po = ProcessingOptions::new(80);
        po.width = 16;
        po.height = 8;
        let out = process_animated(
            &gif,
            &plan(&po),
            &ctx(10),
            Deadline::after(Duration::from_secs(30)),
        )
        .unwrap();
        assert_eq!((out.width, out.height), (16, 8));
    }

    #[test]
    fn test_loop_count_scan() {
        let infinite = animated_gif(2, Some(0));
        assert_eq!(netscape_loop_count(&infinite), Some(0));

        let finite = animated_gif(2, Some(5));
        assert_eq!(netscape_loop_count(&finite), Some(5));

        let none = animated_gif(2, None);
        assert_eq!(netscape_loop_count(&none), None);
    }

    #[test]
    fn test_loop_count_survives_reencode() {
        let gif = animated_gif(2, Some(7));
        let po = ProcessingOptions::new(80);
        let out = process_animated(
            &gif,
            &plan(&po),
            &ctx(10),
            Deadline::after(Duration::from_secs(30)),
        )
        .unwrap();
        assert_eq!(netscape_loop_count(&out.data), Some(7));
    }

    #[test]
    fn test_resolution_guard_counts_all_frames() {
        let gif = animated_gif(8, Some(0));
        let po = ProcessingOptions::new(80);
        let mut tight = ctx(10);
        tight.max_src_resolution = 32 * 16 * 4; // room for four frames only
        let err = process_animated(
            &gif,
            &plan(&po),
            &tight,
            Deadline::after(Duration::from_secs(30)),
        )
        .unwrap_err();
        assert_eq!(err, ServiceError::SourceResolutionTooBig);
    }
}
