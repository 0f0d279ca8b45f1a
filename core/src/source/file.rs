//! File-mode frame source (spec §4.1 "File variant"): decodes video files
//! in order, applies rotation and the `detect_start..detect_end` window,
//! and fires one `FlushEvent` per file once its frames have all been
//! yielded.
//!
//! The decode loop (open input, find the best video stream, decoder,
//! `send_packet`/`receive_frame`, scale to RGB24) is grounded on the
//! corpus's own ffmpeg-next wrapper (the `video-decoder` crate's
//! `decode_video`).

use std::path::{Path, PathBuf};

use base::{err, Error, ResultExt};
use ffmpeg_next as ffmpeg;
use jiff::Span;
use tracing::warn;

use crate::config::DetectConfig;
use crate::filename;
use crate::model::{FlushEvent, Frame, RawImage, SegmentMetadata};
use crate::observer::SyncSubject;
use crate::otdet;

use super::decode::{new_rgb24_scaler, pack_rgb24};

fn init_ffmpeg() -> Result<(), Error> {
    static INIT: std::sync::OnceLock<Result<(), String>> = std::sync::OnceLock::new();
    INIT.get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|msg| err!(DecodeFailure, msg("initializing ffmpeg: {msg}")))
}

#[derive(Default)]
pub struct FileFrameSource {
    pub on_flush: SyncSubject<FlushEvent>,
}

impl FileFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `paths` in order. `on_frame` is called once per decoded
    /// frame in `(occurrence, no)` order; `on_flush` fires once per
    /// accepted file after its last frame. A file that fails its
    /// pre-checks or decode is skipped with a warning; the run continues
    /// with the next file (spec §4.1, §7 `DecodeFailure`/`FilenameMalformed`
    /// /`OutputExists`: "never an abort").
    pub fn produce(
        &self,
        paths: &[PathBuf],
        config: &DetectConfig,
        mut on_frame: impl FnMut(Frame) -> Result<(), Error>,
    ) -> Result<(), Error> {
        init_ffmpeg()?;
        for path in paths {
            if let Err(e) = self.produce_one(path, config, &mut on_frame) {
                warn!(path = %path.display(), error = %e.chain(), "skipping file");
            }
        }
        Ok(())
    }

    fn produce_one(
        &self,
        path: &Path,
        config: &DetectConfig,
        on_frame: &mut impl FnMut(Frame) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let parsed_name = filename::parse(path)?;

        let sibling = otdet::resolve_save_path(path, config);
        if !config.overwrite && sibling.exists() {
            return Err(err!(OutputExists, msg("otdet artifact already exists for {:?}", path)));
        }

        let mut ictx =
            ffmpeg::format::input(path).map_err(|e| err!(IoFailure, msg("opening {:?}", path), source(e)))?;
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| err!(DecodeFailure, msg("no video stream in {:?}", path)))?;
        let stream_index = stream.index();

        let rotation = rotation_from_metadata(stream.metadata().get("rotate"));
        if rotation % 90 != 0 {
            return Err(err!(
                DecodeFailure,
                msg("rotation {rotation} in {:?} is not a multiple of 90 degrees", path)
            ));
        }

        let fps = stream.avg_frame_rate();
        let recorded_fps = if fps.denominator() != 0 {
            fps.numerator() as f64 / fps.denominator() as f64
        } else {
            0.0
        };
        if recorded_fps <= 0.0 {
            return Err(err!(DecodeFailure, msg("could not determine frame rate for {:?}", path)));
        }

        let ictx_duration_secs = if ictx.duration() > 0 {
            Some(ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
        } else {
            None
        };

        let context_decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| err!(DecodeFailure, msg("creating decoder context for {:?}", path), source(e)))?;
        let mut decoder = context_decoder
            .decoder()
            .video()
            .map_err(|e| err!(DecodeFailure, msg("opening video decoder for {:?}", path), source(e)))?;

        let decoder_width = decoder.width();
        let decoder_height = decoder.height();
        let mut scaler = new_rgb24_scaler(decoder.format(), decoder_width, decoder_height)?;
        let (out_width, out_height) = rotated_dimensions(decoder_width, decoder_height, rotation);

        let source = path.to_string_lossy().to_string();
        let mut frame_no: u64 = 0;
        let mut decoded = ffmpeg::util::frame::Video::empty();

        for (packet_stream, packet) in ictx.packets() {
            if packet_stream.index() != stream_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .context(format!("decoding packet in {:?}", path))?;
            while decoder.receive_frame(&mut decoded).is_ok() {
                frame_no += 1;
                let frame = self.build_frame(
                    &mut scaler,
                    &decoded,
                    rotation,
                    frame_no,
                    recorded_fps,
                    config,
                    &parsed_name,
                    &source,
                )?;
                on_frame(frame)?;
            }
        }
        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded).is_ok() {
            frame_no += 1;
            let frame = self.build_frame(
                &mut scaler,
                &decoded,
                rotation,
                frame_no,
                recorded_fps,
                config,
                &parsed_name,
                &source,
            )?;
            on_frame(frame)?;
        }

        let duration_secs = config
            .expected_duration
            .or(ictx_duration_secs)
            .unwrap_or(frame_no as f64 / recorded_fps);

        self.on_flush.notify(&FlushEvent {
            source_metadata: SegmentMetadata {
                source: source.clone(),
                output: source,
                duration_secs,
                width: out_width,
                height: out_height,
                recorded_fps,
                start_time: parsed_name.start,
            },
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_frame(
        &self,
        scaler: &mut ffmpeg::software::scaling::context::Context,
        decoded: &ffmpeg::util::frame::Video,
        rotation: i32,
        frame_no: u64,
        recorded_fps: f64,
        config: &DetectConfig,
        parsed_name: &filename::ParsedFilename,
        source: &str,
    ) -> Result<Frame, Error> {
        let in_window = in_detect_window(frame_no, recorded_fps, config.detect_start, config.detect_end);
        let image = if in_window {
            let mut rgb = ffmpeg::util::frame::Video::empty();
            scaler
                .run(decoded, &mut rgb)
                .map_err(|e| err!(DecodeFailure, msg("scaling frame to RGB24"), source(e)))?;
            Some(apply_rotation(pack_rgb24(&rgb), rotation))
        } else {
            None
        };

        let occurrence = parsed_name
            .start
            .checked_add(Span::new().milliseconds((((frame_no - 1) as f64 / recorded_fps) * 1000.0).round() as i64))
            .unwrap_or(parsed_name.start);

        Ok(Frame {
            no: frame_no,
            occurrence,
            source: source.to_string(),
            output: source.to_string(),
            image,
        })
    }
}

/// Spec §4.1 file variant: `detect_start ≤ frame_number < detect_end`,
/// both converted from seconds to frames via the file's FPS; absent
/// bounds mean "no restriction on that side".
fn in_detect_window(frame_no: u64, fps: f64, detect_start: Option<f64>, detect_end: Option<f64>) -> bool {
    if detect_start.is_none() && detect_end.is_none() {
        return true;
    }
    let start_frame = detect_start.unwrap_or(0.0) * fps;
    let end_frame = detect_end.map(|e| e * fps).unwrap_or(f64::INFINITY);
    (frame_no as f64) >= start_frame && (frame_no as f64) < end_frame
}

fn rotation_from_metadata(tag: Option<&str>) -> i32 {
    tag.and_then(|s| s.parse::<i32>().ok()).unwrap_or(0)
}

fn rotated_dimensions(width: u32, height: u32, rotation: i32) -> (u32, u32) {
    match rotation.rem_euclid(360) {
        90 | 270 => (height, width),
        _ => (width, height),
    }
}

/// Rotates a packed RGB24 image by a multiple of 90 degrees (spec §4.1
/// file variant: "if a rotation side-datum is present ... apply the
/// rotation").
fn apply_rotation(image: RawImage, rotation: i32) -> RawImage {
    match rotation.rem_euclid(360) {
        90 => rotate90(&image, true),
        180 => rotate180(&image),
        270 => rotate90(&image, false),
        _ => image,
    }
}

fn rotate90(image: &RawImage, clockwise: bool) -> RawImage {
    let (w, h) = (image.width as usize, image.height as usize);
    let mut out = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            let (nx, ny) = if clockwise { (h - 1 - y, x) } else { (y, w - 1 - x) };
            let dst = (ny * h + nx) * 3;
            out[dst..dst + 3].copy_from_slice(&image.rgb[src..src + 3]);
        }
    }
    RawImage {
        width: image.height,
        height: image.width,
        rgb: bytes::Bytes::from(out),
    }
}

fn rotate180(image: &RawImage) -> RawImage {
    let (w, h) = (image.width as usize, image.height as usize);
    let mut out = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            let dst = ((h - 1 - y) * w + (w - 1 - x)) * 3;
            out[dst..dst + 3].copy_from_slice(&image.rgb[src..src + 3]);
        }
    }
    RawImage {
        width: image.width,
        height: image.height,
        rgb: bytes::Bytes::from(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_window_defaults_to_unrestricted() {
        assert!(in_detect_window(1, 30.0, None, None));
        assert!(in_detect_window(1_000_000, 30.0, None, None));
    }

    #[test]
    fn detect_window_respects_start_and_end_in_frames() {
        // 30fps, start=1s -> frame 30, end=2s -> frame 60.
        assert!(!in_detect_window(29, 30.0, Some(1.0), Some(2.0)));
        assert!(in_detect_window(30, 30.0, Some(1.0), Some(2.0)));
        assert!(in_detect_window(59, 30.0, Some(1.0), Some(2.0)));
        assert!(!in_detect_window(60, 30.0, Some(1.0), Some(2.0)));
    }

    #[test]
    fn rotation_from_metadata_defaults_to_zero() {
        assert_eq!(rotation_from_metadata(None), 0);
        assert_eq!(rotation_from_metadata(Some("not a number")), 0);
        assert_eq!(rotation_from_metadata(Some("90")), 90);
    }

    #[test]
    fn rotated_dimensions_swap_on_quarter_turns() {
        assert_eq!(rotated_dimensions(640, 480, 0), (640, 480));
        assert_eq!(rotated_dimensions(640, 480, 90), (480, 640));
        assert_eq!(rotated_dimensions(640, 480, 180), (640, 480));
        assert_eq!(rotated_dimensions(640, 480, 270), (480, 640));
        assert_eq!(rotated_dimensions(640, 480, -90), (480, 640));
    }

    fn solid(w: u32, h: u32, f: impl Fn(u32, u32) -> (u8, u8, u8)) -> RawImage {
        let mut data = vec![0u8; (w * h * 3) as usize];
        for y in 0..h {
            for x in 0..w {
                let (r, g, b) = f(x, y);
                let i = ((y * w + x) * 3) as usize;
                data[i] = r;
                data[i + 1] = g;
                data[i + 2] = b;
            }
        }
        RawImage { width: w, height: h, rgb: bytes::Bytes::from(data) }
    }

    #[test]
    fn rotate90_clockwise_moves_top_left_to_top_right() {
        // A 2x1 image where the left pixel is red and the right is green.
        let image = solid(2, 1, |x, _y| if x == 0 { (255, 0, 0) } else { (0, 255, 0) });
        let rotated = rotate90(&image, true);
        assert_eq!((rotated.width, rotated.height), (1, 2));
        // Clockwise: original top-left ends up at top-right, i.e. (0,0) of
        // the 1x2 result.
        assert_eq!(&rotated.rgb[0..3], &[255, 0, 0]);
        assert_eq!(&rotated.rgb[3..6], &[0, 255, 0]);
    }

    #[test]
    fn rotate180_reverses_both_axes() {
        let image = solid(2, 2, |x, y| (x as u8, y as u8, 0));
        let rotated = rotate180(&image);
        assert_eq!((rotated.width, rotated.height), (2, 2));
        // (0,0) -> (1,1)
        let idx = (1 * 2 + 1) * 3;
        assert_eq!(&rotated.rgb[idx..idx + 2], &[0, 0]);
    }

    #[test]
    fn apply_rotation_zero_is_identity() {
        let image = solid(2, 2, |x, y| (x as u8, y as u8, 0));
        let rotated = apply_rotation(image.clone(), 0);
        assert_eq!(rotated.width, image.width);
        assert_eq!(&rotated.rgb[..], &image.rgb[..]);
    }
}
