//! Shared ffmpeg-next plumbing used by both frame-source variants: a
//! software scaler into packed RGB24 and a stride-aware plane copy.
//!
//! Grounded on the corpus's own ffmpeg-next wrapper (the `video-decoder`
//! crate's `decode_video`/`copy_frame_data`): `send_packet`/
//! `receive_frame`, `scaling::Context::get` into a fixed pixel format, and
//! copying plane 0 row by row because a decoded frame's stride can exceed
//! `width * bytes_per_pixel`.

use base::{err, Error};
use ffmpeg_next as ffmpeg;

use crate::model::RawImage;

pub(crate) fn new_rgb24_scaler(
    src_format: ffmpeg::format::Pixel,
    width: u32,
    height: u32,
) -> Result<ffmpeg::software::scaling::context::Context, Error> {
    ffmpeg::software::scaling::context::Context::get(
        src_format,
        width,
        height,
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )
    .map_err(|e| err!(DecodeFailure, msg("creating RGB24 scaler"), source(e)))
}

/// Packs plane 0 of an already-RGB24 frame into a contiguous, stride-free
/// buffer.
pub(crate) fn pack_rgb24(frame: &ffmpeg::util::frame::Video) -> RawImage {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let plane = frame.data(0);
    let mut packed = Vec::with_capacity((width as usize) * (height as usize) * 3);
    for y in 0..height as usize {
        let row_start = y * stride;
        let row_end = row_start + (width as usize) * 3;
        packed.extend_from_slice(&plane[row_start..row_end]);
    }
    RawImage {
        width,
        height,
        rgb: bytes::Bytes::from(packed),
    }
}
