//! Frame source (C1, spec §4.1): produces an ordered sequence of frames
//! from either a set of video files or an RTSP stream, notifying
//! observers of segment boundaries.
//!
//! The two variants share the frame/image data model (`model::Frame`,
//! `model::RawImage`) and the `ffmpeg-next` decode-and-scale pipeline in
//! [`decode`], but otherwise have little in common: the file variant is a
//! finite, synchronous decode loop; the stream variant is an unbounded,
//! cancellable async loop with RTSP reconnection. Each therefore exposes
//! its own `produce` rather than being forced through one trait.

pub(crate) mod decode;
pub mod file;
pub mod stream;
