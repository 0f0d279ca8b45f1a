//! Configuration types consumed by the pipeline stages.
//!
//! Parsing a config *file* and merging CLI flags into it is out of scope
//! for this crate (spec §1); these are the plain value types the stages
//! are driven by, plus the invariant checks spec §4.1/§7 require the
//! pipeline itself to enforce.

use std::path::PathBuf;

use base::{err, Error};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// Configuration for the detector and OTDET writer (C2, C4).
#[derive(Clone, Debug)]
pub struct DetectConfig {
    pub weights: PathBuf,
    pub conf: f32,
    pub iou: f32,
    pub image_size: u32,
    pub half_precision: bool,
    pub device: Device,
    /// `true`: emit top-left-anchored xywh from the model's native output
    /// space before conversion; `false`: model output is already in pixel
    /// space. Either way the converter always emits center-xywh pixel
    /// coordinates (spec §4.2).
    pub normalized: bool,
    pub chunksize: usize,
    pub detect_start: Option<f64>,
    pub detect_end: Option<f64>,
    pub expected_duration: Option<f64>,
    pub overwrite: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        DetectConfig {
            weights: PathBuf::new(),
            conf: 0.25,
            iou: 0.45,
            image_size: 640,
            half_precision: false,
            device: Device::default(),
            normalized: false,
            chunksize: 1,
            detect_start: None,
            detect_end: None,
            expected_duration: None,
            overwrite: false,
        }
    }
}

/// IOU tracker parameters (C5), shared with the chunked/grouped tracker
/// (C6) and the unfinished-chunks buffer (C7).
#[derive(Clone, Copy, Debug)]
pub struct IouParams {
    pub sigma_l: f32,
    pub sigma_h: f32,
    pub sigma_iou: f32,
    pub t_min: u32,
    pub t_miss_max: u32,
}

impl Default for IouParams {
    fn default() -> Self {
        IouParams {
            sigma_l: 0.1,
            sigma_h: 0.5,
            sigma_iou: 0.3,
            t_min: 0,
            t_miss_max: 5,
        }
    }
}

/// Configuration for the chunked tracker / unfinished-chunks buffer / track
/// exporter (C6-C8).
#[derive(Clone, Debug)]
pub struct TrackConfig {
    pub iou: IouParams,
    pub merge_threshold: jiff::Span,
    pub keep_discarded: bool,
    pub overwrite: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        TrackConfig {
            iou: IouParams::default(),
            merge_threshold: jiff::Span::new().seconds(60),
            keep_discarded: false,
            overwrite: false,
        }
    }
}

/// Configuration for the RTSP stream frame source (C1 stream variant).
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub rtsp_url: String,
    /// `N`: number of frames between flushes.
    pub flush_buffer_size: usize,
    pub output_fps: f64,
    pub save_dir: PathBuf,
    pub reconnect_fail_threshold: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            rtsp_url: String::new(),
            flush_buffer_size: 60,
            output_fps: 20.0,
            save_dir: PathBuf::from("."),
            reconnect_fail_threshold: 5,
        }
    }
}

/// Spec §4.1: "if a `StreamConfig` is present, `t_min < N` and
/// `t_miss_max < N`, otherwise fail on startup (tracks could never
/// complete within a single emitted artifact)."
pub fn validate_stream_track_invariant(
    stream: &StreamConfig,
    iou: &IouParams,
) -> Result<(), Error> {
    let n = stream.flush_buffer_size as u32;
    if iou.t_min >= n {
        return Err(err!(
            ConfigInvalid,
            msg("t_min ({}) must be less than flush_buffer_size ({})", iou.t_min, n)
        ));
    }
    if iou.t_miss_max >= n {
        return Err(err!(
            ConfigInvalid,
            msg(
                "t_miss_max ({}) must be less than flush_buffer_size ({})",
                iou.t_miss_max,
                n
            )
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_t_min_too_large() {
        let stream = StreamConfig {
            flush_buffer_size: 10,
            ..Default::default()
        };
        let iou = IouParams {
            t_min: 10,
            t_miss_max: 2,
            ..Default::default()
        };
        let e = validate_stream_track_invariant(&stream, &iou).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::ConfigInvalid);
    }

    #[test]
    fn accepts_valid_combination() {
        let stream = StreamConfig {
            flush_buffer_size: 60,
            ..Default::default()
        };
        let iou = IouParams {
            t_min: 5,
            t_miss_max: 10,
            ..Default::default()
        };
        validate_stream_track_invariant(&stream, &iou).unwrap();
    }
}
