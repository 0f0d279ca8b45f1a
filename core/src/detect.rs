//! The detector contract (C2) and a reference implementation.
//!
//! The neural-network weights themselves are out of scope; `Detector` is a
//! trait so the reference backend can be swapped for any model that can
//! produce bounding boxes, matching spec §1's "pluggable detector"
//! requirement and spec §9's "dynamic dispatch over detector/frame
//! source/tracker maps to a small capability set" note.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use base::{err, Error};

use crate::config::{DetectConfig, Device};
use crate::model::{DetectedFrame, Detection, Frame};

/// The model's class mapping plus the config it was invoked with, exposed
/// alongside the detector so writers (C4) can embed both in an artifact.
#[derive(Clone, Debug)]
pub struct ObjectDetectorMetadata {
    pub model_name: String,
    pub classes: BTreeMap<u32, String>,
    pub config: DetectConfig,
}

/// `detect(lazy<Frame>) -> lazy<DetectedFrame>` (spec §4.2).
pub trait Detector: Send + Sync {
    fn metadata(&self) -> &ObjectDetectorMetadata;

    /// Runs inference on a single frame. Must not be called for frames with
    /// `image = None`; callers (see [`detect_frames`]) filter those out and
    /// pass them through untouched.
    fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, Error>;
}

/// Runs one frame through `detector`, per spec §4.2: a frame with no image
/// passes through with an empty detection list rather than being inferred.
/// Shared by [`detect_frames`] (pull, file-mode pipelines built over an
/// iterator) and the push-style pipeline controller (C9), which calls the
/// frame source's callback directly.
pub fn detect_one(detector: &dyn Detector, frame: Frame) -> Result<DetectedFrame, Error> {
    if frame.image.is_none() {
        return Ok(DetectedFrame {
            frame,
            detections: Vec::new(),
        });
    }
    let detections = detector.infer(&frame)?;
    Ok(DetectedFrame { frame, detections })
}

/// Drives a [`Detector`] over a frame sequence per spec §4.2: frames with
/// no image pass through with an empty detection list; a single-frame
/// inference failure is fatal.
pub fn detect_frames<I>(detector: &dyn Detector, frames: I) -> impl Iterator<Item = Result<DetectedFrame, Error>> + '_
where
    I: IntoIterator<Item = Frame> + 'static,
    I::IntoIter: 'static,
{
    frames.into_iter().map(move |frame| detect_one(detector, frame))
}

/// A label id paired with its string form, so callers needn't round-trip
/// through the class map twice.
pub type LabelId = (u32, &'static str);

/// A raw bounding box as returned by a model, before canonicalization.
#[derive(Clone, Copy, Debug)]
pub struct RawBox {
    pub label: LabelId,
    pub conf: f32,
    /// Either top-left-anchored or center-anchored xywh depending on
    /// `normalized` (see [`to_detection`]).
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Converts a model's raw box into the crate's canonical center-xywh
/// [`Detection`] (spec §4.2: "this spec uses center-xywh everywhere...
/// requires the converter to emit that form regardless of model output").
pub fn to_detection(raw: &RawBox, normalized: bool, image_w: u32, image_h: u32) -> Detection {
    let (cx, cy, w, h) = if normalized {
        // normalized: input is top-left-anchored xywh in [0,1]; convert to
        // center-anchored pixel coordinates.
        let px = raw.x * image_w as f32;
        let py = raw.y * image_h as f32;
        let pw = raw.w * image_w as f32;
        let ph = raw.h * image_h as f32;
        (px + pw / 2.0, py + ph / 2.0, pw, ph)
    } else {
        // already center-anchored pixel coordinates.
        (raw.x, raw.y, raw.w, raw.h)
    };
    Detection {
        label: raw.label.1.to_string(),
        conf: raw.conf,
        x: cx,
        y: cy,
        w,
        h,
    }
}

/// Process-wide, weights-path-keyed model cache (spec §5 "shared
/// resources" / §9 "deep cached factory"): insert-on-first-use, torn down
/// only on process exit.
static MODEL_CACHE: OnceLock<Mutex<BTreeMap<String, Arc<dyn Detector>>>> = OnceLock::new();

fn model_cache() -> &'static Mutex<BTreeMap<String, Arc<dyn Detector>>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Loads (or reuses a cached) detector for `config.weights`, via `loader`.
pub fn cached_detector(
    config: &DetectConfig,
    loader: impl FnOnce(&DetectConfig) -> Result<Arc<dyn Detector>, Error>,
) -> Result<Arc<dyn Detector>, Error> {
    let key = config
        .weights
        .to_str()
        .ok_or_else(|| err!(DetectorFailure, msg("weights path is not valid UTF-8")))?
        .to_string();
    let mut cache = model_cache().lock().unwrap();
    if let Some(existing) = cache.get(&key) {
        return Ok(existing.clone());
    }
    let detector = loader(config)?;
    cache.insert(key, detector.clone());
    Ok(detector)
}

/// Resolves the device to actually run on given [`Device::Auto`] and
/// whether a GPU is available (spec §4.2: "auto-detected: use GPU when
/// available, else CPU").
pub fn resolve_device(requested: Device, gpu_available: bool) -> Device {
    match requested {
        Device::Auto if gpu_available => Device::Gpu,
        Device::Auto => Device::Cpu,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::Timestamp;

    fn frame(no: u64, with_image: bool) -> Frame {
        Frame {
            no,
            occurrence: Timestamp::UNIX_EPOCH,
            source: "s".into(),
            output: "o".into(),
            image: with_image.then(|| crate::model::RawImage {
                width: 10,
                height: 10,
                rgb: bytes::Bytes::from_static(&[0u8; 300]),
            }),
        }
    }

    struct Echo;
    impl Detector for Echo {
        fn metadata(&self) -> &ObjectDetectorMetadata {
            unreachable!("not used in this test")
        }
        fn infer(&self, _frame: &Frame) -> Result<Vec<Detection>, Error> {
            Ok(vec![Detection {
                label: "car".into(),
                conf: 0.9,
                x: 1.0,
                y: 1.0,
                w: 1.0,
                h: 1.0,
            }])
        }
    }

    #[test]
    fn null_image_frames_pass_through_without_inference() {
        let detector = Echo;
        let frames = vec![frame(1, true), frame(2, false)];
        let out: Vec<_> = detect_frames(&detector, frames).collect::<Result<_, _>>().unwrap();
        assert_eq!(out[0].detections.len(), 1);
        assert!(out[1].detections.is_empty());
    }

    #[test]
    fn center_xywh_conversion_from_normalized_top_left() {
        let raw = RawBox {
            label: (0, "car"),
            conf: 0.5,
            x: 0.1,
            y: 0.2,
            w: 0.2,
            h: 0.1,
        };
        let d = to_detection(&raw, true, 100, 100);
        assert_eq!(d.x, 20.0);
        assert_eq!(d.y, 25.0);
        assert_eq!(d.w, 20.0);
        assert_eq!(d.h, 10.0);
    }

    #[test]
    fn resolves_auto_device_from_availability() {
        assert_eq!(resolve_device(Device::Auto, true), Device::Gpu);
        assert_eq!(resolve_device(Device::Auto, false), Device::Cpu);
        assert_eq!(resolve_device(Device::Cpu, true), Device::Cpu);
    }
}
