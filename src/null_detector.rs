//! Placeholder [`Detector`] used by the `detect` subcommand until a real
//! model backend is wired in — the neural-network weights themselves are
//! explicitly out of scope (spec §1 "pluggable detector"). It loads no
//! weights and reports zero detections per frame, which is enough to
//! exercise the rest of the pipeline (C2's null-image passthrough, C3's
//! buffering, C4's writer) end to end.

use otvision_core::config::DetectConfig;
use otvision_core::detect::{Detector, ObjectDetectorMetadata};
use otvision_core::model::{Detection, Frame};

use base::Error;

pub struct NullDetector {
    metadata: ObjectDetectorMetadata,
}

impl NullDetector {
    pub fn load(config: &DetectConfig) -> Result<Self, Error> {
        Ok(NullDetector {
            metadata: ObjectDetectorMetadata {
                model_name: "null".to_string(),
                classes: Default::default(),
                config: config.clone(),
            },
        })
    }
}

impl Detector for NullDetector {
    fn metadata(&self) -> &ObjectDetectorMetadata {
        &self.metadata
    }

    fn infer(&self, _frame: &Frame) -> Result<Vec<Detection>, Error> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::Timestamp;

    #[test]
    fn reports_no_detections() {
        let config = DetectConfig::default();
        let detector = NullDetector::load(&config).unwrap();
        let frame = Frame {
            no: 1,
            occurrence: Timestamp::UNIX_EPOCH,
            source: "s".into(),
            output: "o".into(),
            image: Some(otvision_core::model::RawImage {
                width: 2,
                height: 2,
                rgb: bytes::Bytes::from_static(&[0u8; 12]),
            }),
        };
        assert!(detector.infer(&frame).unwrap().is_empty());
    }
}
