//! Tracking: the per-frame IOU algorithm (C5), the chunked/grouped tracker
//! that runs it per `FrameGroup` (C6), and the unfinished-chunks buffer
//! that closes tracks across chunk boundaries (C7).

pub mod chunked;
pub mod iou;
pub mod unfinished;

use base::Error;

use crate::idgen::TrackIdGenerator;
use crate::model::{Frame, TrackedFrame};

/// The tracker capability (spec §9: "dynamic dispatch over detector/frame
/// source/tracker maps to a small capability set"). IOU is the only
/// implementation specified; others share this contract.
pub trait Tracker {
    fn track_frame(
        &mut self,
        frame: Frame,
        detections: Vec<crate::model::Detection>,
        idgen: &TrackIdGenerator,
    ) -> Result<TrackedFrame, Error>;
}
