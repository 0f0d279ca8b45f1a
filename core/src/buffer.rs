//! Detected-frame buffer (C3): a pass-through filter that simultaneously
//! accumulates image-stripped frames, snapshotting and clearing on every
//! `FlushEvent` (spec §4.3).

use std::sync::Mutex;

use crate::model::{DetectedFrame, DetectedFrameBufferEvent, FlushEvent, SegmentMetadata};
use crate::observer::SyncSubject;

#[derive(Default)]
pub struct DetectedFrameBuffer {
    accumulated: Mutex<Vec<DetectedFrame>>,
    pub on_buffer_event: SyncSubject<DetectedFrameBufferEvent>,
}

impl DetectedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes `frame` through unchanged to the caller while retaining an
    /// image-stripped copy in the accumulator.
    pub fn observe(&self, frame: &DetectedFrame) {
        let retained = DetectedFrame {
            frame: frame.frame.without_image(),
            detections: frame.detections.clone(),
        };
        self.accumulated.lock().unwrap().push(retained);
    }

    /// Handles a `FlushEvent` from C1: atomically snapshot, clear, and (if
    /// non-empty) notify observers with the segment's frames.
    pub fn on_flush(&self, event: &FlushEvent) {
        let frames = std::mem::take(&mut *self.accumulated.lock().unwrap());
        if frames.is_empty() {
            return;
        }
        self.on_buffer_event.notify(&DetectedFrameBufferEvent {
            source_metadata: event.source_metadata.clone(),
            frames,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Frame, SegmentMetadata};
    use jiff::Timestamp;
    use std::sync::{Arc, Mutex as StdMutex};

    fn frame(no: u64) -> Frame {
        Frame {
            no,
            occurrence: Timestamp::UNIX_EPOCH,
            source: "s".into(),
            output: "o".into(),
            image: None,
        }
    }

    fn metadata() -> SegmentMetadata {
        SegmentMetadata {
            source: "s".into(),
            output: "o".into(),
            duration_secs: 1.0,
            width: 10,
            height: 10,
            recorded_fps: 1.0,
            start_time: Timestamp::UNIX_EPOCH,
        }
    }

    #[test]
    fn flush_with_no_frames_emits_nothing() {
        let buffer = DetectedFrameBuffer::new();
        let seen = Arc::new(StdMutex::new(false));
        {
            let seen = seen.clone();
            buffer
                .on_buffer_event
                .register(Arc::new(move |_: &DetectedFrameBufferEvent| {
                    *seen.lock().unwrap() = true;
                    Ok(())
                }));
        }
        buffer.on_flush(&FlushEvent {
            source_metadata: metadata(),
        });
        assert!(!*seen.lock().unwrap());
    }

    #[test]
    fn flush_snapshots_and_clears_accumulated_frames() {
        let buffer = DetectedFrameBuffer::new();
        buffer.observe(&DetectedFrame {
            frame: frame(1),
            detections: Vec::new(),
        });
        buffer.observe(&DetectedFrame {
            frame: frame(2),
            detections: Vec::new(),
        });

        let captured = Arc::new(StdMutex::new(Vec::new()));
        {
            let captured = captured.clone();
            buffer
                .on_buffer_event
                .register(Arc::new(move |e: &DetectedFrameBufferEvent| {
                    captured.lock().unwrap().push(e.frames.len());
                    Ok(())
                }));
        }
        buffer.on_flush(&FlushEvent {
            source_metadata: metadata(),
        });
        assert_eq!(*captured.lock().unwrap(), vec![2]);

        // second flush with nothing accumulated emits nothing further.
        buffer.on_flush(&FlushEvent {
            source_metadata: metadata(),
        });
        assert_eq!(*captured.lock().unwrap(), vec![2]);
    }
}
