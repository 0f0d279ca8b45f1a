//! Unfinished-chunks buffer (C7, spec §4.7): holds tracked chunks until
//! every track they observed is known finished or discarded, then
//! converts them to finished chunks in strict original order.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{FinishedChunk, FinishedDetection, FinishedFrame, FrameNo, TrackId, TrackedChunk, TrackedFrame};

pub struct UnfinishedChunksBuffer {
    pending: VecDeque<(TrackedChunk, HashSet<TrackId>)>,
    last_track_frame: HashMap<TrackId, FrameNo>,
    discarded: HashSet<TrackId>,
    keep_discarded: bool,
}

impl UnfinishedChunksBuffer {
    pub fn new(keep_discarded: bool) -> Self {
        UnfinishedChunksBuffer {
            pending: VecDeque::new(),
            last_track_frame: HashMap::new(),
            discarded: HashSet::new(),
            keep_discarded,
        }
    }

    /// Accepts a newly tracked chunk and returns every [`FinishedChunk`]
    /// that became ready as a result, in emission order.
    pub fn push(&mut self, chunk: TrackedChunk) -> Vec<FinishedChunk> {
        for (&id, &no) in &chunk.last_track_frame {
            self.last_track_frame.insert(id, no);
        }
        let newly_closed: HashSet<TrackId> = chunk
            .finished_tracks
            .union(&chunk.discarded_tracks)
            .copied()
            .collect();
        self.discarded.extend(chunk.discarded_tracks.iter().copied());

        for (_, pending_set) in self.pending.iter_mut() {
            pending_set.retain(|id| !newly_closed.contains(id));
        }

        let own_pending = chunk.unfinished_tracks.clone();
        self.pending.push_back((chunk, own_pending));

        self.drain_ready(false)
    }

    /// Call once the input stream has ended: force-finishes every chunk
    /// still pending, treating residual unfinished tracks as discarded
    /// (spec §4.7: "they were never completed within this run").
    pub fn finish_remaining(&mut self) -> Vec<FinishedChunk> {
        self.drain_ready(true)
    }

    fn drain_ready(&mut self, force: bool) -> Vec<FinishedChunk> {
        let mut out = Vec::new();
        while let Some((_, pending_set)) = self.pending.front() {
            if !pending_set.is_empty() && !force {
                break;
            }
            let (chunk, residual) = self.pending.pop_front().unwrap();
            if force {
                self.discarded.extend(residual.iter().copied());
            }
            out.push(finish_chunk(chunk, &self.discarded, &self.last_track_frame, self.keep_discarded));
        }
        out
    }
}

/// Converts a [`TrackedChunk`] into a [`FinishedChunk`]: every detection is
/// stamped `is_last`/`is_discarded`; when `keep_discarded` is false,
/// detections belonging to a discarded track are dropped entirely.
fn finish_chunk(
    chunk: TrackedChunk,
    discarded: &HashSet<TrackId>,
    last_track_frame: &HashMap<TrackId, FrameNo>,
    keep_discarded: bool,
) -> FinishedChunk {
    let frames = stamp_finished_frames(chunk.frames, discarded, last_track_frame, keep_discarded);
    FinishedChunk {
        file: chunk.file,
        metadata: chunk.metadata,
        frames,
        frame_group_id: chunk.frame_group_id,
    }
}

/// Stamps `is_last`/`is_discarded` onto every detection in `frames`; when
/// `keep_discarded` is false, detections belonging to a discarded track
/// are dropped entirely. Shared between the file-mode chunk finisher above
/// and the streaming track exporter (spec §4.9), which has no
/// `TrackedChunk` to finish but the same per-detection stamping rule.
pub fn stamp_finished_frames(
    frames: Vec<TrackedFrame>,
    discarded: &HashSet<TrackId>,
    last_track_frame: &HashMap<TrackId, FrameNo>,
    keep_discarded: bool,
) -> Vec<FinishedFrame> {
    frames
        .into_iter()
        .map(|tf| {
            let frame_no = tf.frame.no;
            let detections = tf
                .detections
                .into_iter()
                .filter_map(|tracked| {
                    let is_discarded = discarded.contains(&tracked.track_id);
                    if is_discarded && !keep_discarded {
                        return None;
                    }
                    let is_last = last_track_frame
                        .get(&tracked.track_id)
                        .is_some_and(|&no| no == frame_no);
                    Some(FinishedDetection {
                        tracked,
                        is_last,
                        is_discarded,
                    })
                })
                .collect();
            FinishedFrame {
                frame: tf.frame,
                detections,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Detection, Frame, SegmentMetadata, TrackedDetection, TrackedFrame};
    use jiff::Timestamp;

    fn metadata() -> SegmentMetadata {
        SegmentMetadata {
            source: "s".into(),
            output: "o".into(),
            duration_secs: 1.0,
            width: 1,
            height: 1,
            recorded_fps: 1.0,
            start_time: Timestamp::UNIX_EPOCH,
        }
    }

    fn det() -> Detection {
        Detection {
            label: "car".into(),
            conf: 0.9,
            x: 1.0,
            y: 1.0,
            w: 1.0,
            h: 1.0,
        }
    }

    fn chunk(id: u64, is_last: bool, finished: &[u64], discarded: &[u64], unfinished: &[u64]) -> TrackedChunk {
        let all: Vec<u64> = finished.iter().chain(discarded).chain(unfinished).copied().collect();
        let detections: Vec<_> = all
            .iter()
            .map(|&t| TrackedDetection {
                detection: det(),
                track_id: TrackId(t),
                is_first: true,
            })
            .collect();
        let frame = Frame {
            no: 1,
            occurrence: Timestamp::UNIX_EPOCH,
            source: "s".into(),
            output: "o".into(),
            image: None,
        };
        let tf = TrackedFrame {
            frame,
            detections,
            finished_tracks: finished.iter().map(|&t| TrackId(t)).collect(),
            discarded_tracks: discarded.iter().map(|&t| TrackId(t)).collect(),
        };
        TrackedChunk {
            file: format!("chunk{id}.otdet").into(),
            metadata: metadata(),
            frames: vec![tf],
            frame_group_id: 0,
            is_last_chunk: is_last,
            finished_tracks: finished.iter().map(|&t| TrackId(t)).collect(),
            discarded_tracks: discarded.iter().map(|&t| TrackId(t)).collect(),
            unfinished_tracks: unfinished.iter().map(|&t| TrackId(t)).collect(),
            last_track_frame: all.iter().map(|&t| (TrackId(t), 1)).collect(),
        }
    }

    #[test]
    fn finishes_immediately_when_chunk_has_no_unfinished_tracks() {
        let mut buffer = UnfinishedChunksBuffer::new(false);
        let finished = buffer.push(chunk(0, true, &[1], &[], &[]));
        assert_eq!(finished.len(), 1);
    }

    #[test]
    fn holds_chunk_until_dependent_track_closes_then_emits_in_order() {
        let mut buffer = UnfinishedChunksBuffer::new(false);
        // chunk 0 has track 1 still unfinished.
        let out0 = buffer.push(chunk(0, false, &[], &[], &[1]));
        assert!(out0.is_empty());

        // chunk 1 finishes track 1; now chunk 0 becomes ready too.
        let out1 = buffer.push(chunk(1, true, &[1], &[], &[]));
        assert_eq!(out1.len(), 2);
        assert_eq!(out1[0].file, std::path::PathBuf::from("chunk0.otdet"));
        assert_eq!(out1[1].file, std::path::PathBuf::from("chunk1.otdet"));
    }

    #[test]
    fn finish_remaining_discards_residual_unfinished_tracks() {
        let mut buffer = UnfinishedChunksBuffer::new(true);
        buffer.push(chunk(0, false, &[], &[], &[1]));
        let finished = buffer.finish_remaining();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].frames[0].detections[0].is_discarded);
    }

    #[test]
    fn keep_discarded_false_drops_discarded_detections() {
        let mut buffer = UnfinishedChunksBuffer::new(false);
        let finished = buffer.push(chunk(0, true, &[], &[1], &[]));
        assert!(finished[0].frames[0].detections.is_empty());
    }
}
