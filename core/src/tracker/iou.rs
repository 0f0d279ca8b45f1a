//! The IOU multi-object tracker (C5, spec §4.5).

use std::collections::HashSet;

use base::Error;

use crate::config::IouParams;
use crate::idgen::TrackIdGenerator;
use crate::model::{Detection, Frame, FrameNo, TrackId, TrackedDetection, TrackedFrame};

use super::Tracker;

#[derive(Clone, Copy, Debug)]
struct ActiveTrack {
    id: TrackId,
    last_detection: Detection,
    max_conf: f32,
    first_frame: FrameNo,
    last_frame: FrameNo,
    age: u32,
}

/// Intersection over union of two center-xywh boxes; exactly zero when
/// disjoint (spec §4.5).
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let (ax1, ay1, ax2, ay2) = a.corners();
    let (bx1, by1, bx2, by2) = b.corners();

    let ix1 = ax1.max(bx1);
    let iy1 = ay1.max(by1);
    let ix2 = ax2.min(bx2);
    let iy2 = ay2.min(by2);

    let iw = (ix2 - ix1).max(0.0);
    let ih = (iy2 - iy1).max(0.0);
    let intersection = iw * ih;
    if intersection <= 0.0 {
        return 0.0;
    }

    let area_a = (ax2 - ax1).max(0.0) * (ay2 - ay1).max(0.0);
    let area_b = (bx2 - bx1).max(0.0) * (by2 - by1).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Holds the active-track state across successive calls to `track_frame`.
/// One instance per tracking scope (spec GLOSSARY "FrameGroup" / per
/// stream).
pub struct IouTracker {
    params: IouParams,
    active: Vec<ActiveTrack>,
}

impl IouTracker {
    pub fn new(params: IouParams) -> Self {
        IouTracker {
            params,
            active: Vec::new(),
        }
    }

    /// Ids of tracks still open (neither finished nor discarded). Used by
    /// the chunked tracker's mandatory group-close rule (spec §4.6).
    pub fn active_track_ids(&self) -> Vec<TrackId> {
        self.active.iter().map(|t| t.id).collect()
    }
}

impl Tracker for IouTracker {
    fn track_frame(
        &mut self,
        frame: Frame,
        detections: Vec<Detection>,
        idgen: &TrackIdGenerator,
    ) -> Result<TrackedFrame, Error> {
        let frame_no = frame.no;
        let pool: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.conf >= self.params.sigma_l)
            .collect();
        let mut used = vec![false; pool.len()];

        let mut next_active = Vec::with_capacity(self.active.len());
        let mut tracked = Vec::new();
        let mut finished_tracks = HashSet::new();
        let mut discarded_tracks = HashSet::new();

        for track in std::mem::take(&mut self.active) {
            let mut best: Option<(usize, f32)> = None;
            for (i, d) in pool.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let score = iou(&track.last_detection, d);
                if best.map(|(_, b)| score > b).unwrap_or(true) {
                    best = Some((i, score));
                }
            }

            match best {
                Some((i, score)) if score >= self.params.sigma_iou => {
                    used[i] = true;
                    let det = pool[i];
                    let mut t = track;
                    t.last_detection = det;
                    t.max_conf = t.max_conf.max(det.conf);
                    t.last_frame = frame_no;
                    t.age = 0;
                    tracked.push(TrackedDetection {
                        detection: det,
                        track_id: t.id,
                        is_first: false,
                    });
                    next_active.push(t);
                }
                _ => {
                    let mut t = track;
                    t.age += 1;
                    if t.age > self.params.t_miss_max {
                        let duration = t.last_frame.saturating_sub(t.first_frame);
                        if t.max_conf >= self.params.sigma_h && duration >= self.params.t_min as u64 {
                            finished_tracks.insert(t.id);
                        } else {
                            discarded_tracks.insert(t.id);
                        }
                    } else {
                        next_active.push(t);
                    }
                }
            }
        }

        for (i, det) in pool.into_iter().enumerate() {
            if used[i] {
                continue;
            }
            let id = idgen.next_id();
            tracked.push(TrackedDetection {
                detection: det,
                track_id: id,
                is_first: true,
            });
            next_active.push(ActiveTrack {
                id,
                last_detection: det,
                max_conf: det.conf,
                first_frame: frame_no,
                last_frame: frame_no,
                age: 0,
            });
        }

        self.active = next_active;

        Ok(TrackedFrame {
            frame,
            detections: tracked,
            finished_tracks,
            discarded_tracks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::Timestamp;

    fn det(x: f32, y: f32, conf: f32) -> Detection {
        Detection {
            label: "car".into(),
            conf,
            x,
            y,
            w: 50.0,
            h: 80.0,
        }
    }

    fn frame(no: u64) -> Frame {
        Frame {
            no,
            occurrence: Timestamp::UNIX_EPOCH,
            source: "s".into(),
            output: "o".into(),
            image: None,
        }
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = det(0.0, 0.0, 1.0);
        let b = det(1000.0, 1000.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = det(100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    /// Spec §8 property 6: one frame with N detections yields N new tracks,
    /// all `is_first = true`, distinct ids.
    #[test]
    fn single_frame_yields_all_new_tracks() {
        let params = IouParams {
            sigma_l: 0.1,
            sigma_h: 0.5,
            sigma_iou: 0.3,
            t_min: 0,
            t_miss_max: 1,
        };
        let mut tracker = IouTracker::new(params);
        let idgen = TrackIdGenerator::new();
        let tf = tracker
            .track_frame(frame(1), vec![det(10.0, 10.0, 0.9), det(500.0, 500.0, 0.9)], &idgen)
            .unwrap();
        assert_eq!(tf.detections.len(), 2);
        assert!(tf.detections.iter().all(|d| d.is_first));
        let ids: HashSet<_> = tf.detections.iter().map(|d| d.track_id).collect();
        assert_eq!(ids.len(), 2);
    }

    /// Spec §8 scenario S1: two overlapping detections in consecutive
    /// frames form one track, first/last flags as specified.
    #[test]
    fn s1_single_track_finish() {
        let params = IouParams {
            sigma_l: 0.1,
            sigma_h: 0.5,
            sigma_iou: 0.3,
            t_min: 0,
            t_miss_max: 1,
        };
        let mut tracker = IouTracker::new(params);
        let idgen = TrackIdGenerator::new();

        let tf1 = tracker
            .track_frame(frame(1), vec![det(100.0, 150.0, 0.9)], &idgen)
            .unwrap();
        assert_eq!(tf1.detections.len(), 1);
        assert!(tf1.detections[0].is_first);
        let track_id = tf1.detections[0].track_id;

        let tf2 = tracker
            .track_frame(frame(2), vec![det(105.0, 155.0, 0.9)], &idgen)
            .unwrap();
        assert_eq!(tf2.detections.len(), 1);
        assert_eq!(tf2.detections[0].track_id, track_id);
        assert!(!tf2.detections[0].is_first);
    }

    /// Spec §8 scenario S2: a short track with no matches for `t_miss_max`
    /// frames and insufficient duration is discarded, not finished.
    #[test]
    fn s2_short_track_discard() {
        let params = IouParams {
            sigma_l: 0.1,
            sigma_h: 0.5,
            sigma_iou: 0.3,
            t_min: 2,
            t_miss_max: 1,
        };
        let mut tracker = IouTracker::new(params);
        let idgen = TrackIdGenerator::new();

        let tf1 = tracker.track_frame(frame(1), vec![det(100.0, 100.0, 0.9)], &idgen).unwrap();
        let track_id = tf1.detections[0].track_id;
        let tf2 = tracker.track_frame(frame(2), vec![], &idgen).unwrap();
        assert!(tf2.finished_tracks.is_empty());
        assert!(tf2.discarded_tracks.is_empty());
        let tf3 = tracker.track_frame(frame(3), vec![], &idgen).unwrap();
        assert!(tf3.finished_tracks.is_empty());
        assert!(tf3.discarded_tracks.contains(&track_id));
    }
}
