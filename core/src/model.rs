//! Core data model (spec §3): frames, detections, tracks and the
//! chunk/group aggregates the tracker produces and consumes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// An opaque, per-group/per-stream unique track identifier.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based, monotonic-within-segment frame number.
pub type FrameNo = u64;

/// A decoded video frame, optionally carrying raw image data.
///
/// `image` is `None` both for frames outside a `detect_start..detect_end`
/// window (spec §4.1) and for any frame once it has been retained by the
/// detected-frame buffer (spec §4.3) with its payload stripped.
#[derive(Clone, Debug)]
pub struct Frame {
    pub no: FrameNo,
    pub occurrence: Timestamp,
    pub source: String,
    pub output: String,
    pub image: Option<RawImage>,
}

impl Frame {
    pub fn without_image(&self) -> Frame {
        Frame {
            no: self.no,
            occurrence: self.occurrence,
            source: self.source.clone(),
            output: self.output.clone(),
            image: None,
        }
    }
}

/// Raw decoded pixel data plus its dimensions. Kept deliberately opaque —
/// the detector is the only consumer and decides how to interpret it.
#[derive(Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, row-major, no padding.
    pub rgb: bytes::Bytes,
}

impl std::fmt::Debug for RawImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.rgb.len())
            .finish()
    }
}

/// A single detected object. `(x, y)` is the bounding-box center; `w, h`
/// are the full width/height. Units are either normalized `[0,1]` or
/// source pixels depending on the producing `DetectConfig::normalized`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub conf: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Detection {
    /// The axis-aligned corners `(x1, y1, x2, y2)` of this center-xywh box.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (
            self.x - self.w / 2.0,
            self.y - self.h / 2.0,
            self.x + self.w / 2.0,
            self.y + self.h / 2.0,
        )
    }
}

#[derive(Clone, Debug)]
pub struct DetectedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// A [`Detection`] labeled with its track id within the current frame.
#[derive(Clone, Debug)]
pub struct TrackedDetection {
    pub detection: Detection,
    pub track_id: TrackId,
    pub is_first: bool,
}

/// A [`TrackedDetection`] stamped with its track's final disposition, once
/// known (spec §3 `FinishedDetection`).
#[derive(Clone, Debug)]
pub struct FinishedDetection {
    pub tracked: TrackedDetection,
    pub is_last: bool,
    pub is_discarded: bool,
}

/// A frame plus its tracked detections and the sets of tracks that closed
/// (finished or were discarded) as of this frame.
#[derive(Clone, Debug)]
pub struct TrackedFrame {
    pub frame: Frame,
    pub detections: Vec<TrackedDetection>,
    pub finished_tracks: HashSet<TrackId>,
    pub discarded_tracks: HashSet<TrackId>,
}

impl TrackedFrame {
    pub fn observed_tracks(&self) -> HashSet<TrackId> {
        self.detections.iter().map(|d| d.track_id).collect()
    }

    pub fn unfinished_tracks(&self) -> HashSet<TrackId> {
        let closed: HashSet<TrackId> = self
            .finished_tracks
            .union(&self.discarded_tracks)
            .copied()
            .collect();
        self.observed_tracks().difference(&closed).copied().collect()
    }

    /// Debug-only invariant check (spec §3 `TrackedFrame` invariants).
    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        debug_assert!(
            self.finished_tracks.is_disjoint(&self.discarded_tracks),
            "finished and discarded tracks must be disjoint"
        );
    }
}

/// Per-file decode/detection metadata, carried alongside a chunk/segment so
/// downstream writers never have to re-derive it.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentMetadata {
    pub source: String,
    pub output: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub recorded_fps: f64,
    pub start_time: Timestamp,
}

/// Fired by a frame source at the boundary between two segments (spec §3
/// `FlushEvent`).
#[derive(Clone, Debug)]
pub struct FlushEvent {
    pub source_metadata: SegmentMetadata,
}

/// Fired by the stream-mode frame source whenever a new segment's first
/// frame has actually been received (spec §4.1 stream variant, step d).
#[derive(Clone, Debug)]
pub struct NewVideoStart {
    pub output: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Fired once C4 has durably written an OTDET artifact.
#[derive(Clone, Debug)]
pub struct OtdetFileWritten {
    pub number_of_frames: usize,
    pub save_location: PathBuf,
    pub unfinished_tracks_hint: Option<HashSet<TrackId>>,
}

/// Fired once C8/C9 has durably written an OTTRK artifact.
#[derive(Clone, Debug)]
pub struct OttrkFileWritten {
    pub save_location: PathBuf,
}

/// A detected-frame buffer's snapshot of one full segment (spec §3/§4.3).
#[derive(Clone, Debug)]
pub struct DetectedFrameBufferEvent {
    pub source_metadata: SegmentMetadata,
    pub frames: Vec<DetectedFrame>,
}

/// The detected frames originating from one OTDET file (spec GLOSSARY
/// "Chunk"), sorted by `(occurrence, no)`.
#[derive(Clone, Debug)]
pub struct FrameChunk {
    pub file: PathBuf,
    pub metadata: SegmentMetadata,
    pub frames: Vec<DetectedFrame>,
    pub frame_group_id: u64,
}

/// A [`FrameChunk`] whose frames have been run through the tracker, with
/// per-chunk lifecycle aggregates (spec §3 `TrackedChunk`).
#[derive(Clone, Debug)]
pub struct TrackedChunk {
    pub file: PathBuf,
    pub metadata: SegmentMetadata,
    pub frames: Vec<TrackedFrame>,
    pub frame_group_id: u64,
    pub is_last_chunk: bool,
    pub finished_tracks: HashSet<TrackId>,
    pub discarded_tracks: HashSet<TrackId>,
    pub unfinished_tracks: HashSet<TrackId>,
    pub last_track_frame: HashMap<TrackId, FrameNo>,
}

/// A [`TrackedChunk`] whose every observed track is known to have finished
/// or been discarded (spec §4.7).
#[derive(Clone, Debug)]
pub struct FinishedChunk {
    pub file: PathBuf,
    pub metadata: SegmentMetadata,
    pub frames: Vec<FinishedFrame>,
    pub frame_group_id: u64,
}

#[derive(Clone, Debug)]
pub struct FinishedFrame {
    pub frame: Frame,
    pub detections: Vec<FinishedDetection>,
}

/// A sequence of chunks sharing one tracking scope: one id-generator, one
/// OTTRK per chunk, cross-chunk track lifecycles (spec GLOSSARY).
#[derive(Clone, Debug)]
pub struct FrameGroup {
    pub id: u64,
    pub start: Timestamp,
    pub end: Timestamp,
    pub hostname: String,
    pub files: Vec<PathBuf>,
    pub metadata_by_file: HashMap<PathBuf, SegmentMetadata>,
}

impl FrameGroup {
    /// Spec §3/§4.6: this group is mergeable with a chronologically later
    /// file/group `next` iff hostnames match and `next.start - self.end`
    /// falls in `[0, merge_threshold]`.
    pub fn mergeable_with_next(
        &self,
        next_hostname: &str,
        next_start: Timestamp,
        merge_threshold: jiff::Span,
    ) -> bool {
        hostnames_and_gap_mergeable(&self.hostname, self.end, next_hostname, next_start, merge_threshold)
    }
}

/// Shared predicate behind [`FrameGroup::mergeable_with_next`]: same
/// hostname and `next_start - end ∈ [0, merge_threshold]`.
pub fn hostnames_and_gap_mergeable(
    hostname: &str,
    end: Timestamp,
    next_hostname: &str,
    next_start: Timestamp,
    merge_threshold: jiff::Span,
) -> bool {
    if hostname != next_hostname {
        return false;
    }
    let gap_secs = match next_start.since(end) {
        Ok(gap) => gap.total(jiff::Unit::Second).unwrap_or(f64::NEG_INFINITY),
        Err(_) => return false,
    };
    let threshold_secs = merge_threshold.total(jiff::Unit::Second).unwrap_or(f64::INFINITY);
    (0.0..=threshold_secs).contains(&gap_secs)
}

/// Sort key used whenever detections must be ordered deterministically
/// (spec §4.8 step 4 / §5 ordering guarantee): `(input_file_path, frame,
/// track_id)`.
pub fn detection_sort_key(
    input_file_path: &str,
    frame: FrameNo,
    track_id: TrackId,
) -> (String, FrameNo, TrackId) {
    (input_file_path.to_string(), frame, track_id)
}

/// Returns the multiset of frame numbers as a set, for the frame-density
/// invariant (spec §8 property 1): it must equal `{1, ..., N}`.
pub fn is_dense_frame_range(frame_numbers: &BTreeSet<FrameNo>) -> bool {
    if frame_numbers.is_empty() {
        return true;
    }
    let n = frame_numbers.len() as u64;
    *frame_numbers.iter().next().unwrap() == 1 && *frame_numbers.iter().last().unwrap() == n
}
