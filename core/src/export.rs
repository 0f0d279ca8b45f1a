//! Track exporter (C8, spec §4.8) and its streaming counterpart (C9/§4.9):
//! flattens finished chunks into OTTRK artifacts, reindexing frame numbers
//! so every artifact starts at frame 1.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use base::{err, Error, ResultExt};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::IouParams;
use crate::model::{FinishedChunk, FinishedFrame, FrameNo, OttrkFileWritten, TrackId, TrackedFrame};
use crate::observer::{AsyncSubject, SyncSubject};
use crate::otdet::{DetMetadata, OtdetFile, OtdetMetadata, VidMetadata, OTDET_VERSION, OTVISION_VERSION};
use crate::tracker::unfinished::stamp_finished_frames;

pub const OTTRACK_VERSION: &str = "1.1";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerMetadata {
    pub name: String,
    pub sigma_l: f32,
    pub sigma_h: f32,
    pub sigma_iou: f32,
    pub t_min: u32,
    pub t_miss_max: u32,
}

impl From<IouParams> for TrackerMetadata {
    fn from(p: IouParams) -> Self {
        TrackerMetadata {
            name: "IOU".to_string(),
            sigma_l: p.sigma_l,
            sigma_h: p.sigma_h,
            sigma_iou: p.sigma_iou,
            t_min: p.t_min,
            t_miss_max: p.t_miss_max,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackingMetadata {
    pub otvision_version: String,
    pub first_tracked_video_start: i64,
    pub last_tracked_video_end: i64,
    pub tracker: TrackerMetadata,
    pub tracking_run_id: String,
    pub frame_group: u64,
}

/// Extends [`OtdetMetadata`] with the `ottrack_version` and `tracking`
/// blocks (spec §6 OTTRK artifact).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OttrkMetadata {
    pub otdet_version: String,
    pub vid: VidMetadata,
    pub det: DetMetadata,
    pub ottrack_version: String,
    pub tracking: TrackingMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedDetection {
    pub class: String,
    pub conf: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub frame: FrameNo,
    pub occurrence: i64,
    pub input_file_path: String,
    pub track_id: TrackId,
    pub interpolated_detection: bool,
    pub first: bool,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discarded: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OttrkData {
    pub detections: Vec<ExportedDetection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OttrkFile {
    pub metadata: OttrkMetadata,
    pub data: OttrkData,
}

/// Resolves an OTTRK save path from the OTDET path it was tracked from:
/// same stem, `.ottrk` extension (spec §4.8 step 5).
pub fn ottrk_path(otdet_path: &Path) -> PathBuf {
    otdet_path.with_extension("ottrk")
}

/// Reindexes frames so the artifact's first frame is 1, sorts
/// deterministically, and builds one [`OttrkFile`] (spec §4.8 steps 1-5).
///
/// `input_file_path` is the value stamped onto every detection and the
/// value every detection's path must agree with (step 3); for file mode
/// this is the source video path, for stream mode the segment's output
/// path (spec §4.9 has no file-derived path, so the segment's `output` is
/// used instead).
pub fn build_ottrk(
    frames: &[FinishedFrame],
    input_file_path: &str,
    otdet_metadata: &OtdetMetadata,
    iou: IouParams,
    tracking_run_id: Uuid,
    first_tracked_video_start: Timestamp,
    last_tracked_video_end: Timestamp,
    frame_group_id: u64,
) -> Result<OttrkFile, Error> {
    let min_no = frames.iter().map(|f| f.frame.no).min();
    let offset = min_no.map(|m| m.saturating_sub(1)).unwrap_or(0);

    let mut detections: Vec<ExportedDetection> = Vec::new();
    for f in frames {
        for d in &f.detections {
            detections.push(ExportedDetection {
                class: d.tracked.detection.label.clone(),
                conf: d.tracked.detection.conf,
                x: d.tracked.detection.x,
                y: d.tracked.detection.y,
                w: d.tracked.detection.w,
                h: d.tracked.detection.h,
                frame: f.frame.no - offset,
                occurrence: f.frame.occurrence.as_second(),
                input_file_path: input_file_path.to_string(),
                track_id: d.tracked.track_id,
                interpolated_detection: false,
                first: d.tracked.is_first,
                finished: d.is_last,
                discarded: d.is_discarded.then_some(true),
            });
        }
    }

    if detections.iter().any(|d| d.input_file_path != input_file_path) {
        return Err(err!(
            TrackerInvariantViolated,
            msg("detections in one artifact must share exactly one input_file_path")
        ));
    }

    detections.sort_by(|a, b| {
        (a.input_file_path.as_str(), a.frame, a.track_id.0).cmp(&(b.input_file_path.as_str(), b.frame, b.track_id.0))
    });

    let mut seen = HashSet::new();
    for d in &detections {
        if !seen.insert((d.input_file_path.clone(), d.frame, d.track_id)) {
            return Err(err!(
                TrackerInvariantViolated,
                msg("duplicate (input_file_path, frame, track_id) in exported artifact")
            ));
        }
    }

    let tracking = TrackingMetadata {
        otvision_version: OTVISION_VERSION.to_string(),
        first_tracked_video_start: first_tracked_video_start.as_second(),
        last_tracked_video_end: last_tracked_video_end.as_second(),
        tracker: iou.into(),
        tracking_run_id: tracking_run_id.to_string(),
        frame_group: frame_group_id,
    };

    Ok(OttrkFile {
        metadata: OttrkMetadata {
            otdet_version: otdet_metadata.otdet_version.clone(),
            vid: otdet_metadata.vid.clone(),
            det: otdet_metadata.det.clone(),
            ottrack_version: OTTRACK_VERSION.to_string(),
            tracking,
        },
        data: OttrkData { detections },
    })
}

/// Builds an [`OttrkFile`] from a file-mode [`FinishedChunk`] (spec §4.8).
pub fn build_ottrk_for_chunk(
    chunk: &FinishedChunk,
    otdet_metadata: &OtdetMetadata,
    iou: IouParams,
    tracking_run_id: Uuid,
) -> Result<OttrkFile, Error> {
    let input_file_path = chunk.metadata.source.clone();
    let (start, end) = video_start_end(&chunk.metadata.start_time, chunk.metadata.duration_secs);
    build_ottrk(
        &chunk.frames,
        &input_file_path,
        otdet_metadata,
        iou,
        tracking_run_id,
        start,
        end,
        chunk.frame_group_id,
    )
}

fn video_start_end(start: &Timestamp, duration_secs: f64) -> (Timestamp, Timestamp) {
    let end = start
        .checked_add(jiff::Span::new().seconds(duration_secs.round() as i64))
        .unwrap_or(*start);
    (*start, end)
}

/// Writes `ottrk` to `path`, honoring `overwrite`, and notifies `subject`.
/// Atomic: a temp file in the same directory is renamed into place.
pub fn write_ottrk(
    path: &Path,
    ottrk: &OttrkFile,
    overwrite: bool,
    subject: &SyncSubject<OttrkFileWritten>,
) -> Result<(), Error> {
    if path.exists() && !overwrite {
        return Err(err!(OutputExists, msg("ottrk artifact already exists: {:?}", path)));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context(format!("creating parent dir for {:?}", path))?;
    }
    let json = serde_json::to_vec_pretty(ottrk).context("serializing ottrk artifact")?;
    let tmp = path.with_extension("ottrk.tmp");
    fs::write(&tmp, &json).context(format!("writing temp ottrk file {:?}", tmp))?;
    fs::rename(&tmp, path).context(format!("renaming temp ottrk file into {:?}", path))?;

    subject.notify(&OttrkFileWritten {
        save_location: path.to_path_buf(),
    });
    Ok(())
}

/// Streaming track exporter (spec §4.9): observes `OtdetFileWritten` (to
/// learn a segment's metadata and the set of tracks that must drain before
/// its OTTRK can be written) and the tracker's `TrackedFrame` stream (to
/// accumulate detections and drain those sets), in that priority order
/// relative to each other — emission stays ordered because segments are
/// drained strictly front-to-back.
pub struct StreamTrackExporter {
    keep_discarded: bool,
    iou: IouParams,
    tracking_run_id: Uuid,
    frames_by_output: HashMap<String, Vec<TrackedFrame>>,
    segments: std::collections::VecDeque<PendingSegment>,
    discarded: HashSet<TrackId>,
    last_track_frame: HashMap<TrackId, FrameNo>,
    pub on_ottrk_written: AsyncSubject<OttrkFileWritten>,
}

struct PendingSegment {
    output: String,
    save_location: PathBuf,
    otdet_metadata: OtdetMetadata,
    unfinished: HashSet<TrackId>,
}

impl StreamTrackExporter {
    pub fn new(keep_discarded: bool, iou: IouParams, tracking_run_id: Uuid) -> Self {
        StreamTrackExporter {
            keep_discarded,
            iou,
            tracking_run_id,
            frames_by_output: HashMap::new(),
            segments: std::collections::VecDeque::new(),
            discarded: HashSet::new(),
            last_track_frame: HashMap::new(),
            on_ottrk_written: AsyncSubject::new(),
        }
    }

    /// Feeds one tracked frame from the streaming IOU tracker into the
    /// exporter's accumulator.
    pub fn on_tracked_frame(&mut self, tf: TrackedFrame) {
        let no = tf.frame.no;
        for id in tf.observed_tracks() {
            self.last_track_frame.insert(id, no);
        }
        self.discarded.extend(tf.discarded_tracks.iter().copied());
        let newly_closed: HashSet<TrackId> = tf
            .finished_tracks
            .union(&tf.discarded_tracks)
            .copied()
            .collect();
        for seg in &mut self.segments {
            seg.unfinished.retain(|id| !newly_closed.contains(id));
        }
        self.frames_by_output
            .entry(tf.frame.output.clone())
            .or_default()
            .push(tf);
    }

    /// Reacts to an `OtdetFileWritten` for segment S: re-reads its metadata
    /// (cheap — we just wrote it) and registers S as pending until
    /// `event.unfinished_tracks_hint` fully drains. Returns every OTTRK
    /// that became ready, in emission order (spec §5 "FinishedChunks are
    /// emitted... never reordered across files").
    pub fn on_otdet_written(&mut self, event: &OttrkReadyInput) -> Result<Vec<(PathBuf, OttrkFile)>, Error> {
        self.segments.push_back(PendingSegment {
            output: event.output.clone(),
            save_location: event.save_location.clone(),
            otdet_metadata: event.otdet_metadata.clone(),
            unfinished: event.unfinished_tracks_hint.clone().unwrap_or_default(),
        });
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Result<Vec<(PathBuf, OttrkFile)>, Error> {
        let mut out = Vec::new();
        while let Some(front) = self.segments.front() {
            if !front.unfinished.is_empty() {
                break;
            }
            let seg = self.segments.pop_front().unwrap();
            let frames = self.frames_by_output.remove(&seg.output).unwrap_or_default();
            let finished = stamp_finished_frames(frames, &self.discarded, &self.last_track_frame, self.keep_discarded);
            let (start, end) = video_start_end(
                &seg.otdet_metadata.vid_start(),
                seg.otdet_metadata.vid.number_of_frames as f64 / seg.otdet_metadata.vid.actual_fps.max(1e-9),
            );
            let ottrk = build_ottrk(
                &finished,
                &seg.output,
                &seg.otdet_metadata,
                self.iou,
                self.tracking_run_id,
                start,
                end,
                0,
            )?;
            out.push((ottrk_path(&seg.save_location), ottrk));
        }
        Ok(out)
    }
}

/// The subset of an `OtdetFileWritten` notification the stream exporter
/// needs, plus the metadata it was written with (spec §4.9 step 1: "flush
/// the current buffer into the builder with the segment's metadata").
pub struct OttrkReadyInput {
    pub output: String,
    pub save_location: PathBuf,
    pub otdet_metadata: OtdetMetadata,
    pub unfinished_tracks_hint: Option<HashSet<TrackId>>,
}

impl OtdetMetadata {
    fn vid_start(&self) -> Timestamp {
        Timestamp::from_second(self.vid.recorded_start_date).unwrap_or(Timestamp::UNIX_EPOCH)
    }
}

/// Reads `otdet_path` back and assembles an [`OttrkReadyInput`] for the
/// stream exporter (spec §4.9 step 1).
pub fn ready_input_from_otdet(
    otdet_path: &Path,
    unfinished_tracks_hint: Option<HashSet<TrackId>>,
) -> Result<OttrkReadyInput, Error> {
    let (otdet, _frames, metadata) = crate::otdet::parse_otdet(otdet_path)?;
    Ok(OttrkReadyInput {
        output: metadata.output,
        save_location: otdet_path.to_path_buf(),
        otdet_metadata: otdet.metadata,
        unfinished_tracks_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Detection, Frame, TrackedDetection};
    use crate::otdet::{DetMetadata, ModelMetadata, VidMetadata};
    use std::collections::BTreeMap;

    fn otdet_metadata() -> OtdetMetadata {
        OtdetMetadata {
            otdet_version: OTDET_VERSION.to_string(),
            vid: VidMetadata {
                filename: "cam1_x_2024-01-01_00-00-00.mp4".into(),
                filetype: "mp4".into(),
                width: 100,
                height: 100,
                recorded_fps: 20.0,
                actual_fps: 20.0,
                number_of_frames: 2,
                recorded_start_date: 0,
                length: "0:00:02".into(),
                expected_duration: Some(2.0),
            },
            det: DetMetadata {
                otvision_version: "0.0.0".into(),
                model: ModelMetadata {
                    name: "yolo".into(),
                    weights: "w.pt".into(),
                    iou_threshold: 0.45,
                    image_size: 640,
                    max_confidence: 0.25,
                    half_precision: false,
                    classes: BTreeMap::new(),
                },
                chunksize: 1,
                normalized_bbox: false,
                detect_start: None,
                detect_end: None,
            },
        }
    }

    fn det(track: u64, is_first: bool, is_last: bool) -> FinishedDetection {
        FinishedDetection {
            tracked: TrackedDetection {
                detection: Detection {
                    label: "car".into(),
                    conf: 0.9,
                    x: 1.0,
                    y: 1.0,
                    w: 1.0,
                    h: 1.0,
                },
                track_id: TrackId(track),
                is_first,
            },
            is_last,
            is_discarded: false,
        }
    }

    fn frame(no: u64, detections: Vec<FinishedDetection>) -> FinishedFrame {
        FinishedFrame {
            frame: Frame {
                no,
                occurrence: Timestamp::UNIX_EPOCH,
                source: "s".into(),
                output: "o".into(),
                image: None,
            },
            detections,
        }
    }

    #[test]
    fn reindexes_so_first_frame_is_one() {
        let frames = vec![
            frame(5, vec![det(1, true, false)]),
            frame(6, vec![det(1, false, true)]),
        ];
        let ottrk = build_ottrk(
            &frames,
            "cam1.mp4",
            &otdet_metadata(),
            IouParams::default(),
            Uuid::nil(),
            Timestamp::UNIX_EPOCH,
            Timestamp::UNIX_EPOCH,
            0,
        )
        .unwrap();
        let frames_out: Vec<_> = ottrk.data.detections.iter().map(|d| d.frame).collect();
        assert_eq!(frames_out, vec![1, 2]);
    }

    #[test]
    fn sorts_by_file_then_frame_then_track() {
        let frames = vec![frame(
            1,
            vec![det(2, true, true), det(1, true, true)],
        )];
        let ottrk = build_ottrk(
            &frames,
            "cam1.mp4",
            &otdet_metadata(),
            IouParams::default(),
            Uuid::nil(),
            Timestamp::UNIX_EPOCH,
            Timestamp::UNIX_EPOCH,
            0,
        )
        .unwrap();
        let ids: Vec<_> = ottrk.data.detections.iter().map(|d| d.track_id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn marks_discarded_detections_with_optional_flag() {
        let mut d = det(1, true, true);
        d.is_discarded = true;
        let ottrk = build_ottrk(
            &[frame(1, vec![d])],
            "cam1.mp4",
            &otdet_metadata(),
            IouParams::default(),
            Uuid::nil(),
            Timestamp::UNIX_EPOCH,
            Timestamp::UNIX_EPOCH,
            0,
        )
        .unwrap();
        assert_eq!(ottrk.data.detections[0].discarded, Some(true));
    }

    #[test]
    fn ottrk_path_swaps_extension() {
        let p = ottrk_path(Path::new("/tmp/cam1_2024-01-01_00-00-00.otdet"));
        assert_eq!(p, PathBuf::from("/tmp/cam1_2024-01-01_00-00-00.ottrk"));
    }
}
