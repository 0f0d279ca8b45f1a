//! OTDET artifact schema, writer (C4) and reader (used by C6 to re-parse
//! detection files back into frame chunks) — spec §4.4 / §6.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base::{err, Error, ResultExt};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::config::DetectConfig;
use crate::detect::ObjectDetectorMetadata;
use crate::model::{DetectedFrame, DetectedFrameBufferEvent, Detection, Frame, OtdetFileWritten, SegmentMetadata};
use crate::observer::SyncSubject;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VidMetadata {
    pub filename: String,
    pub filetype: String,
    pub width: u32,
    pub height: u32,
    pub recorded_fps: f64,
    pub actual_fps: f64,
    pub number_of_frames: usize,
    pub recorded_start_date: i64,
    pub length: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub weights: String,
    pub iou_threshold: f32,
    pub image_size: u32,
    pub max_confidence: f32,
    pub half_precision: bool,
    pub classes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetMetadata {
    pub otvision_version: String,
    pub model: ModelMetadata,
    pub chunksize: usize,
    pub normalized_bbox: bool,
    pub detect_start: Option<f64>,
    pub detect_end: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtdetMetadata {
    pub otdet_version: String,
    pub vid: VidMetadata,
    pub det: DetMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub class: String,
    pub conf: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl From<&Detection> for DetectionRecord {
    fn from(d: &Detection) -> Self {
        DetectionRecord {
            class: d.label.clone(),
            conf: d.conf,
            x: d.x,
            y: d.y,
            w: d.w,
            h: d.h,
        }
    }
}

impl From<&DetectionRecord> for Detection {
    fn from(r: &DetectionRecord) -> Self {
        Detection {
            label: r.class.clone(),
            conf: r.conf,
            x: r.x,
            y: r.y,
            w: r.w,
            h: r.h,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    pub occurrence: i64,
    pub detections: Vec<DetectionRecord>,
}

pub const OTDET_VERSION: &str = "1.2";
pub const OTVISION_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtdetFile {
    pub metadata: OtdetMetadata,
    pub data: BTreeMap<String, FrameRecord>,
}

/// Formats a duration as OTDET's `"H:MM:SS"` length field.
fn format_length(duration_secs: f64) -> String {
    let total = duration_secs.round().max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Builds the in-memory OTDET representation for one segment (spec §4.4
/// steps 1-3).
pub fn build_otdet(
    event: &DetectedFrameBufferEvent,
    config: &DetectConfig,
    detector_meta: &ObjectDetectorMetadata,
) -> OtdetFile {
    let actual_frames = event.frames.len();
    let actual_fps = match config.expected_duration {
        Some(secs) if secs > 0.0 => actual_frames as f64 / secs,
        _ => {
            if event.source_metadata.duration_secs > 0.0 {
                actual_frames as f64 / event.source_metadata.duration_secs
            } else {
                0.0
            }
        }
    };

    let classes = detector_meta
        .classes
        .iter()
        .map(|(id, name)| (id.to_string(), name.clone()))
        .collect();

    let metadata = OtdetMetadata {
        otdet_version: OTDET_VERSION.to_string(),
        vid: VidMetadata {
            filename: event.source_metadata.source.clone(),
            filetype: Path::new(&event.source_metadata.source)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string(),
            width: event.source_metadata.width,
            height: event.source_metadata.height,
            recorded_fps: event.source_metadata.recorded_fps,
            actual_fps,
            number_of_frames: actual_frames,
            recorded_start_date: event.source_metadata.start_time.as_second(),
            length: format_length(event.source_metadata.duration_secs),
            expected_duration: config.expected_duration,
        },
        det: DetMetadata {
            otvision_version: OTVISION_VERSION.to_string(),
            model: ModelMetadata {
                name: detector_meta.model_name.clone(),
                weights: config.weights.to_string_lossy().to_string(),
                iou_threshold: config.iou,
                image_size: config.image_size,
                max_confidence: config.conf,
                half_precision: config.half_precision,
                classes,
            },
            chunksize: config.chunksize,
            normalized_bbox: config.normalized,
            detect_start: config.detect_start,
            detect_end: config.detect_end,
        },
    };

    let data = event
        .frames
        .iter()
        .map(|df| {
            (
                df.frame.no.to_string(),
                FrameRecord {
                    occurrence: df.frame.occurrence.as_second(),
                    detections: df.detections.iter().map(DetectionRecord::from).collect(),
                },
            )
        })
        .collect();

    OtdetFile { metadata, data }
}

/// Resolves the save path for an OTDET artifact: source stem plus
/// optional `_start_<s>`/`_end_<e>` suffixes, then `.otdet` (spec §4.4
/// step 4).
pub fn resolve_save_path(source: &Path, config: &DetectConfig) -> PathBuf {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let mut name = stem.to_string();
    if let Some(start) = config.detect_start {
        name.push_str(&format!("_start_{start}"));
    }
    if let Some(end) = config.detect_end {
        name.push_str(&format!("_end_{end}"));
    }
    name.push_str(".otdet");
    source.with_file_name(name)
}

/// Writes `otdet` to `path`, honoring `overwrite`, and notifies `subject`.
/// Writes are atomic: a temp file in the same directory is renamed into
/// place only once fully flushed.
pub fn write_otdet(
    path: &Path,
    otdet: &OtdetFile,
    overwrite: bool,
    subject: &SyncSubject<OtdetFileWritten>,
) -> Result<(), Error> {
    if path.exists() && !overwrite {
        return Err(err!(OutputExists, msg("otdet artifact already exists: {:?}", path)));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context(format!("creating parent dir for {:?}", path))?;
    }
    let json = serde_json::to_vec_pretty(otdet).context("serializing otdet artifact")?;
    let tmp = path.with_extension("otdet.tmp");
    fs::write(&tmp, &json).context(format!("writing temp otdet file {:?}", tmp))?;
    fs::rename(&tmp, path).context(format!("renaming temp otdet file into {:?}", path))?;

    subject.notify(&OtdetFileWritten {
        number_of_frames: otdet.metadata.vid.number_of_frames,
        save_location: path.to_path_buf(),
        unfinished_tracks_hint: None,
    });
    Ok(())
}

/// Parses an OTDET artifact back into detected frames, sorted by frame
/// number, plus its metadata (spec §3 "reappear as DetectedFrames by
/// re-parsing the OTDET artifacts into C6").
pub fn parse_otdet(path: &Path) -> Result<(OtdetFile, Vec<DetectedFrame>, SegmentMetadata), Error> {
    let bytes = fs::read(path).context(format!("reading otdet file {:?}", path))?;
    let otdet: OtdetFile = serde_json::from_slice(&bytes).context(format!("parsing otdet file {:?}", path))?;

    let mut entries: Vec<(u64, &FrameRecord)> = otdet
        .data
        .iter()
        .map(|(k, v)| {
            k.parse::<u64>()
                .map(|no| (no, v))
                .map_err(|_| err!(IoFailure, msg("non-numeric frame key {:?} in {:?}", k, path)))
        })
        .collect::<Result<_, Error>>()?;
    entries.sort_by_key(|(no, _)| *no);

    let output = path.with_extension("").to_string_lossy().to_string();
    let frames = entries
        .into_iter()
        .map(|(no, record)| DetectedFrame {
            frame: Frame {
                no,
                occurrence: Timestamp::from_second(record.occurrence)
                    .unwrap_or(Timestamp::UNIX_EPOCH),
                source: otdet.metadata.vid.filename.clone(),
                output: output.clone(),
                image: None,
            },
            detections: record.detections.iter().map(Detection::from).collect(),
        })
        .collect();

    let metadata = SegmentMetadata {
        source: otdet.metadata.vid.filename.clone(),
        output,
        duration_secs: otdet
            .metadata
            .vid
            .expected_duration
            .unwrap_or(otdet.metadata.vid.number_of_frames as f64 / otdet.metadata.vid.actual_fps.max(1e-9)),
        width: otdet.metadata.vid.width,
        height: otdet.metadata.vid.height,
        recorded_fps: otdet.metadata.vid.recorded_fps,
        start_time: Timestamp::from_second(otdet.metadata.vid.recorded_start_date)
            .unwrap_or(Timestamp::UNIX_EPOCH),
    };

    Ok((otdet, frames, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_length_as_hmmss() {
        assert_eq!(format_length(3661.0), "1:01:01");
        assert_eq!(format_length(59.0), "0:00:59");
    }

    #[test]
    fn resolves_save_path_with_suffixes() {
        let config = DetectConfig {
            detect_start: Some(1.0),
            detect_end: Some(2.0),
            ..Default::default()
        };
        let path = resolve_save_path(Path::new("/tmp/cam_2024-01-01_00-00-00.mp4"), &config);
        assert_eq!(path, PathBuf::from("/tmp/cam_2024-01-01_00-00-00_start_1_end_2.otdet"));
    }

    #[test]
    fn roundtrips_through_write_and_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.otdet");

        let event = DetectedFrameBufferEvent {
            source_metadata: SegmentMetadata {
                source: "cam_2024-01-01_00-00-00.mp4".into(),
                output: "cam_2024-01-01_00-00-00.mp4".into(),
                duration_secs: 2.0,
                width: 100,
                height: 100,
                recorded_fps: 1.0,
                start_time: Timestamp::UNIX_EPOCH,
            },
            frames: vec![DetectedFrame {
                frame: Frame {
                    no: 1,
                    occurrence: Timestamp::UNIX_EPOCH,
                    source: "cam_2024-01-01_00-00-00.mp4".into(),
                    output: "cam_2024-01-01_00-00-00.mp4".into(),
                    image: None,
                },
                detections: vec![Detection {
                    label: "car".into(),
                    conf: 0.9,
                    x: 1.0,
                    y: 2.0,
                    w: 3.0,
                    h: 4.0,
                }],
            }],
        };
        let detector_meta = ObjectDetectorMetadata {
            model_name: "yolo".into(),
            classes: BTreeMap::from([(0, "car".to_string())]),
            config: DetectConfig::default(),
        };
        let otdet = build_otdet(&event, &DetectConfig::default(), &detector_meta);
        let subject = SyncSubject::new();
        write_otdet(&path, &otdet, false, &subject).unwrap();

        let (_parsed, frames, metadata) = parse_otdet(&path).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].detections[0].label, "car");
        assert_eq!(metadata.width, 100);
    }

    #[test]
    fn refuses_overwrite_when_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.otdet");
        fs::write(&path, b"{}").unwrap();
        let event = DetectedFrameBufferEvent {
            source_metadata: SegmentMetadata {
                source: "s".into(),
                output: "o".into(),
                duration_secs: 1.0,
                width: 1,
                height: 1,
                recorded_fps: 1.0,
                start_time: Timestamp::UNIX_EPOCH,
            },
            frames: Vec::new(),
        };
        let detector_meta = ObjectDetectorMetadata {
            model_name: "m".into(),
            classes: BTreeMap::new(),
            config: DetectConfig::default(),
        };
        let otdet = build_otdet(&event, &DetectConfig::default(), &detector_meta);
        let subject = SyncSubject::new();
        let err = write_otdet(&path, &otdet, false, &subject).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::OutputExists);
    }
}
