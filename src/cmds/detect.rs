//! `detect`: runs C1→C2→C3→C4 over a set of video files (spec §6).

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use otvision_core::config::{DetectConfig, Device};
use otvision_core::pipeline;

use crate::config_file;
use crate::null_detector::NullDetector;

/// Detects objects in video files and writes one OTDET artifact per file.
#[derive(Bpaf, Debug)]
#[bpaf(command("detect"))]
pub struct Args {
    #[bpaf(external(super::paths))]
    paths: Vec<PathBuf>,

    #[bpaf(external(super::config_path))]
    config: Option<PathBuf>,

    #[bpaf(external(super::overwrite))]
    overwrite: bool,

    #[bpaf(external(super::verbosity))]
    verbose: u8,

    /// Path to the detector's model weights.
    #[bpaf(long, argument::<PathBuf>("PATH"), optional)]
    weights: Option<PathBuf>,

    /// Minimum confidence for a detection to be kept.
    #[bpaf(long, argument::<f32>("CONF"), optional)]
    conf: Option<f32>,

    /// IOU threshold used by the detector's own non-max suppression.
    #[bpaf(long, argument::<f32>("IOU"), optional)]
    iou: Option<f32>,

    /// Model input image size (square side, in pixels).
    #[bpaf(long("imagesize"), argument::<u32>("PX"), optional)]
    image_size: Option<u32>,

    /// Run inference at half precision.
    #[bpaf(long("half"), switch)]
    half_precision: bool,

    /// Reserved: an override for a video's recorded start time. The
    /// pipeline's frame source always derives start time from the
    /// filename (spec §4.1); this flag is accepted for CLI-surface parity
    /// but has no effect until that contract is extended.
    #[bpaf(long("start-time"), argument::<String>("TIMESTAMP"), optional)]
    start_time: Option<String>,

    /// Only run inference on frames in `[detect_start, detect_end)`
    /// seconds; frames outside the window are still emitted, with a null
    /// image (spec §4.1).
    #[bpaf(long("detect-start"), argument::<f64>("SECONDS"), optional)]
    detect_start: Option<f64>,

    #[bpaf(long("detect-end"), argument::<f64>("SECONDS"), optional)]
    detect_end: Option<f64>,

    /// Also write an annotated copy of each source video next to its
    /// OTDET artifact.
    #[bpaf(long("write-video"), switch)]
    write_video: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    crate::cmds::apply_verbosity(args.verbose);

    let file_config = config_file::load(args.config.as_deref())?;
    let default = DetectConfig::default();
    let config = DetectConfig {
        weights: args.weights.or(file_config.detect.weights).unwrap_or(default.weights),
        conf: args.conf.or(file_config.detect.conf).unwrap_or(default.conf),
        iou: args.iou.or(file_config.detect.iou).unwrap_or(default.iou),
        image_size: args.image_size.or(file_config.detect.image_size).unwrap_or(default.image_size),
        half_precision: args.half_precision || file_config.detect.half_precision.unwrap_or(false),
        device: file_config
            .detect
            .device
            .map(Device::from)
            .unwrap_or(default.device),
        normalized: file_config.detect.normalized.unwrap_or(default.normalized),
        chunksize: file_config.detect.chunksize.unwrap_or(default.chunksize),
        detect_start: args.detect_start.or(file_config.detect.detect_start).or(default.detect_start),
        detect_end: args.detect_end.or(file_config.detect.detect_end).or(default.detect_end),
        expected_duration: default.expected_duration,
        overwrite: args.overwrite || file_config.detect.overwrite.unwrap_or(false),
    };

    let detector = NullDetector::load(&config)?;
    let written = pipeline::run_detect(&args.paths, &config, &detector)?;

    if args.write_video {
        for w in &written {
            write_annotated_from_otdet(&w.save_location)?;
        }
    }

    tracing::info!(count = written.len(), "wrote OTDET artifacts");
    Ok(0)
}

fn write_annotated_from_otdet(otdet_path: &std::path::Path) -> Result<(), Error> {
    let (otdet, _frames, _metadata) = otvision_core::otdet::parse_otdet(otdet_path)?;
    let video_path = otvision_core::video::resolve_video_path_from_otdet(otdet_path, &otdet);
    let out_path = otdet_path.with_extension("annotated.mp4");
    otvision_core::video::annotate_video_from_otdet(
        &video_path,
        &otdet,
        &out_path,
        &otvision_core::video::DrawConfig::default(),
        true,
    )
}

