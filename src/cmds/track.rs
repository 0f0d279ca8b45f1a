//! `track`: runs C6→C7→C8 over a set of OTDET files (spec §6).

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use otvision_core::config::{IouParams, TrackConfig};
use otvision_core::pipeline;

use crate::config_file;

/// Groups OTDET files, runs IOU tracking across chunk boundaries, and
/// writes one OTTRK artifact per finished chunk.
#[derive(Bpaf, Debug)]
#[bpaf(command("track"))]
pub struct Args {
    #[bpaf(external(super::paths))]
    paths: Vec<PathBuf>,

    #[bpaf(external(super::config_path))]
    config: Option<PathBuf>,

    #[bpaf(external(super::overwrite))]
    overwrite: bool,

    #[bpaf(external(super::verbosity))]
    verbose: u8,

    /// IOU tracker: detection-confidence floor below which a box is
    /// never even considered (spec §4.5).
    #[bpaf(long, argument::<f32>("SIGMA_L"), optional)]
    sigma_l: Option<f32>,

    /// IOU tracker: confidence a track must reach at least once to be
    /// kept (spec §4.5).
    #[bpaf(long, argument::<f32>("SIGMA_H"), optional)]
    sigma_h: Option<f32>,

    /// IOU tracker: minimum overlap to continue a track onto a new
    /// detection (spec §4.5).
    #[bpaf(long, argument::<f32>("SIGMA_IOU"), optional)]
    sigma_iou: Option<f32>,

    /// IOU tracker: minimum track length, in frames, to be kept
    /// (spec §4.5).
    #[bpaf(long("t-min"), argument::<u32>("FRAMES"), optional)]
    t_min: Option<u32>,

    /// IOU tracker: maximum consecutive missed frames before a track is
    /// closed (spec §4.5).
    #[bpaf(long("t-miss-max"), argument::<u32>("FRAMES"), optional)]
    t_miss_max: Option<u32>,

    /// Keep discarded (too-short) tracks in the output, flagged rather
    /// than dropped.
    #[bpaf(long("keep-discarded"), switch)]
    keep_discarded: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    crate::cmds::apply_verbosity(args.verbose);

    let file_config = config_file::load(args.config.as_deref())?;
    let default = TrackConfig::default();
    let iou = IouParams {
        sigma_l: args.sigma_l.or(file_config.track.sigma_l).unwrap_or(default.iou.sigma_l),
        sigma_h: args.sigma_h.or(file_config.track.sigma_h).unwrap_or(default.iou.sigma_h),
        sigma_iou: args.sigma_iou.or(file_config.track.sigma_iou).unwrap_or(default.iou.sigma_iou),
        t_min: args.t_min.or(file_config.track.t_min).unwrap_or(default.iou.t_min),
        t_miss_max: args.t_miss_max.or(file_config.track.t_miss_max).unwrap_or(default.iou.t_miss_max),
    };
    let merge_threshold = file_config
        .track
        .merge_threshold_secs
        .map(|s| jiff::Span::new().seconds(s))
        .unwrap_or(default.merge_threshold);
    let config = TrackConfig {
        iou,
        merge_threshold,
        keep_discarded: args.keep_discarded || file_config.track.keep_discarded.unwrap_or(default.keep_discarded),
        overwrite: args.overwrite || file_config.track.overwrite.unwrap_or(false),
    };

    let written = pipeline::run_track(&args.paths, &config)?;
    tracing::info!(count = written.len(), "wrote OTTRK artifacts");
    Ok(0)
}
