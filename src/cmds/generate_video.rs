//! `generate_video`: burns an OTTRK artifact's tracked boxes onto its
//! source video (spec §6; no further component-design detail is given,
//! so this reuses `otvision_core::video`'s OTTRK-based annotator).

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use otvision_core::export::OttrkFile;
use otvision_core::video::{self, DrawConfig};

/// Writes an annotated copy of each OTTRK's source video, with every
/// tracked detection's bounding box burned in.
#[derive(Bpaf, Debug)]
#[bpaf(command("generate_video"))]
pub struct Args {
    #[bpaf(external(super::paths))]
    paths: Vec<PathBuf>,

    #[bpaf(external(super::config_path))]
    config: Option<PathBuf>,

    #[bpaf(external(super::overwrite))]
    overwrite: bool,

    #[bpaf(external(super::verbosity))]
    verbose: u8,
}

pub fn run(args: Args) -> Result<i32, Error> {
    crate::cmds::apply_verbosity(args.verbose);
    // generate_video has no tunable detector/tracker parameters of its own
    // (spec §6); the config file is still consulted so --config is honored
    // uniformly across all three commands, even though nothing here reads it.
    let _ = crate::config_file::load(args.config.as_deref())?;

    let draw = DrawConfig::default();
    let mut count = 0usize;
    for ottrk_path in &args.paths {
        let bytes = std::fs::read(ottrk_path)
            .map_err(|e| base::err!(IoFailure, msg("reading ottrk file {:?}: {e}", ottrk_path)))?;
        let ottrk: OttrkFile = serde_json::from_slice(&bytes)
            .map_err(|e| base::err!(IoFailure, msg("parsing ottrk file {:?}: {e}", ottrk_path)))?;

        let video_path = video::resolve_video_path(ottrk_path, &ottrk);
        let out_path = ottrk_path.with_extension("annotated.mp4");
        video::annotate_video(&video_path, &ottrk, &out_path, &draw, args.overwrite)?;
        count += 1;
    }

    tracing::info!(count, "wrote annotated videos");
    Ok(0)
}
