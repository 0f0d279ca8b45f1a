//! Shared argument fragments reused across the three subcommands.

use std::path::PathBuf;

use bpaf::Parser;

pub mod detect;
pub mod generate_video;
pub mod track;

/// `--paths PATH...`: at least one video/artifact path to process.
pub fn paths() -> impl Parser<Vec<PathBuf>> {
    bpaf::long("paths")
        .help("Video or OTDET files to process")
        .argument::<PathBuf>("PATH")
        .some("must specify at least one path via --paths")
}

/// `--config PATH`: optional config-file override (spec §6).
pub fn config_path() -> impl Parser<Option<PathBuf>> {
    bpaf::long("config")
        .help("Path to a config file (default: user_config.otvision.yaml in cwd, else built-in defaults)")
        .argument::<PathBuf>("PATH")
        .optional()
}

/// `--overwrite`/`--no-overwrite`: whether to replace existing artifacts.
pub fn overwrite() -> impl Parser<bool> {
    let yes = bpaf::long("overwrite")
        .help("Replace an existing output artifact instead of skipping it")
        .req_flag(true);
    let no = bpaf::long("no-overwrite").req_flag(false);
    bpaf::construct!([yes, no]).fallback(false)
}

/// `-v`/`--verbose`, repeatable: each occurrence raises the log level by
/// one step over the `OTVISION_LOG` default (spec §6 "logging flags").
pub fn verbosity() -> impl Parser<u8> {
    bpaf::short('v')
        .long("verbose")
        .help("Increase log verbosity (repeatable)")
        .req_flag(())
        .many()
        .map(|flags| flags.len() as u8)
}

/// Raises the default tracing level by `extra_verbosity` steps, unless
/// `OTVISION_LOG` is already set in the environment (which always wins).
pub fn apply_verbosity(extra_verbosity: u8) {
    if extra_verbosity == 0 || std::env::var_os("OTVISION_LOG").is_some() {
        return;
    }
    let level = match extra_verbosity {
        1 => "debug",
        _ => "trace",
    };
    std::env::set_var("OTVISION_LOG", level);
}
