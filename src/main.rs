use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use base::Error;
use bpaf::{Bpaf, Parser};
use tracing::{debug, error};

mod cmds;
mod config_file;
mod null_detector;

/// otvision: detect-then-track video pipeline.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(env!("CARGO_PKG_VERSION")))]
enum Args {
    Detect(#[bpaf(external(cmds::detect::args))] cmds::detect::Args),
    Track(#[bpaf(external(cmds::track::args))] cmds::track::Args),
    GenerateVideo(#[bpaf(external(cmds::generate_video::args))] cmds::generate_video::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Detect(a) => cmds::detect::run(a),
            Args::Track(a) => cmds::track::run(a),
            Args::GenerateVideo(a) => cmds::generate_video::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/otvision`: `otvision`), falling back to the crate name
    // if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let parsed = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => {
            // `exit_code()` prints the relevant usage/error message and
            // returns 0 for --help/--version/shell completion, 1 otherwise;
            // fold the latter into the CLI-parse exit code the spec
            // requires (spec §6: "2 CLI-parse error").
            let code = e.exit_code();
            std::process::exit(if code == 0 { 0 } else { 2 });
        }
    };
    tracing::trace!("parsed command-line arguments: {parsed:#?}");

    match parsed.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
