//! Logic for setting up a `tracing` subscriber according to project
//! preferences. Grounded on moonfire-nvr's `base::tracing_setup`.

use tracing::error;
use tracing_subscriber::layer::SubscriberExt;

/// Installs the global subscriber and panic hook for normal operation.
///
/// Reads `OTVISION_LOG` for the `tracing-subscriber` `EnvFilter` directive
/// (default: `info`) and `OTVISION_FORMAT=json` to switch to structured
/// JSON output (default: human-readable).
pub fn install() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("OTVISION_LOG")
        .from_env_lossy();
    tracing_log::LogTracer::init().ok();

    if std::env::var("OTVISION_FORMAT").as_deref() == Ok("json") {
        let sub = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .json()
                .with_filter(filter),
        );
        tracing::subscriber::set_global_default(sub).ok();
    } else {
        let sub = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_filter(filter),
        );
        tracing::subscriber::set_global_default(sub).ok();
    }

    std::panic::set_hook(Box::new(panic_hook));
}

/// Installs a subscriber suitable for `cargo test` (writes to the test
/// harness's captured output instead of stderr directly).
pub fn install_for_tests() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
        .with_env_var("OTVISION_LOG")
        .from_env_lossy();
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_thread_names(true)
            .with_filter(filter),
    );
    let _ = tracing::subscriber::set_global_default(sub);
}

fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        p.payload().downcast_ref::<String>().map(|s| s.as_str())
    };
    error!(
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        "panic",
    );
}
