/// Tracing subscriber setup
///
/// `RUST_LOG` takes precedence; otherwise `default_directive` applies
/// (for example `"wakeword_listener=debug"`).

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. Returns false if one was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
