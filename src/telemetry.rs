//! Logging bootstrap, mirrored from the teacher's `freeq-server` main
//! (`FREEQ_LOG_JSON`), generalized to this crate's `GUN_LOG_JSON` toggle.
//! A library never installs a global subscriber on its own; callers that
//! want it call this explicitly from their own `main`.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` subscriber: JSON when `json` is
/// true or `GUN_LOG_JSON=1` is set, human-readable otherwise. Panics if a
/// global subscriber is already installed (mirrors the teacher's own
/// one-shot `.init()` usage).
pub fn init_tracing(json: bool) {
    let json = json || std::env::var("GUN_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("gun_core=info".parse().expect("static directive parses"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
