//! Telemetry and structured logging setup.
//!
//! Warden's fatal-error contract depends on logs: the session row only
//! records a terminal status, so the failure cause lives in the log
//! stream. This module wires `tracing-subscriber` accordingly. The
//! output format is an operator choice, not a build-profile one: a
//! human watching a run wants compact console lines, while a harness
//! collecting evidence wants one JSON object per event.
//!
//! `RUST_LOG` always wins when set. Otherwise dependencies are held to
//! `warn` and only the `warden` crate follows the requested level, so a
//! `debug` run shows the loop's own decisions rather than driver noise.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Safe to call more than once; later
/// calls are ignored, which keeps test binaries happy.
pub fn init_telemetry(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,warden={log_level}")));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .ok();
    }
}
