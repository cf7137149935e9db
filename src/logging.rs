//! Structured logging setup.
//!
//! Grounded in the teacher's use of `tracing`/`tracing-subscriber` with the
//! `env-filter` feature rather than `println!`/`log` — see
//! `knhk-workflow-engine/src/engine/scheduler.rs` and `src/executor.rs`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber driven by `CYLC_LOG` (falling back
/// to `RUST_LOG`, then `info`).
pub fn init() {
    let filter = EnvFilter::try_from_env("CYLC_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
