//! Tracing setup.
//!
//! `RUST_LOG` overrides the configured level when set. Initialization is
//! idempotent so library consumers and tests can call it freely.

use tracing_subscriber::EnvFilter;

pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
