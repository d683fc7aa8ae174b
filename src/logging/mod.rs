//! Logging initialization.
//!
//! The engine logs through the `log` facade; embedders that already own a
//! logger can skip this module entirely.

use env_logger::Builder;
use log::LevelFilter;

/// Initialize env_logger with a default level, overridable through the
/// standard `RUST_LOG` environment variable. Panics if a logger is already
/// installed.
pub fn init_logging(default_level: LevelFilter) {
    Builder::from_env(env_logger::Env::default())
        .filter(None, default_level)
        .init();
}

/// Like [`init_logging`] but tolerates an already-installed logger; used
/// by tests and embedders with their own initialization order.
pub fn try_init_logging(default_level: LevelFilter) {
    let _ = Builder::from_env(env_logger::Env::default())
        .filter(None, default_level)
        .try_init();
}
