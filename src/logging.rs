//! Structured logging setup.
//!
//! Thin wrapper over `tracing-subscriber`'s `EnvFilter`, mapping a verbosity
//! count (as collected by `-v`/`-vv`/`-vvv` on the CLI) onto a default level.
//! `RUST_LOG` always takes precedence when set, matching the usual Rust CLI
//! convention.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber.
///
/// `verbosity` follows the usual `-v` counting convention: `0` = warnings
/// only, `1` = info, `2` = debug, `3+` = trace. Ignored if `RUST_LOG` is set.
pub fn init(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gno_core={default_directive},gno={default_directive}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
