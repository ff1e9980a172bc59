//! Tracing subscriber setup for the `devctx` binary.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "warn,devctx=debug"
    } else {
        "warn"
    }
}

/// Install a stderr fmt subscriber. Safe to call more than once.
///
/// `RUST_LOG` wins when set; otherwise only warnings are shown, or
/// `devctx` debug output with `verbose`. Stdout is left for command output.
pub fn init(verbose: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose),
            )
            .with(filter)
            .init();
    });
}
