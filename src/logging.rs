//! Log output for the `parley` binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,parley=info",
        1 => "info,parley=debug",
        _ => "debug,parley=trace",
    }
}

/// Installs a stderr subscriber. `RUST_LOG` wins over `verbose`.
///
/// Calling it twice is harmless; the second call keeps the first subscriber.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose > 0),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}
