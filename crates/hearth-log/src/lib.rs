// ABOUTME: Shared logging setup for all hearth binaries
// ABOUTME: init() defaults to INFO, init_with_debug() raises the default to DEBUG

use tracing_subscriber::EnvFilter;

/// Standard logging. Default: INFO level, RUST_LOG override.
pub fn init() {
    init_with_debug(false);
}

/// Same as [`init`], but with DEBUG as the default level when `debug` is set.
/// Used by binaries that take a `--debug` flag.
pub fn init_with_debug(debug: bool) {
    let default_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn exports_init() {
        let _ = super::init as fn();
    }

    #[test]
    fn exports_init_with_debug() {
        let _ = super::init_with_debug as fn(bool);
    }
}
