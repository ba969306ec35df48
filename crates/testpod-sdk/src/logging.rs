//! Tracing setup for test binaries.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Installs a `RUST_LOG`-filtered fmt subscriber writing through libtest's
/// capture, so container logs appear next to the failing test. Safe to call
/// from every test; only the first call installs anything, and an already
/// installed global subscriber is left alone.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_test_tracing();
        init_test_tracing();
        tracing::info!("tracing initialised");
    }
}
