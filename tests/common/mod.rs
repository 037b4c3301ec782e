//! Shared setup for the integration test binaries in this directory. Each
//! file under `tests/` is compiled as its own crate, so this lives in
//! `common/mod.rs` rather than `common.rs` to keep cargo from also treating
//! it as a standalone test binary.

use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Installs `env_logger` at most once per test binary. The library itself
/// never does this — it only calls the `log` macros — so the integration
/// tests that want `RUST_LOG`-driven output on failure call this first.
pub fn init_logging() {
	LOG_INIT.call_once(|| {
		let _ = env_logger::try_init();
	});
}
