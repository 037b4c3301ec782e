//! Target-side runtime for a coverage-guided fuzzing harness.
//!
//! Linked into the program under test, this crate cooperates with an
//! external fuzzer over a small handshake/command/status protocol to run
//! many inputs per process invocation, in one of two modes:
//!
//! - [`spawn_forkserver`] forks a fresh child per input.
//! - [`spawn_persistent_loop`] runs an in-process loop inside a periodically
//!   cloned child, using signal handlers to turn in-loop hangs and crashes
//!   into status reports.
//!
//! Neither entry point does anything unless one of the `__FORKSERVER_FD` /
//! `__FORKSERVER_SHM` environment variables is present; absent those, the
//! target is assumed to be running standalone and both become no-ops (aside
//! from `spawn_persistent_loop`'s documented single stdin-driven pass).

#[cfg(not(unix))]
compile_error!("forkrt relies on fork(2), signals, and System V shared memory, which this target does not have");

use std::sync::atomic::AtomicBool;

mod error;
mod forkserver;
mod input;
mod ipc;
mod persistent;
mod process;
mod protocol;
mod utils;

pub use error::RuntimeError;
pub use forkserver::spawn_forkserver;
pub use persistent::spawn_persistent_loop;

/// Byte size of the shared-memory segment a fuzzer must allocate to back the
/// `__FORKSERVER_SHM` IPC backend.
pub use ipc::shm::segment_size as forkserver_shm_segment_size;
/// Initializes a freshly allocated shm segment's semaphores. Only the
/// fuzzer side of the protocol calls this; the target never does.
pub use ipc::shm::init_segment as forkserver_shm_init_segment;
/// Sends a command to the target over a shm segment, playing the fuzzer's
/// side of the protocol.
pub use ipc::shm::fuzzer_send_command as forkserver_shm_send_command;
/// Receives a status message from the target over a shm segment, playing
/// the fuzzer's side of the protocol.
pub use ipc::shm::fuzzer_recv_status as forkserver_shm_recv_status;

/// Upper bound accepted by [`spawn_persistent_loop`] when the caller wants no
/// practical limit on the iteration count.
pub const MAX_ITERATIONS: u64 = u64::MAX;

/// Shared across both modes: sets once either entry point has handshaked
/// successfully, making a second call to either a no-op. See the data
/// model's `started` invariant.
pub(crate) static STARTED: AtomicBool = AtomicBool::new(false);

/// Stable pointer to the first byte of the current fuzz input, or `None` if
/// it is zero-length.
pub fn fuzz_input_ptr() -> Option<*const u8> {
	input::ptr()
}

/// Number of valid bytes in the current fuzz input.
pub fn fuzz_input_len() -> usize {
	input::len()
}

/// Maximum length the fuzzer may ever set the input to, when that's known
/// (shared-memory backend only).
pub fn fuzz_input_max_len() -> Option<usize> {
	input::max_len()
}

/// Page-aligned byte size of the input's backing region.
pub fn fuzz_input_capacity() -> usize {
	input::capacity()
}

/// Advances the input cursor by `min(n, remaining)`, returning `(prior
/// position, bytes consumed)`.
pub fn fuzz_input_consume(n: usize) -> (usize, usize) {
	input::consume(n)
}
