//! Typed errors for the handful of entry points that let a caller recover
//! instead of going through [`crate::utils::panic`].
//!
//! Most of the runtime's failure paths are documented (see the crate's
//! design notes) as unconditional panics: a forkserver that can't fork, or a
//! child whose waitpid disposition is nonsensical, has nothing sensible left
//! to do. `RuntimeError` exists for the narrower surface where "this target
//! is running standalone, outside of a fuzzer" is an expected, recoverable
//! outcome rather than a bug.

use thiserror::Error;

/// The crate's two genuinely fallible setup paths: `Ipc::open` and
/// `Input::attach` (see their doc comments). Every other failure mode listed
/// in the crate's design notes (bad waitpid disposition, non-alternating IPC
/// operations, an oversized message, an unrecognised command byte) is a
/// broken protocol invariant rather than an expected runtime condition, so it
/// still goes through [`crate::utils::panic`] instead of this enum.
#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("could not attach shared memory segment {id}")]
	ShmAttach { id: i32 },

	#[error("could not set up IPC: {0}")]
	Handshake(&'static str),
}
