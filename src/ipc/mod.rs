//! Bidirectional framed channel to the fuzzer.
//!
//! Two backends share one contract: pipe-backed (selected by
//! `__FORKSERVER_FD`) and shared-memory-backed (selected by
//! `__FORKSERVER_SHM`, required once the target runs in persistent mode,
//! since only semaphore posts are safe to call from inside a signal
//! handler). If neither environment variable is present the target is
//! running standalone and the runtime disables itself.
//!
//! The dispatch layer here is deliberately lock-free and allocation-free:
//! [`send_status`] is called from fatal-signal handlers in persistent mode,
//! so everything it touches has to be safe to reach from that context.

mod pipe;
pub(crate) mod shm;

use std::env;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::RuntimeError;
use crate::protocol::{ForkserverCommand, ForkserverConfig, CONFIG_WIRE_LEN};
use crate::utils::{self, ErrorSource};

const FORKSERVER_FD_VAR: &str = "__FORKSERVER_FD";
const FORKSERVER_SHM_VAR: &str = "__FORKSERVER_SHM";
const RESERVED_FD: i32 = 198;

/// Result of attaching to the fuzzer's side of the channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpcOpen {
	/// A fuzzer is present; the channel is live.
	Attached,
	/// Neither environment variable was set: run standalone.
	Standalone,
}

/// Direction of the last operation performed on the channel, used only by
/// the debug-mode alternation check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Direction {
	Read = 0,
	Write = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
enum Backend {
	Unset = 0,
	Pipe = 1,
	Shm = 2,
}

static BACKEND: AtomicU8 = AtomicU8::new(Backend::Unset as u8);
// `last_op` starts at an impossible third value so the very first operation
// never trips the alternation check.
static LAST_OP: AtomicU8 = AtomicU8::new(2);

fn backend() -> Backend {
	match BACKEND.load(Ordering::Relaxed) {
		1 => Backend::Pipe,
		2 => Backend::Shm,
		_ => Backend::Unset,
	}
}

#[cfg(debug_assertions)]
fn check_alternation(direction: Direction) {
	let prev = LAST_OP.swap(direction as u8, Ordering::Relaxed);
	if prev == direction as u8 {
		utils::panic(ErrorSource::Ipc, "Non-alternating operations");
	}
}

#[cfg(not(debug_assertions))]
fn check_alternation(_direction: Direction) {}

/// Attaches to whichever backend the environment selects. The only caller
/// that can meaningfully recover from an `Err` here is a library consumer
/// that wants to detect a misconfigured environment without the process
/// aborting; both of this crate's own entry points (`spawn_forkserver`,
/// `spawn_persistent_loop`) unwrap-and-panic on failure, matching the
/// original runtime's behaviour.
pub fn open() -> Result<IpcOpen, RuntimeError> {
	if let Ok(value) = env::var(FORKSERVER_SHM_VAR) {
		let id: i32 = value
			.parse()
			.map_err(|_| RuntimeError::Handshake("__FORKSERVER_SHM is not a valid shm id"))?;
		shm::attach(id)?;
		BACKEND.store(Backend::Shm as u8, Ordering::Relaxed);
		Ok(IpcOpen::Attached)
	} else if let Ok(value) = env::var(FORKSERVER_FD_VAR) {
		let fd: i32 = value
			.parse()
			.map_err(|_| RuntimeError::Handshake("__FORKSERVER_FD is not a valid descriptor number"))?;
		if fd < 3 || fd == RESERVED_FD {
			return Err(RuntimeError::Handshake("__FORKSERVER_FD names a reserved or invalid descriptor"));
		}
		pipe::attach(fd, fd + 1);
		BACKEND.store(Backend::Pipe as u8, Ordering::Relaxed);
		Ok(IpcOpen::Attached)
	} else {
		Ok(IpcOpen::Standalone)
	}
}

/// Releases whichever resources the active backend holds. Safe to call more
/// than once and safe to call when nothing was ever attached.
pub fn cleanup() {
	match backend() {
		Backend::Pipe => pipe::close(),
		Backend::Shm => shm::close(),
		Backend::Unset => {}
	}
}

/// Closes the child's copy of the pipe backend's file descriptors after a
/// fork; a no-op for the shared-memory backend, which stays attached so a
/// later fork can still reach the runtime.
pub fn close_in_child() {
	if backend() == Backend::Pipe {
		pipe::close();
	}
}

fn disconnect() -> ! {
	log::info!("IPC channel closed by fuzzer, exiting");
	cleanup();
	crate::input::cleanup();
	std::process::exit(0);
}

/// Sends exactly `buf.len()` bytes. A broken connection is treated as the
/// fuzzer having gone away: this calls `_exit(0)` and never returns.
pub fn send_exact(buf: &[u8]) {
	check_alternation(Direction::Write);
	let ok = match backend() {
		Backend::Pipe => pipe::send_exact(buf),
		Backend::Shm => shm::send_exact(buf).is_ok(),
		Backend::Unset => utils::panic(ErrorSource::Ipc, "IPC not attached"),
	};
	if !ok {
		disconnect();
	}
}

/// Receives exactly `buf.len()` bytes. A broken connection is treated as the
/// fuzzer having gone away: this calls `_exit(0)` and never returns.
pub fn recv_exact(buf: &mut [u8]) {
	check_alternation(Direction::Read);
	let ok = match backend() {
		Backend::Pipe => pipe::recv_exact(buf),
		Backend::Shm => shm::recv_exact(buf).is_ok(),
		Backend::Unset => utils::panic(ErrorSource::Ipc, "IPC not attached"),
	};
	if !ok {
		disconnect();
	}
}

/// Reads a single command byte.
pub fn recv_command() -> ForkserverCommand {
	let mut byte = [0u8];
	recv_exact(&mut byte);
	ForkserverCommand::from_byte(byte[0])
		.unwrap_or_else(|| utils::panic(ErrorSource::Forkserver, "Invalid command from fuzzer"))
}

/// Sends a single status byte.
///
/// Async-signal-safe when the active backend is shared memory: it only
/// touches atomics and posts a semaphore, matching the one path persistent
/// mode's fatal-signal handlers are allowed to take.
pub fn send_status(status: u8) {
	check_alternation(Direction::Write);
	let ok = match backend() {
		Backend::Shm => shm::send_status(status).is_ok(),
		Backend::Pipe => pipe::send_exact(&[status]),
		Backend::Unset => utils::panic(ErrorSource::Ipc, "IPC not attached"),
	};
	if !ok {
		disconnect();
	}
}

/// Performs the handshake: send the identifier, read back the config, ack.
pub fn handshake(mode: crate::protocol::Mode) -> ForkserverConfig {
	let ident = mode.handshake_ident();
	send_exact(&ident.to_le_bytes());

	let mut buf = [0u8; CONFIG_WIRE_LEN];
	recv_exact(&mut buf);
	let config = ForkserverConfig::from_bytes(&buf);

	send_exact(&[1]);
	config
}

pub(crate) fn is_attached() -> bool {
	backend() != Backend::Unset
}

/// Signal-handler-safe status send. Unlike [`send_status`], this never calls
/// [`disconnect`] on failure — `process::exit` is not async-signal-safe, and
/// there is nothing more useful to do from inside a fatal-signal handler
/// than let its own `SIGKILL` loop terminate the process regardless. Skips
/// the alternation check for the same reason ([`utils::panic`] on mismatch
/// allocates and locks).
pub fn send_status_signal_safe(status: u8) {
	match backend() {
		Backend::Shm => {
			let _ = shm::send_status(status);
		}
		Backend::Pipe => {
			let _ = pipe::send_exact(&[status]);
		}
		Backend::Unset => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_backend_is_unset() {
		// This only asserts on the enum's own round trip; the process-wide
		// BACKEND static is shared across tests in this binary so we can't
		// assert its value here without risking interference.
		assert_eq!(Backend::Unset as u8, 0);
		assert_eq!(Backend::Pipe as u8, 1);
		assert_eq!(Backend::Shm as u8, 2);
	}
}
