//! Fork-server mode: a long-lived process that clones a fresh child per
//! `RUN` command, reporting each child's outcome back to the fuzzer.
//!
//! The state machine is a `LISTEN -> fork -> wait_for_child -> send_status`
//! cycle; timeout escalation is an explicit iterative loop rather than
//! recursive re-arming (see the crate's design notes on cyclic control
//! flow).

use std::convert::TryFrom;
use std::sync::atomic::Ordering;

use nix::sys::signal::Signal;

use crate::ipc::{self, IpcOpen};
use crate::process::{self, ExitDisposition};
use crate::protocol::{ForkserverCommand, ForkserverConfig, ForkserverStatus, Mode};
use crate::utils::{self, ErrorSource};

/// Performs the handshake common to both modes: attach IPC, send the
/// handshake identifier, read back the config, send the ACK byte. Returns
/// `None` when no fuzzer is present (the runtime should stay inert).
pub(crate) fn handshake(mode: Mode) -> Option<ForkserverConfig> {
	let opened = ipc::open().unwrap_or_else(|err| utils::panic(ErrorSource::Ipc, &err.to_string()));
	match opened {
		IpcOpen::Standalone => None,
		IpcOpen::Attached => Some(ipc::handshake(mode)),
	}
}

pub(crate) fn convert_status(config: &ForkserverConfig, disposition: ExitDisposition) -> ForkserverStatus {
	match disposition {
		ExitDisposition::Exited(code) => {
			// WEXITSTATUS is only defined on the low 8 bits.
			let code = (code & 0xff) as u8;
			if config.exit_code_is_crash(code) {
				ForkserverStatus::Crash
			} else {
				ForkserverStatus::Exit
			}
		}
		ExitDisposition::Signaled(_) => ForkserverStatus::Crash,
	}
}

fn timeout_spec(timeout_ms: i32) -> libc::timespec {
	libc::timespec {
		tv_sec: (timeout_ms / 1000) as libc::time_t,
		tv_nsec: ((timeout_ms % 1000) as libc::c_long) * 1_000_000,
	}
}

/// Blocks `SIGCHLD` via `sigprocmask` and returns the `sigset_t` to pass to
/// `sigtimedwait`. Built directly on libc rather than `nix`'s `SigSet`: since
/// `sigtimedwait` itself isn't wrapped by `nix`, keeping the whole
/// block-then-wait sequence in one idiom avoids mixing two signal-set
/// representations.
fn block_sigchld() -> libc::sigset_t {
	unsafe {
		let mut set: libc::sigset_t = std::mem::zeroed();
		libc::sigemptyset(&mut set);
		libc::sigaddset(&mut set, libc::SIGCHLD);
		if libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
			utils::panic(ErrorSource::Forkserver, "Could not block SIGCHLD");
		}
		set
	}
}

/// Blocks on `sigtimedwait` for `SIGCHLD` within `timeout`. Returns `true` if
/// it arrived, `false` on timeout (`EAGAIN`), panics on anything else.
fn sigchld_within(signals: &libc::sigset_t, timeout: &libc::timespec) -> bool {
	let r = unsafe { libc::sigtimedwait(signals, std::ptr::null_mut(), timeout) };
	if r == libc::SIGCHLD {
		return true;
	}
	if std::io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) {
		false
	} else {
		utils::panic(ErrorSource::Forkserver, "Sigtimedwait failed");
	}
}

/// Waits for `child` to terminate or for `config.timeout_ms` to elapse.
///
/// On timeout: sends `config.signal` then waits once more at the same
/// budget; if the child is still alive after that, escalates to `SIGKILL`
/// and blocks until it's reaped (`SIGKILL` cannot be caught, so this cannot
/// hang). Either way the outcome is reported as `TIMEOUT`, not whatever exit
/// disposition the signal produced — one soft kill followed by one hard
/// kill, never more.
fn wait_for_child(
	config: &ForkserverConfig, child: process::ChildHandle, signals: &libc::sigset_t,
) -> ForkserverStatus {
	if config.timeout_ms == 0 {
		return convert_status(config, child.wait(ErrorSource::Forkserver));
	}

	let timeout = timeout_spec(config.timeout_ms);
	if sigchld_within(signals, &timeout) {
		return convert_status(config, child.wait(ErrorSource::Forkserver));
	}

	let soft_signal = Signal::try_from(config.signal)
		.unwrap_or_else(|_| utils::panic(ErrorSource::Forkserver, "Invalid timeout signal in config"));
	// The child may already have exited; a failed kill here is not an error.
	child.signal(soft_signal);

	if !sigchld_within(signals, &timeout) {
		child.signal(Signal::SIGKILL);
	}
	let _ = child.wait(ErrorSource::Forkserver);
	ForkserverStatus::Timeout
}

/// Entry point for fork-server mode. Noreturn (terminates via `_exit(0)` or
/// by returning into the child's copy of the caller) once a fuzzer is
/// attached; returns immediately, a no-op, if called again or if standalone.
pub fn spawn_forkserver() {
	if crate::STARTED.swap(true, Ordering::SeqCst) {
		return;
	}

	let config = match handshake(Mode::Forkserver) {
		Some(config) => config,
		None => {
			// Standalone: leave `started` set (idempotence still holds) and
			// let the caller run its one fuzzed execution directly.
			return;
		}
	};
	log::info!("forkserver: handshake complete, timeout_ms={}", config.timeout_ms);

	let signals = block_sigchld();

	loop {
		match ipc::recv_command() {
			ForkserverCommand::Stop => {
				log::info!("forkserver: STOP received, exiting");
				ipc::cleanup();
				crate::input::cleanup();
				std::process::exit(0);
			}
			ForkserverCommand::Run => match process::fork(ErrorSource::Forkserver, "Could not fork") {
				process::ForkResult::Child => {
					ipc::close_in_child();
					return;
				}
				process::ForkResult::Parent(child) => {
					let status = wait_for_child(&config, child, &signals);
					log::debug!("forkserver: child {:?} -> {:?}", child.pid, status);
					ipc::send_status(status as u8);
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exit_code_reclassified_as_crash_when_bit_set() {
		let mut exit_codes = [0u8; 32];
		exit_codes[23 / 8] = 1 << (23 % 8);
		let config = ForkserverConfig {
			timeout_ms: 0,
			signal: 0,
			exit_codes,
		};
		assert_eq!(
			convert_status(&config, ExitDisposition::Exited(23)) as u8,
			ForkserverStatus::Crash as u8
		);
		assert_eq!(
			convert_status(&config, ExitDisposition::Exited(0)) as u8,
			ForkserverStatus::Exit as u8
		);
	}

	#[test]
	fn signaled_child_is_always_a_crash() {
		let config = ForkserverConfig {
			timeout_ms: 0,
			signal: 0,
			exit_codes: [0u8; 32],
		};
		assert_eq!(
			convert_status(&config, ExitDisposition::Signaled(Signal::SIGSEGV)) as u8,
			ForkserverStatus::Crash as u8
		);
	}

	#[test]
	fn timeout_spec_splits_millis_into_sec_and_nsec() {
		let ts = timeout_spec(1500);
		assert_eq!(ts.tv_sec, 1);
		assert_eq!(ts.tv_nsec, 500_000_000);
	}
}
