//! End-to-end tests of fork-server mode: the test process plays the fuzzer
//! over the pipe wire protocol, against a forked child that calls into this
//! crate's own [`forkrt::spawn_forkserver`].
//!
//! The child is forked directly inside each `#[test]` function rather than
//! exec'd, with its end of the pipe pair positioned at the adjacent file
//! descriptors the wire protocol requires.

use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

mod common;

/// `__FORKSERVER_FD`/`HARNESS_BEHAVIOR` are process-wide environment state
/// read just after `fork()`; serialize the tests in this file so two of them
/// can't race each other's env var writes.
static SEQUENCE: Mutex<()> = Mutex::new(());

const COMMAND_RUN: u8 = 0;
const COMMAND_STOP: u8 = 1;
const STATUS_EXIT: u8 = 0;
const STATUS_CRASH: u8 = 1;
const STATUS_TIMEOUT: u8 = 2;

/// The fuzzer side of the wire protocol for one forked target.
struct Harness {
	to_target: RawFd,
	from_target: RawFd,
}

impl Harness {
	/// Creates the command/status pipe pair, positions the target's ends at
	/// adjacent descriptors as the `N`/`N+1` pipe framing requires, and sets
	/// `__FORKSERVER_FD` so a child forked after this point picks it up.
	fn new() -> Self {
		unsafe {
			let mut cmd = [0 as RawFd; 2];
			let mut status = [0 as RawFd; 2];
			assert_eq!(libc::pipe(cmd.as_mut_ptr()), 0);
			assert_eq!(libc::pipe(status.as_mut_ptr()), 0);

			let target_read = libc::dup(cmd[0]);
			assert!(target_read >= 3);
			assert_eq!(libc::dup2(status[1], target_read + 1), target_read + 1);

			libc::close(cmd[0]);
			libc::close(status[1]);

			std::env::set_var("__FORKSERVER_FD", target_read.to_string());

			Harness {
				to_target: cmd[1],
				from_target: status[0],
			}
		}
	}

	fn send_exact(&self, buf: &[u8]) {
		let mut file = unsafe { std::fs::File::from_raw_fd(self.to_target) };
		file.write_all(buf).unwrap();
		std::mem::forget(file);
	}

	fn recv_exact(&self, buf: &mut [u8]) {
		let mut file = unsafe { std::fs::File::from_raw_fd(self.from_target) };
		file.read_exact(buf).unwrap();
		std::mem::forget(file);
	}

	/// Reads the handshake identifier, sends the config, reads the ack.
	fn handshake(&self, timeout_ms: i32, signal: i32, crash_exit_codes: &[u8]) {
		let mut ident = [0u8; 4];
		self.recv_exact(&mut ident);
		let ident = u32::from_le_bytes(ident);
		assert_eq!(ident & 0xFFFF_0000, 0xDEAD_0000);
		assert_eq!((ident >> 8) & 0xFF, 0x01);
		assert_eq!(ident & 0xFF, 1); // MODE_FORKSERVER

		let mut config = [0u8; 40];
		config[0..4].copy_from_slice(&timeout_ms.to_ne_bytes());
		config[4..8].copy_from_slice(&signal.to_ne_bytes());
		for &code in crash_exit_codes {
			config[8 + (code / 8) as usize] |= 1 << (code % 8);
		}
		self.send_exact(&config);

		let mut ack = [0u8];
		self.recv_exact(&mut ack);
		assert_eq!(ack[0], 1);
	}

	fn run(&self) -> u8 {
		self.send_exact(&[COMMAND_RUN]);
		let mut status = [0u8];
		self.recv_exact(&mut status);
		status[0]
	}

	fn stop(&self) {
		self.send_exact(&[COMMAND_STOP]);
	}
}

fn reap(pid: libc::pid_t) {
	let mut wstatus = 0;
	unsafe {
		libc::waitpid(pid, &mut wstatus, 0);
	}
}

#[test]
fn happy_run_then_exit() {
	common::init_logging();
	let _guard = SEQUENCE.lock().unwrap();
	let (harness, pid) = (|| {
		std::env::set_var("HARNESS_BEHAVIOR", "exit_ok");
		let harness = Harness::new();
		match unsafe { libc::fork() } {
			-1 => panic!("fork failed"),
			0 => {
				forkrt::spawn_forkserver();
				std::process::exit(0);
			}
			pid => (harness, pid),
		}
	})();

	harness.handshake(0, libc::SIGKILL, &[]);
	assert_eq!(harness.run(), STATUS_EXIT);
	harness.stop();
	reap(pid);
}

#[test]
fn crash_via_signal() {
	common::init_logging();
	let _guard = SEQUENCE.lock().unwrap();
	let (harness, pid) = (|| {
		std::env::set_var("HARNESS_BEHAVIOR", "crash_signal");
		let harness = Harness::new();
		match unsafe { libc::fork() } {
			-1 => panic!("fork failed"),
			0 => {
				forkrt::spawn_forkserver();
				unsafe {
					libc::raise(libc::SIGSEGV);
				}
				unreachable!()
			}
			pid => (harness, pid),
		}
	})();

	harness.handshake(0, libc::SIGKILL, &[]);
	assert_eq!(harness.run(), STATUS_CRASH);
	harness.stop();
	reap(pid);
}

#[test]
fn crash_via_reclassified_exit_code() {
	common::init_logging();
	let _guard = SEQUENCE.lock().unwrap();
	let (harness, pid) = (|| {
		std::env::set_var("HARNESS_BEHAVIOR", "crash_exit_code");
		let harness = Harness::new();
		match unsafe { libc::fork() } {
			-1 => panic!("fork failed"),
			0 => {
				forkrt::spawn_forkserver();
				std::process::exit(23);
			}
			pid => (harness, pid),
		}
	})();

	harness.handshake(0, libc::SIGKILL, &[23]);
	assert_eq!(harness.run(), STATUS_CRASH);
	harness.stop();
	reap(pid);
}

#[test]
fn timeout_escalates_to_sigkill() {
	common::init_logging();
	let _guard = SEQUENCE.lock().unwrap();
	let (harness, pid) = (|| {
		std::env::set_var("HARNESS_BEHAVIOR", "timeout");
		let harness = Harness::new();
		match unsafe { libc::fork() } {
			-1 => panic!("fork failed"),
			0 => {
				forkrt::spawn_forkserver();
				std::thread::sleep(Duration::from_secs(9999));
				std::process::exit(0);
			}
			pid => (harness, pid),
		}
	})();

	// A short soft-kill signal the sleeping child ignores by default
	// (SIGUSR1), forcing the hard-kill escalation to be exercised.
	harness.handshake(150, libc::SIGUSR1, &[]);
	assert_eq!(harness.run(), STATUS_TIMEOUT);
	harness.stop();
	reap(pid);
}
