//! End-to-end test of fork-server mode over the shared-memory IPC backend:
//! the one backend persistent mode's signal handlers require, since only a
//! semaphore post is async-signal-safe. Exercises it the same way
//! `tests/forkserver.rs` exercises the pipe backend, but plays the fuzzer's
//! side of the protocol through [`forkrt::forkserver_shm_send_command`] /
//! [`forkrt::forkserver_shm_recv_status`] instead of a pipe.

use std::sync::Mutex;

mod common;

static SEQUENCE: Mutex<()> = Mutex::new(());

const COMMAND_RUN: u8 = 0;
const COMMAND_STOP: u8 = 1;
const STATUS_EXIT: u8 = 0;

/// The fuzzer side of the wire protocol over a System V shared-memory
/// segment, sized and laid out by this crate's own shm backend.
struct ShmHarness {
	id: libc::c_int,
	ptr: *mut u8,
}

impl ShmHarness {
	fn new() -> Self {
		let size = forkrt::forkserver_shm_segment_size();
		let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
		assert!(id >= 0, "shmget failed: {}", std::io::Error::last_os_error());

		let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
		assert!(!ptr.is_null() && ptr as isize != -1, "shmat failed");
		unsafe {
			forkrt::forkserver_shm_init_segment(ptr as *mut u8);
		}

		std::env::set_var("__FORKSERVER_SHM", id.to_string());

		ShmHarness {
			id,
			ptr: ptr as *mut u8,
		}
	}

	fn send_command(&self, buf: &[u8]) {
		assert!(unsafe { forkrt::forkserver_shm_send_command(self.ptr, buf) });
	}

	fn recv_status(&self, buf: &mut [u8]) {
		assert!(unsafe { forkrt::forkserver_shm_recv_status(self.ptr, buf) });
	}

	/// Reads the handshake identifier, sends the config, reads the ack.
	fn handshake(&self, timeout_ms: i32, signal: i32, crash_exit_codes: &[u8]) {
		let mut ident = [0u8; 4];
		self.recv_status(&mut ident);
		let ident = u32::from_le_bytes(ident);
		assert_eq!(ident & 0xFFFF_0000, 0xDEAD_0000);
		assert_eq!(ident & 0xFF, 1); // MODE_FORKSERVER

		let mut config = [0u8; 40];
		config[0..4].copy_from_slice(&timeout_ms.to_ne_bytes());
		config[4..8].copy_from_slice(&signal.to_ne_bytes());
		for &code in crash_exit_codes {
			config[8 + (code / 8) as usize] |= 1 << (code % 8);
		}
		self.send_command(&config);

		let mut ack = [0u8];
		self.recv_status(&mut ack);
		assert_eq!(ack[0], 1);
	}

	fn run(&self) -> u8 {
		self.send_command(&[COMMAND_RUN]);
		let mut status = [0u8];
		self.recv_status(&mut status);
		status[0]
	}

	fn stop(&self) {
		self.send_command(&[COMMAND_STOP]);
	}
}

impl Drop for ShmHarness {
	fn drop(&mut self) {
		unsafe {
			libc::shmdt(self.ptr as *const libc::c_void);
			libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
		}
	}
}

fn reap(pid: libc::pid_t) {
	let mut wstatus = 0;
	unsafe {
		libc::waitpid(pid, &mut wstatus, 0);
	}
}

#[test]
fn happy_run_then_exit_over_shm() {
	common::init_logging();
	let _guard = SEQUENCE.lock().unwrap();

	std::env::set_var("HARNESS_BEHAVIOR", "exit_ok");
	let harness = ShmHarness::new();
	let pid = match unsafe { libc::fork() } {
		-1 => panic!("fork failed"),
		0 => {
			forkrt::spawn_forkserver();
			std::process::exit(0);
		}
		pid => pid,
	};

	harness.handshake(0, libc::SIGKILL, &[]);
	assert_eq!(harness.run(), STATUS_EXIT);
	harness.stop();
	reap(pid);
}
