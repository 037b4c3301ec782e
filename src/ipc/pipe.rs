//! Pipe-backed IPC: raw bytes, lengths determined by the caller, `EINTR`
//! retried implicitly by treating any short read/write as "try again".
//!
//! This backend is never used from inside a signal handler (persistent mode
//! always selects the shared-memory backend for that), so it is free to use
//! ordinary blocking syscalls without async-signal-safety constraints. It
//! talks to the raw fds directly via libc rather than through `nix::unistd`
//! so the read/write loop matches the wire framing byte for byte.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static READ_FD: AtomicI32 = AtomicI32::new(-1);
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

pub fn attach(read_fd: RawFd, write_fd: RawFd) {
	READ_FD.store(read_fd, Ordering::Relaxed);
	WRITE_FD.store(write_fd, Ordering::Relaxed);
}

pub fn close() {
	let read_fd = READ_FD.swap(-1, Ordering::Relaxed);
	let write_fd = WRITE_FD.swap(-1, Ordering::Relaxed);
	if read_fd >= 0 {
		unsafe {
			libc::close(read_fd);
		}
	}
	if write_fd >= 0 {
		unsafe {
			libc::close(write_fd);
		}
	}
}

/// Writes `buf` in full, retrying on `EINTR` and on short writes. Returns
/// `false` on any other error or on a non-positive write (peer gone).
pub fn send_exact(buf: &[u8]) -> bool {
	let fd = WRITE_FD.load(Ordering::Relaxed);
	let mut total = 0usize;
	while total < buf.len() {
		let r = unsafe {
			libc::write(
				fd,
				buf[total..].as_ptr() as *const libc::c_void,
				buf.len() - total,
			)
		};
		if r > 0 {
			total += r as usize;
		} else if r < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
		{
			continue;
		} else {
			return false;
		}
	}
	true
}

/// Reads exactly `buf.len()` bytes, retrying on `EINTR` and on short reads.
/// Returns `false` on any other error or on EOF (peer gone).
pub fn recv_exact(buf: &mut [u8]) -> bool {
	let fd = READ_FD.load(Ordering::Relaxed);
	let mut total = 0usize;
	while total < buf.len() {
		let r = unsafe {
			libc::read(
				fd,
				buf[total..].as_mut_ptr() as *mut libc::c_void,
				buf.len() - total,
			)
		};
		if r > 0 {
			total += r as usize;
		} else if r < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
		{
			continue;
		} else {
			return false;
		}
	}
	true
}
