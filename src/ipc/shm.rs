//! Shared-memory-backed IPC.
//!
//! The segment holds two fixed-size channels (command: fuzzer→target,
//! status: target→fuzzer), each a counting semaphore plus a small message
//! buffer. This is the only backend persistent mode's fatal-signal handlers
//! are allowed to call into: semaphore posts are async-signal-safe on
//! POSIX, whereas a `write()` on a pipe can interleave badly with a write
//! already in flight on the mainline thread when a signal interrupts it.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::RuntimeError;

pub const MAX_MESSAGE_SIZE: usize = 64;

#[repr(C)]
struct Channel {
	semaphore: libc::sem_t,
	message_size: usize,
	message: [u8; MAX_MESSAGE_SIZE],
}

#[repr(C)]
struct Segment {
	/// fuzzer -> target
	command_channel: Channel,
	/// target -> fuzzer
	status_channel: Channel,
}

static SHM: AtomicPtr<Segment> = AtomicPtr::new(std::ptr::null_mut());

fn segment() -> *mut Segment {
	SHM.load(Ordering::Relaxed)
}

/// Attaches an existing System V shared-memory segment created by the
/// fuzzer. The fuzzer is responsible for having already initialized both
/// channels' semaphores (`sem_init(..., pshared = 1, value = 0)`).
pub fn attach(id: i32) -> Result<(), RuntimeError> {
	let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
	if ptr.is_null() || ptr as isize == -1 {
		return Err(RuntimeError::ShmAttach { id });
	}
	SHM.store(ptr as *mut Segment, Ordering::Relaxed);
	Ok(())
}

/// Detaching is skipped: the fuzzer may still be mapping the same segment
/// for the next fork, and `shmdt` is not guaranteed safe to call from a
/// context that might race with the signal handlers. This mirrors the
/// original runtime's documented choice to leave it attached.
pub fn close() {
	SHM.store(std::ptr::null_mut(), Ordering::Relaxed);
}

unsafe fn sem_post_retrying(sem: *mut libc::sem_t) -> bool {
	loop {
		if libc::sem_post(sem) == 0 {
			return true;
		}
		if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
			return false;
		}
	}
}

unsafe fn sem_wait_retrying(sem: *mut libc::sem_t) -> bool {
	loop {
		if libc::sem_wait(sem) == 0 {
			return true;
		}
		if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
			return false;
		}
	}
}

/// Writes `buf` into the status channel and posts its semaphore. Panics if
/// `buf` exceeds the channel's message buffer; the protocol never sends
/// anything bigger than the 40-byte config.
pub fn send_exact(buf: &[u8]) -> Result<(), ()> {
	if buf.len() > MAX_MESSAGE_SIZE {
		crate::utils::panic(
			crate::utils::ErrorSource::Ipc,
			"Message too large for status channel",
		);
	}
	let seg = segment();
	unsafe {
		(*seg).status_channel.message_size = buf.len();
		std::ptr::copy_nonoverlapping(
			buf.as_ptr(),
			(*seg).status_channel.message.as_mut_ptr(),
			buf.len(),
		);
		if sem_post_retrying(&mut (*seg).status_channel.semaphore) {
			Ok(())
		} else {
			Err(())
		}
	}
}

/// Waits on the command channel's semaphore and copies exactly `buf.len()`
/// bytes out of it. Panics if the sender's message length doesn't match.
pub fn recv_exact(buf: &mut [u8]) -> Result<(), ()> {
	let seg = segment();
	unsafe {
		if !sem_wait_retrying(&mut (*seg).command_channel.semaphore) {
			return Err(());
		}
		if (*seg).command_channel.message_size != buf.len() {
			crate::utils::panic(
				crate::utils::ErrorSource::Ipc,
				"Received message over command channel that does not match requested length",
			);
		}
		std::ptr::copy_nonoverlapping(
			(*seg).command_channel.message.as_ptr(),
			buf.as_mut_ptr(),
			buf.len(),
		);
		Ok(())
	}
}

/// Single-byte status send. Async-signal-safe: the handshake ACK already
/// set `message_size = 1`, so unlike [`send_exact`] this never rewrites the
/// length field, only the payload byte and the semaphore post.
pub fn send_status(status: u8) -> Result<(), ()> {
	let seg = segment();
	unsafe {
		(*seg).status_channel.message[0] = status;
		if sem_post_retrying(&mut (*seg).status_channel.semaphore) {
			Ok(())
		} else {
			Err(())
		}
	}
}

/// Size in bytes of the shared-memory segment the fuzzer must allocate to
/// back this backend. Exposed so tests (acting as the fuzzer) and
/// out-of-tree fuzzer implementations can size their `shmget` call.
pub const fn segment_size() -> usize {
	std::mem::size_of::<Segment>()
}

/// Initializes a freshly `shmget`+`shmat`-ed segment's semaphores. Used only
/// by the fuzzer side of the protocol (i.e. by this crate's own tests, which
/// play the fuzzer's role); the target never calls this.
///
/// # Safety
/// `ptr` must point at a `segment_size()`-byte region suitable to hold a
/// `Segment`, and must outlive both processes that will touch it.
pub unsafe fn init_segment(ptr: *mut u8) {
	let seg = ptr as *mut Segment;
	libc::sem_init(&mut (*seg).command_channel.semaphore, 1, 0);
	libc::sem_init(&mut (*seg).status_channel.semaphore, 1, 0);
	(*seg).command_channel.message_size = 0;
	(*seg).status_channel.message_size = 0;
}

/// Writes `buf` into the command channel and posts its semaphore: the
/// fuzzer's half of the exchange the target's [`recv_exact`]/`recv_command`
/// wait on. Returns `false` if `buf` is oversized or the semaphore post
/// fails.
///
/// # Safety
/// `ptr` must point at a segment [`init_segment`] has already initialized.
pub unsafe fn fuzzer_send_command(ptr: *mut u8, buf: &[u8]) -> bool {
	if buf.len() > MAX_MESSAGE_SIZE {
		return false;
	}
	let seg = ptr as *mut Segment;
	(*seg).command_channel.message_size = buf.len();
	std::ptr::copy_nonoverlapping(buf.as_ptr(), (*seg).command_channel.message.as_mut_ptr(), buf.len());
	sem_post_retrying(&mut (*seg).command_channel.semaphore)
}

/// Waits on the status channel's semaphore and copies exactly `buf.len()`
/// bytes out of it: the fuzzer's half of the exchange the target's
/// [`send_exact`]/`send_status` post to. Returns `false` if the wait fails
/// or the sender's message length doesn't match `buf.len()`.
///
/// # Safety
/// `ptr` must point at a segment [`init_segment`] has already initialized.
pub unsafe fn fuzzer_recv_status(ptr: *mut u8, buf: &mut [u8]) -> bool {
	let seg = ptr as *mut Segment;
	if !sem_wait_retrying(&mut (*seg).status_channel.semaphore) {
		return false;
	}
	if (*seg).status_channel.message_size != buf.len() {
		return false;
	}
	std::ptr::copy_nonoverlapping((*seg).status_channel.message.as_ptr(), buf.as_mut_ptr(), buf.len());
	true
}
