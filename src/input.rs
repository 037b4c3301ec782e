//! Delivers the per-run fuzz input: a shared-memory segment attached from
//! the fuzzer, or — when no fuzzer is present — a one-shot slurp of
//! standard input into an anonymous mapping with the same layout. Either
//! way the region starts with a `length` header immediately followed by the
//! data bytes; pointers handed back to callers point past the header.

use std::env;
use std::sync::Mutex;

use crate::error::RuntimeError;
use crate::utils::{self, ErrorSource};

const FUZZ_INPUT_SHM_VAR: &str = "__FUZZ_INPUT_SHM";

#[repr(C)]
struct Header {
	length: usize,
}

struct Inner {
	/// Points at the region's `Header`; `data` begins immediately after it.
	base: *mut u8,
	/// Total bytes mapped/attached, including the header.
	capacity: usize,
	/// Upper bound the fuzzer may ever set `length` to, when known.
	max_len: Option<usize>,
	is_stdin: bool,
	cursor: usize,
}

// `base` is a raw pointer into a region this process owns (mmap) or has
// attached (shmat); it is only ever touched behind `STATE`'s mutex, and
// input access never happens from a signal handler, so this is sound.
unsafe impl Send for Inner {}

static STATE: Mutex<Option<Inner>> = Mutex::new(None);

fn page_size() -> usize {
	let r = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	if r > 0 {
		r as usize
	} else {
		4096
	}
}

fn header(base: *mut u8) -> *mut Header {
	base as *mut Header
}

fn data_ptr(base: *mut u8) -> *mut u8 {
	unsafe { base.add(std::mem::size_of::<Header>()) }
}

fn read_length(base: *mut u8) -> usize {
	unsafe { (*header(base)).length }
}

/// Reads all of stdin into a growable anonymous mapping, page at a time,
/// stopping at the first short read.
fn consume_stdin() -> Inner {
	let page = page_size();
	let header_len = std::mem::size_of::<Header>();
	let mut mapped = header_len + page;

	let mut base = unsafe {
		libc::mmap(
			std::ptr::null_mut(),
			mapped,
			libc::PROT_READ | libc::PROT_WRITE,
			libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
			-1,
			0,
		)
	};
	if base == libc::MAP_FAILED {
		utils::panic(ErrorSource::FuzzInput, "Could not mmap");
	}

	let mut filled = header_len;
	loop {
		let dest = unsafe { (base as *mut u8).add(filled) };
		let want = mapped - filled;
		let r = unsafe { libc::read(0, dest as *mut libc::c_void, want) };
		if r < 0 {
			utils::panic(ErrorSource::FuzzInput, "Cannot read from stdin");
		}
		let r = r as usize;
		filled += r;
		if r < want {
			break;
		}
		mapped += page;
		let new_base = unsafe { libc::mremap(base, mapped - page, mapped, libc::MREMAP_MAYMOVE) };
		if new_base == libc::MAP_FAILED {
			utils::panic(ErrorSource::FuzzInput, "Could not mremap");
		}
		base = new_base;
	}

	let length = filled - header_len;
	unsafe {
		(*header(base as *mut u8)).length = length;
	}
	Inner {
		base: base as *mut u8,
		capacity: mapped,
		max_len: None,
		is_stdin: true,
		cursor: 0,
	}
}

fn attach_shm(id: i32) -> Result<Inner, RuntimeError> {
	let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
	if ptr.is_null() || ptr as isize == -1 {
		return Err(RuntimeError::ShmAttach { id });
	}
	let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
	let capacity = if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } == 0 {
		ds.shm_segsz as usize
	} else {
		std::mem::size_of::<Header>()
	};
	Ok(Inner {
		base: ptr as *mut u8,
		capacity,
		max_len: Some(capacity.saturating_sub(std::mem::size_of::<Header>())),
		is_stdin: false,
		cursor: 0,
	})
}

fn ensure_attached(guard: &mut Option<Inner>) -> Result<(), RuntimeError> {
	if guard.is_some() {
		return Ok(());
	}
	let inner = if let Ok(value) = env::var(FUZZ_INPUT_SHM_VAR) {
		let id: i32 = value
			.parse()
			.unwrap_or_else(|_| utils::panic(ErrorSource::FuzzInput, "Invalid fuzz input shm id"));
		attach_shm(id)?
	} else {
		consume_stdin()
	};
	*guard = Some(inner);
	Ok(())
}

/// Attaches the input region if it isn't already: shared memory named by
/// `__FUZZ_INPUT_SHM`, or a one-shot slurp of standard input. Idempotent —
/// a call after a successful attach is a no-op. Every other accessor in this
/// module goes through this on first use, so callers never have to invoke it
/// directly unless they want to observe or handle the attach failure
/// themselves instead of letting it panic.
pub(crate) fn attach() -> Result<(), RuntimeError> {
	let mut guard = STATE.lock().unwrap();
	ensure_attached(&mut guard)
}

fn with_inner<T>(f: impl FnOnce(&mut Inner) -> T) -> T {
	let mut guard = STATE.lock().unwrap();
	ensure_attached(&mut guard).unwrap_or_else(|err| utils::panic(ErrorSource::FuzzInput, &err.to_string()));
	f(guard.as_mut().unwrap())
}

/// Stable pointer to the first byte of the current input, or `None` when
/// the input is zero-length.
pub fn ptr() -> Option<*const u8> {
	with_inner(|inner| {
		if read_length(inner.base) == 0 {
			None
		} else {
			Some(data_ptr(inner.base) as *const u8)
		}
	})
}

/// Number of valid bytes in the current input.
pub fn len() -> usize {
	with_inner(|inner| read_length(inner.base))
}

/// Maximum input length the fuzzer may supply, when that's knowable (shared
/// memory only; the stdin fallback has no such bound).
pub fn max_len() -> Option<usize> {
	with_inner(|inner| inner.max_len)
}

/// Page-aligned byte size of the backing region, informational.
pub fn capacity() -> usize {
	with_inner(|inner| inner.capacity)
}

/// Advances a cursor into the input by `min(n, remaining)`, returning the
/// prior cursor position and the number of bytes actually consumed.
///
/// Resolves an ambiguity in the documented source: consuming `n` bytes that
/// fit within what remains must advance the cursor by exactly `n`, not by
/// the full remaining length — the latter would make every `consume` call
/// after the first one return zero bytes.
pub fn consume(n: usize) -> (usize, usize) {
	with_inner(|inner| {
		let length = read_length(inner.base);
		let (prior, taken, cursor) = advance_cursor(inner.cursor, length, n);
		inner.cursor = cursor;
		(prior, taken)
	})
}

/// Pure cursor arithmetic for [`consume`], split out so it's testable
/// without going through the process-global input singleton.
fn advance_cursor(cursor: usize, length: usize, n: usize) -> (usize, usize, usize) {
	let remaining = length.saturating_sub(cursor);
	let taken = n.min(remaining);
	let new_cursor = cursor.saturating_add(taken).min(length);
	(cursor, taken, new_cursor)
}

/// Detaches or unmaps the region, but only when it's the process-private
/// standard-input fallback. Shared segments attached from the fuzzer are
/// left attached — detaching them buys nothing since the fuzzer owns their
/// lifetime, and re-attaching on the next fork would be wasted work.
pub fn cleanup() {
	let mut guard = STATE.lock().unwrap();
	if let Some(inner) = guard.take() {
		if inner.is_stdin {
			unsafe {
				libc::munmap(inner.base as *mut libc::c_void, inner.capacity);
			}
		} else {
			*guard = Some(inner);
		}
	}
}
