//! Panic reporting and small timing helpers shared by every subsystem.

use std::fmt;
use std::io::Write;

use nix::sys::time::{TimeSpec, TimeValLike};
use nix::time::{self, ClockId};

/// Which subsystem a fatal error originated in, used only to tag the message
/// `panic` prints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorSource {
	Forkserver,
	Persistent,
	FuzzInput,
	Ipc,
}

impl fmt::Display for ErrorSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ErrorSource::Forkserver => "Forkserver",
			ErrorSource::Persistent => "Persistent mode",
			ErrorSource::FuzzInput => "Fuzz input",
			ErrorSource::Ipc => "IPC",
		})
	}
}

/// Emits a tagged failure message, flushes stderr, best-effort releases the
/// IPC and input resources, then aborts. Never returns.
///
/// This is the runtime's only error path for conditions that can't be
/// recovered from (a broken handshake, a bad waitpid disposition, a signal
/// that can't be installed): the target is linked into someone else's
/// process and the only safe thing left to do is stop it.
pub fn panic(source: ErrorSource, message: &str) -> ! {
	let errno = std::io::Error::last_os_error();
	log::error!("{source} runtime failure: {message} (errno=\"{errno}\")");
	let _ = writeln!(
		std::io::stderr(),
		"{source} runtime failure: {message} (errno=\"{errno}\")"
	);
	let _ = std::io::stderr().flush();

	crate::ipc::cleanup();
	crate::input::cleanup();

	// abort(), not process::exit(): a panic here means the runtime's own
	// invariants are already broken, so destructors are not trustworthy.
	std::process::abort();
}

/// Reads the monotonic clock. Calls `clock_gettime` directly, which is
/// async-signal-safe, so this may be called from inside a signal handler.
pub fn monotonic_now() -> TimeSpec {
	time::clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap_or(TimeSpec::new(0, 0))
}

/// Difference between two monotonic timestamps, in whole milliseconds.
/// Saturates to zero rather than underflowing if `end` precedes `start`
/// (clock reads can race with this being called from a signal handler).
pub fn duration_ms(start: TimeSpec, end: TimeSpec) -> u64 {
	let delta_nanos = end.num_nanoseconds() - start.num_nanoseconds();
	u64::try_from(delta_nanos / 1_000_000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duration_ms_normal() {
		let start = TimeSpec::new(10, 500_000_000);
		let end = TimeSpec::new(11, 600_000_000);
		assert_eq!(duration_ms(start, end), 1100);
	}

	#[test]
	fn duration_ms_same_second() {
		let start = TimeSpec::new(10, 100_000_000);
		let end = TimeSpec::new(10, 900_000_000);
		assert_eq!(duration_ms(start, end), 800);
	}

	#[test]
	fn duration_ms_saturates_on_negative_delta() {
		let start = TimeSpec::new(10, 0);
		let end = TimeSpec::new(9, 0);
		assert_eq!(duration_ms(start, end), 0);
	}
}
