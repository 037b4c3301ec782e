//! Persistent mode: an in-process loop body run many times per cloned
//! child. A periodic interval timer and a set of fatal-signal handlers
//! translate in-loop hangs and crashes into status reports without a round
//! trip through the parent.
//!
//! Signal handlers are installed with a full mask for the duration of their
//! own invocation, so two concurrent fatal signals can't interleave an IPC
//! write.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::time::{TimeSpec, TimeValLike};

use crate::forkserver;
use crate::ipc;
use crate::process::{self, ExitDisposition};
use crate::protocol::{ForkserverCommand, ForkserverStatus, Mode};
use crate::utils::{self, ErrorSource};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
enum State {
	Init = 0,
	Iter = 1,
	Stop = 2,
}

static STATE: AtomicU8 = AtomicU8::new(State::Init as u8);
static ITERATIONS: AtomicU64 = AtomicU64::new(0);
static TIMEOUT_MS: AtomicI32 = AtomicI32::new(0);
static START_TIME_NANOS: AtomicI64 = AtomicI64::new(0);

fn state() -> State {
	match STATE.load(Ordering::Relaxed) {
		1 => State::Iter,
		2 => State::Stop,
		_ => State::Init,
	}
}

fn set_state(state: State) {
	STATE.store(state as u8, Ordering::Relaxed);
}

fn record_start_time() {
	START_TIME_NANOS.store(utils::monotonic_now().num_nanoseconds(), Ordering::Relaxed);
}

fn decrement_iterations() {
	// Saturating: `iterations == 0` on entry already short-circuits the
	// caller, this just guards the same race `fetch_sub` alone wouldn't.
	let _ = ITERATIONS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
}

/// Entry point for persistent mode: called in a loop by the user program.
/// Returns `true` when the loop body should run once more, `false` when it
/// must end. Backed by a three-state per-process machine: the parent never
/// leaves `Init`, a forked child moves to `Iter` on its first return and
/// stays there until its iteration budget or the fuzzer ends the run.
pub fn spawn_persistent_loop(iterations: u64) -> bool {
	if iterations == 0 {
		return false;
	}
	if crate::STARTED.load(Ordering::SeqCst) && state() == State::Init {
		return false;
	}

	match state() {
		State::Init => run_parent(iterations),
		State::Iter => run_iteration(),
		State::Stop => false,
	}
}

fn run_parent(iterations: u64) -> bool {
	let config = match forkserver::handshake(Mode::Persistent) {
		Some(config) => config,
		None => {
			// Standalone: allow exactly one stdin-driven run, then stop.
			set_state(State::Stop);
			return true;
		}
	};

	install_signal_handlers();
	TIMEOUT_MS.store(config.timeout_ms, Ordering::Relaxed);
	ITERATIONS.store(iterations, Ordering::Relaxed);
	crate::STARTED.store(true, Ordering::SeqCst);
	log::info!(
		"persistent: handshake complete, iterations={}, timeout_ms={}",
		iterations,
		config.timeout_ms
	);

	let mut child: Option<process::ChildHandle> = None;
	loop {
		match ipc::recv_command() {
			ForkserverCommand::Stop => {
				if let Some(child) = child {
					child.signal(Signal::SIGKILL);
					let _ = nix::sys::wait::waitpid(child.pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG));
				}
				log::info!("persistent: STOP received, exiting");
				ipc::cleanup();
				crate::input::cleanup();
				std::process::exit(0);
			}
			ForkserverCommand::Run => {
				match process::fork(ErrorSource::Persistent, "Could not fork") {
					process::ForkResult::Child => {
						set_state(State::Iter);
						decrement_iterations();
						record_start_time();
						arm_timer(config.timeout_ms);
						return true;
					}
					process::ForkResult::Parent(handle) => {
						child = Some(handle);
						let disposition = handle.wait(ErrorSource::Persistent);
						// A child `SIGKILL`ed by its own timeout/crash handler
						// has already sent its own status byte; don't send a
						// second one for the same iteration.
						if !matches!(disposition, ExitDisposition::Signaled(Signal::SIGKILL)) {
							let status = forkserver::convert_status(&config, disposition);
							ipc::send_status(status as u8);
						}
						child = None;
					}
				}
			}
		}
	}
}

fn run_iteration() -> bool {
	if ITERATIONS.load(Ordering::Relaxed) == 0 {
		set_state(State::Stop);
		return false;
	}

	ipc::send_status(ForkserverStatus::Exit as u8);
	decrement_iterations();

	match ipc::recv_command() {
		ForkserverCommand::Stop => {
			set_state(State::Stop);
			false
		}
		ForkserverCommand::Run => {
			record_start_time();
			true
		}
	}
}

/// Arms (or, for `timeout_ms == 0`, deliberately leaves disarmed) a periodic
/// `SIGALRM` at `max(timeout_ms, 1000 ms)`. The handler polls actual elapsed
/// time against `timeout_ms`, so sub-second budgets still work with a
/// coarser-than-budget tick.
fn arm_timer(timeout_ms: i32) {
	if timeout_ms == 0 {
		return;
	}
	let mut secs = timeout_ms / 1000;
	let mut usecs = (timeout_ms % 1000) * 1000;
	if secs == 0 {
		secs = 1;
		usecs = 0;
	}
	let value = libc::timeval {
		tv_sec: secs as libc::time_t,
		tv_usec: usecs as libc::suseconds_t,
	};
	let interval = libc::itimerval {
		it_interval: value,
		it_value: value,
	};
	if unsafe { libc::setitimer(libc::ITIMER_REAL, &interval, std::ptr::null_mut()) } != 0 {
		utils::panic(ErrorSource::Persistent, "Could not arm persistent-mode timer");
	}
}

const HANDLED_SIGNALS: [Signal; 9] = [
	Signal::SIGALRM,
	Signal::SIGBUS,
	Signal::SIGABRT,
	Signal::SIGILL,
	Signal::SIGFPE,
	Signal::SIGSEGV,
	Signal::SIGTRAP,
	Signal::SIGINT,
	Signal::SIGTERM,
];

fn install_signal_handlers() {
	// Each handler blocks the rest of this set for the duration of its own
	// invocation so two concurrent fatal signals can't interleave an IPC
	// write; see the crate's design notes on async-signal-safe reporting.
	let mut full_mask = SigSet::empty();
	for signal in HANDLED_SIGNALS {
		full_mask.add(signal);
	}

	let timeout_action = SigAction::new(SigHandler::Handler(on_timeout), SaFlags::empty(), full_mask);
	let crash_action = SigAction::new(SigHandler::Handler(on_crash), SaFlags::empty(), full_mask);
	let interrupt_action = SigAction::new(SigHandler::Handler(on_interrupt), SaFlags::empty(), full_mask);

	let install = |signal: Signal, action: &SigAction| unsafe {
		signal::sigaction(signal, action)
			.unwrap_or_else(|_| utils::panic(ErrorSource::Persistent, "Could not install signal handler"));
	};

	install(Signal::SIGALRM, &timeout_action);
	for signal in [
		Signal::SIGBUS,
		Signal::SIGABRT,
		Signal::SIGILL,
		Signal::SIGFPE,
		Signal::SIGSEGV,
		Signal::SIGTRAP,
	] {
		install(signal, &crash_action);
	}
	for signal in [Signal::SIGINT, Signal::SIGTERM] {
		install(signal, &interrupt_action);
	}

	let mut unblock = SigSet::empty();
	for signal in HANDLED_SIGNALS {
		unblock.add(signal);
	}
	signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)
		.unwrap_or_else(|_| utils::panic(ErrorSource::Persistent, "Could not unblock persistent-mode signals"));
}

/// Sends `status` if a fuzzer is attached, then terminates the process.
/// Never returns; a repeated `SIGKILL` covers the (practically impossible)
/// case where the first delivery doesn't immediately end the process.
fn report_and_die(status: ForkserverStatus) -> ! {
	if ipc::is_attached() {
		ipc::send_status_signal_safe(status as u8);
	}
	loop {
		unsafe {
			libc::raise(libc::SIGKILL);
		}
	}
}

extern "C" fn on_timeout(_signum: libc::c_int) {
	let start = TimeSpec::nanoseconds(START_TIME_NANOS.load(Ordering::Relaxed));
	let now = utils::monotonic_now();
	let elapsed_ms = utils::duration_ms(start, now);
	let timeout_ms = TIMEOUT_MS.load(Ordering::Relaxed).max(0) as u64;
	if elapsed_ms + 100 >= timeout_ms {
		report_and_die(ForkserverStatus::Timeout);
	}
}

extern "C" fn on_crash(_signum: libc::c_int) {
	report_and_die(ForkserverStatus::Crash);
}

extern "C" fn on_interrupt(_signum: libc::c_int) {
	report_and_die(ForkserverStatus::Exit);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_iterations_is_a_no_op() {
		assert!(!spawn_persistent_loop(0));
	}

	#[test]
	fn state_round_trips_through_u8() {
		for state in [State::Init, State::Iter, State::Stop] {
			set_state(state);
			assert_eq!(super::state(), state);
		}
		// Leave the shared static as found for any other test in this binary.
		set_state(State::Init);
	}
}
