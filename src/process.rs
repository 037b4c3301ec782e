//! A thin `fork()` wrapper: no process-descriptor (FreeBSD pdfork) support,
//! no daemonizing or orphan handling, just "clone this process, tell me
//! which side I ended up on" plus the waitpid bookkeeping the forkserver and
//! persistent loops both need.

use nix::sys::signal::Signal;
use nix::sys::wait::{self, WaitStatus as NixWaitStatus};
use nix::unistd::{self, Pid};

use crate::utils::{self, ErrorSource};

/// Which side of a `fork()` this process ended up on.
#[derive(Debug)]
pub enum ForkResult {
	Parent(ChildHandle),
	Child,
}

/// A handle to a forked child, usable to signal and wait on it.
#[derive(Clone, Copy, Debug)]
pub struct ChildHandle {
	pub pid: Pid,
}

/// The disposition a waited-on child terminated with.
#[derive(Clone, Copy, Debug)]
pub enum ExitDisposition {
	Exited(i32),
	Signaled(Signal),
}

impl ChildHandle {
	pub fn signal(&self, signal: Signal) {
		// ESRCH races harmlessly with the parent's own waitpid reaping the
		// same child; any other failure means something is badly wrong.
		match nix::sys::signal::kill(self.pid, signal) {
			Ok(()) | Err(nix::Error::ESRCH) => {}
			Err(_) => utils::panic(ErrorSource::Forkserver, "Could not signal child"),
		}
	}

	/// Blocking `waitpid` for exactly this child, retrying on `EINTR`.
	pub fn wait(&self, source: ErrorSource) -> ExitDisposition {
		loop {
			match wait::waitpid(self.pid, None) {
				Ok(NixWaitStatus::Exited(_pid, code)) => return ExitDisposition::Exited(code),
				Ok(NixWaitStatus::Signaled(_pid, signal, _core_dumped)) => {
					return ExitDisposition::Signaled(signal);
				}
				Ok(_) => continue,
				Err(nix::Error::EINTR) => continue,
				Err(_) => utils::panic(source, "Waitpid returned an invalid disposition"),
			}
		}
	}
}

/// Forks the process. `message` is the panic message used if the underlying
/// `fork(2)` syscall itself fails (not if the child later fails).
pub fn fork(source: ErrorSource, message: &'static str) -> ForkResult {
	match unsafe { unistd::fork() } {
		Ok(unistd::ForkResult::Child) => ForkResult::Child,
		Ok(unistd::ForkResult::Parent { child }) => ForkResult::Parent(ChildHandle { pid: child }),
		Err(_) => utils::panic(source, message),
	}
}
