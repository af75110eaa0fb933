use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use thiserror::Error;
use tracing::{debug, warn};

use crate::global;
use crate::job;

#[derive(Debug, Error)]
#[error("cannot install {signal} disposition: {source}")]
pub struct SignalError {
	pub signal: Signal,
	#[source]
	pub source: nix::Error,
}

// The terminal sends this to the whole group. Foreground children die by
// their default disposition; the shell only moves past the prompt line.
extern "C" fn handle_sigint(_: libc::c_int) {
	let nl = b"\n";
	unsafe { libc::write(libc::STDOUT_FILENO, nl.as_ptr().cast(), nl.len()) };
}

extern "C" fn handle_sigchld(_: libc::c_int) {
	let saved = Errno::last_raw();
	job::CHILDREN.reap_except(global::foreground_job());
	Errno::set_raw(saved);
}

fn install_one(sig: Signal, handler: SigHandler) -> Result<(), SignalError> {
	let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
	unsafe { signal::sigaction(sig, &action) }
		.map(|_| ())
		.map_err(|e| SignalError { signal: sig, source: e })
}

/// Installs the shell's dispositions: interrupt survives, child changes are
/// reaped asynchronously, hangup is ignored. Failures are returned rather
/// than aborting so the shell can run with degraded signal behaviour.
pub fn install() -> Vec<SignalError> {
	let dispositions = [
		(Signal::SIGINT, SigHandler::Handler(handle_sigint)),
		(Signal::SIGCHLD, SigHandler::Handler(handle_sigchld)),
		(Signal::SIGHUP, SigHandler::SigIgn),
	];
	let mut errors = vec![];
	for (sig, handler) in dispositions {
		match install_one(sig, handler) {
			Ok(()) => debug!(signal = %sig, "installed disposition"),
			Err(e) => {
				warn!(signal = %sig, error = %e.source, "signal setup degraded");
				errors.push(e);
			},
		}
	}
	errors
}

fn sigchld_set() -> SigSet {
	let mut set = SigSet::empty();
	set.add(Signal::SIGCHLD);
	set
}

/// Holds SIGCHLD back while children are being forked and registered.
/// Pending notifications are delivered when the guard is dropped.
pub struct ChildSignalsBlocked {
	old: SigSet,
}

impl ChildSignalsBlocked {
	pub fn new() -> nix::Result<ChildSignalsBlocked> {
		let mut old = SigSet::empty();
		signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigchld_set()), Some(&mut old))?;
		Ok(ChildSignalsBlocked { old: old })
	}
}

impl Drop for ChildSignalsBlocked {
	fn drop(&mut self) {
		let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.old), None);
	}
}

/// Child side, right before exec: a background stage ignores the terminal
/// interrupt, every stage dies on hangup, and nothing the shell masked or
/// ignored leaks into the new image.
pub fn reset_for_exec(is_background: bool) -> nix::Result<()> {
	let int = if is_background { SigHandler::SigIgn } else { SigHandler::SigDfl };
	unsafe {
		signal::signal(Signal::SIGINT, int)?;
		signal::signal(Signal::SIGHUP, SigHandler::SigDfl)?;
		signal::signal(Signal::SIGCHLD, SigHandler::SigDfl)?;
		signal::signal(Signal::SIGTTOU, SigHandler::SigDfl)?;
	}
	signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&sigchld_set()), None)
}

/// Hangs up the shell's whole process group. The shell itself ignores SIGHUP.
pub fn broadcast_hangup() -> nix::Result<()> {
	let pgid = global::shell_pgid();
	debug!(shell = global::shell_pid().as_raw(), pgid = pgid.as_raw(), "broadcasting hangup");
	signal::killpg(pgid, Signal::SIGHUP)
}
