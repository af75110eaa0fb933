use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, Pid};
use tracing::debug;

use crate::search;

pub const NO_JOB: u32 = 0;

// Read from signal handlers: every field is a single atomic word.
static SHELL_PID: AtomicI32 = AtomicI32::new(0);
static SHELL_PGID: AtomicI32 = AtomicI32::new(0);
static FOREGROUND_JOB: AtomicU32 = AtomicU32::new(NO_JOB);
static NEXT_JOB: AtomicU32 = AtomicU32::new(1);

pub fn shell_pid() -> Pid {
	Pid::from_raw(SHELL_PID.load(Ordering::SeqCst))
}

pub fn shell_pgid() -> Pid {
	Pid::from_raw(SHELL_PGID.load(Ordering::SeqCst))
}

pub fn foreground_job() -> u32 {
	FOREGROUND_JOB.load(Ordering::SeqCst)
}

pub fn set_foreground_job(id: u32) {
	FOREGROUND_JOB.store(id, Ordering::SeqCst);
}

pub fn clear_foreground_job() {
	FOREGROUND_JOB.store(NO_JOB, Ordering::SeqCst);
}

pub fn next_job_id() -> u32 {
	loop {
		let id = NEXT_JOB.fetch_add(1, Ordering::SeqCst);
		if id != NO_JOB {
			return id;
		}
	}
}

/// Records the shell's identity and makes it the leader of its own process
/// group, so that a group-wide hangup never escapes to the shell's parent.
pub fn init_identity() -> nix::Result<()> {
	let pid = unistd::getpid();
	if unistd::getpgrp() != pid {
		unistd::setpgid(pid, pid)?;
		if io::stdin().is_terminal() {
			// A fresh group is not the terminal's foreground group yet; tcsetpgrp would stop us.
			let prev = unsafe { signal::signal(Signal::SIGTTOU, SigHandler::SigIgn) }?;
			let r = unistd::tcsetpgrp(io::stdin(), pid);
			unsafe { signal::signal(Signal::SIGTTOU, prev) }?;
			r?;
		}
	}
	record_identity(pid, unistd::getpgrp());
	debug!(pid = pid.as_raw(), pgid = shell_pgid().as_raw(), "shell identity");
	Ok(())
}

pub fn record_identity(pid: Pid, pgid: Pid) {
	SHELL_PID.store(pid.as_raw(), Ordering::SeqCst);
	SHELL_PGID.store(pgid.as_raw(), Ordering::SeqCst);
}

pub struct State {
	pub search_cache: search::SearchCache,
}

impl State {
	pub fn new() -> State {
		let search_cache = search::SearchCache::new();
		State { search_cache: search_cache }
	}
}

impl Default for State {
	fn default() -> State {
		State::new()
	}
}
