use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, warn};

use crate::global;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum State { Spawned, Completed }

/// How a finished process ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
	Exited(i32),
	Signaled(Signal),
}

impl Status {
	pub fn code(self) -> i32 {
		match self {
			Status::Exited(code) => code,
			Status::Signaled(sig) => 128 + sig as i32,
		}
	}

	pub fn success(self) -> bool {
		self == Status::Exited(0)
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Status::Exited(code) => write!(f, "exit {}", code),
			Status::Signaled(sig) => write!(f, "killed by {}", sig),
		}
	}
}

pub trait WaitStatusExt {
	fn state(self) -> State;
	fn status(self) -> Option<Status>;
}

impl WaitStatusExt for WaitStatus {
	fn state(self) -> State {
		match self {
			WaitStatus::Exited(..) | WaitStatus::Signaled(..) => State::Completed,
			_ => State::Spawned,
		}
	}
	fn status(self) -> Option<Status> {
		match self {
			WaitStatus::Exited(_, code) => Some(Status::Exited(code)),
			WaitStatus::Signaled(_, sig, _) => Some(Status::Signaled(sig)),
			_ => None,
		}
	}
}

const TABLE_SIZE: usize = 128;

/// Live children shared with the SIGCHLD handler. Each slot packs
/// `(job id << 32) | pid` into one word so a reader never sees half an entry.
pub struct ChildTable {
	slots: [AtomicU64; TABLE_SIZE],
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicU64 = AtomicU64::new(0);

pub static CHILDREN: ChildTable = ChildTable { slots: [EMPTY; TABLE_SIZE] };

fn pack(job: u32, pid: Pid) -> u64 {
	(u64::from(job) << 32) | u64::from(pid.as_raw() as u32)
}

fn unpack(entry: u64) -> (u32, Pid) {
	((entry >> 32) as u32, Pid::from_raw(entry as u32 as i32))
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Ticket {
	slot: usize,
	entry: u64,
}

impl ChildTable {
	pub fn register(&self, job: u32, pid: Pid) -> Option<Ticket> {
		let entry = pack(job, pid);
		for (slot, s) in self.slots.iter().enumerate() {
			if s.compare_exchange(0, entry, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
				return Some(Ticket { slot: slot, entry: entry });
			}
		}
		None
	}

	pub fn release(&self, ticket: Ticket) {
		let _ = self.slots[ticket.slot].compare_exchange(ticket.entry, 0, Ordering::SeqCst, Ordering::SeqCst);
	}

	pub fn holds(&self, ticket: Ticket) -> bool {
		self.slots[ticket.slot].load(Ordering::SeqCst) == ticket.entry
	}

	pub fn forget_pid(&self, pid: Pid) {
		for s in self.slots.iter() {
			let entry = s.load(Ordering::SeqCst);
			if entry != 0 && unpack(entry).1 == pid {
				let _ = s.compare_exchange(entry, 0, Ordering::SeqCst, Ordering::SeqCst);
			}
		}
	}

	/// Non-blocking reap of every registered child outside `foreground`.
	/// Runs inside the SIGCHLD handler: no allocation, no locks, no blocking.
	pub fn reap_except(&self, foreground: u32) {
		for s in self.slots.iter() {
			let entry = s.load(Ordering::SeqCst);
			if entry == 0 {
				continue;
			}
			let (job, pid) = unpack(entry);
			if job == foreground {
				continue;
			}
			match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
				Ok(WaitStatus::Stopped(..)) => {
					// Still unreaped, so the pid cannot have been recycled.
					let _ = signal::kill(pid, Signal::SIGKILL);
				},
				Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
					let _ = s.compare_exchange(entry, 0, Ordering::SeqCst, Ordering::SeqCst);
				},
				_ => {},
			}
		}
	}
}

/// Reaps children that never made it into the table. Main loop only, never
/// while a foreground job is being waited on.
pub fn sweep_untracked() {
	loop {
		match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
			Ok(WaitStatus::StillAlive) | Err(_) => break,
			Ok(status) => {
				if let Some(pid) = status.pid() {
					debug!(pid = pid.as_raw(), ?status, "swept child");
					CHILDREN.forget_pid(pid);
				}
			},
		}
	}
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Process {
	pub pid: Pid,
	pub status: WaitStatus,
	ticket: Option<Ticket>,
}

impl Process {
	pub fn is_reaped(&self) -> bool {
		if self.status.state() == State::Completed {
			return true;
		}
		match self.ticket {
			Some(ticket) => !CHILDREN.holds(ticket),
			None => false,
		}
	}
}

#[derive(Debug)]
pub struct Job {
	pub id: u32,
	pub pgid: Pid,
	pub is_background: bool,
	pub processes: Vec<Process>,
}

impl Job {
	pub fn state(&self) -> State {
		if self.processes.iter().all(|pr| pr.is_reaped()) {
			State::Completed
		} else {
			State::Spawned
		}
	}

	pub fn pids(&self) -> Vec<Pid> {
		self.processes.iter().map(|pr| pr.pid).collect()
	}

	/// Blocking wait on every member, left to right. The combined status is
	/// the last stage's status.
	pub fn wait(&mut self) -> nix::Result<Status> {
		let mut first_error = None;
		for pr in self.processes.iter_mut() {
			loop {
				match wait::waitpid(pr.pid, None) {
					Ok(status) if status.state() == State::Completed => {
						pr.status = status;
						break;
					},
					Ok(_) | Err(Errno::EINTR) => continue,
					Err(e) => {
						warn!(pid = pr.pid.as_raw(), error = %e, "wait failed");
						first_error.get_or_insert(e);
						break;
					},
				}
			}
			if let Some(ticket) = pr.ticket.take() {
				CHILDREN.release(ticket);
			}
		}
		match self.processes.last().and_then(|pr| pr.status.status()) {
			Some(status) => Ok(status),
			None => Err(first_error.unwrap_or(Errno::ECHILD)),
		}
	}
}

#[derive(Debug)]
pub struct JobBuilder {
	imp: Job,
}

impl JobBuilder {
	pub fn new(size_hint: usize, is_background: bool) -> JobBuilder {
		JobBuilder {
			imp: Job {
				id: global::next_job_id(),
				pgid: global::shell_pgid(),
				is_background: is_background,
				processes: Vec::with_capacity(size_hint),
			}
		}
	}

	pub fn id(&self) -> u32 {
		self.imp.id
	}

	pub fn is_empty(&self) -> bool {
		self.imp.processes.is_empty()
	}

	/// Forks one member. Stays in the shell's process group so terminal
	/// interrupts and the exit hangup reach it. The caller blocks SIGCHLD
	/// around this so the handler cannot race the registration.
	pub fn push_fork(&mut self) -> nix::Result<ForkResult> {
		let r = unsafe { unistd::fork() }?;
		if let ForkResult::Parent { child } = r {
			let ticket = CHILDREN.register(self.imp.id, child);
			if ticket.is_none() {
				warn!(pid = child.as_raw(), "child table full, leaving process to the sweep");
			}
			debug!(job = self.imp.id, pid = child.as_raw(), "spawned");
			self.imp.processes.push(Process { pid: child, status: WaitStatus::StillAlive, ticket: ticket });
		}
		Ok(r)
	}

	pub fn build(self) -> Job {
		self.imp
	}
}
