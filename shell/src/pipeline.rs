use std::convert::Infallible;
use std::ffi::{self, CString, OsStr};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;
use thiserror::Error;
use tracing::debug;

use crate::search::SearchCache;
use crate::types::Command;

#[derive(Debug, Error)]
pub enum BuildError {
	#[error("cannot create pipe: {0}")]
	Pipe(#[source] nix::Error),
	#[error("{}: {source}", .path.display())]
	Redirect { path: PathBuf, #[source] source: io::Error },
	#[error("argument contains a nul byte: {0}")]
	Nul(#[from] ffi::NulError),
}

#[derive(Debug)]
pub struct StagePlan {
	argv: Vec<CString>,
	pub found: bool,
	// Null-terminated pointers into `argv`, laid out before the fork.
	exec_argv: Vec<*const libc::c_char>,
}

impl StagePlan {
	fn new(argv: Vec<CString>, found: bool) -> StagePlan {
		let exec_argv = argv.iter().map(|s| s.as_ptr()).chain([ptr::null()]).collect();
		StagePlan { argv: argv, found: found, exec_argv: exec_argv }
	}

	pub fn name(&self) -> &CString {
		&self.argv[0]
	}

	/// Replaces the process image. Touches no allocator, so it is safe in a
	/// freshly forked child.
	pub fn exec(&self) -> nix::Result<Infallible> {
		unsafe { libc::execvp(self.name().as_ptr(), self.exec_argv.as_ptr()) };
		Err(Errno::last())
	}
}

/// Everything a pipeline needs before the first fork: argv for every stage,
/// `pipes[i]` carrying stage `i` into stage `i + 1`, and the opened redirect
/// targets. Dropping the plan closes every descriptor it owns.
#[derive(Debug)]
pub struct Plan {
	pub stages: Vec<StagePlan>,
	pub is_background: bool,
	pipes: Vec<(OwnedFd, OwnedFd)>,
	input: Option<File>,
	output: Option<File>,
}

fn open_input(target: &[u8]) -> Result<File, BuildError> {
	let path = PathBuf::from(OsStr::from_bytes(target));
	File::open(&path).map_err(|e| BuildError::Redirect { path: path, source: e })
}

fn open_output(target: &[u8]) -> Result<File, BuildError> {
	let path = PathBuf::from(OsStr::from_bytes(target));
	OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(0o644)
		.open(&path)
		.map_err(|e| BuildError::Redirect { path: path, source: e })
}

/// Resolves a command into a plan. Redirect targets are opened here, in the
/// shell, so a bad target abandons the pipeline before anything is forked.
/// The output target is truncated last, once nothing else can fail.
pub fn build(command: &Command, search: &SearchCache) -> Result<Plan, BuildError> {
	assert!(!command.stages.is_empty());

	let mut stages = Vec::with_capacity(command.stages.len());
	for stage in &command.stages {
		let argv: Result<Vec<CString>, ffi::NulError> = stage.argv.iter().map(|&s| CString::new(s)).collect();
		stages.push(StagePlan::new(argv?, search.exists(stage.name())));
	}

	let input = command.input.map(open_input).transpose()?;
	let mut pipes = Vec::with_capacity(stages.len() - 1);
	for _ in 1 .. stages.len() {
		pipes.push(unistd::pipe2(OFlag::O_CLOEXEC).map_err(BuildError::Pipe)?);
	}
	let output = command.output.map(open_output).transpose()?;
	debug!(stages = stages.len(), pipes = pipes.len(), "built pipeline plan");

	Ok(Plan { stages: stages, is_background: command.is_background, pipes: pipes, input: input, output: output })
}

impl Plan {
	pub fn len(&self) -> usize {
		self.stages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.stages.is_empty()
	}

	pub fn stdin_of(&self, i: usize) -> Option<RawFd> {
		if i == 0 {
			self.input.as_ref().map(|f| f.as_raw_fd())
		} else {
			Some(self.pipes[i - 1].0.as_raw_fd())
		}
	}

	pub fn stdout_of(&self, i: usize) -> Option<RawFd> {
		if i + 1 == self.len() {
			self.output.as_ref().map(|f| f.as_raw_fd())
		} else {
			Some(self.pipes[i].1.as_raw_fd())
		}
	}

	/// Every descriptor the plan owns. Allocation free, it is walked in
	/// freshly forked children.
	pub fn descriptors(&self) -> impl Iterator<Item = RawFd> + '_ {
		self.pipes.iter()
			.flat_map(|(r, w)| [r.as_raw_fd(), w.as_raw_fd()])
			.chain(self.input.iter().map(|f| f.as_raw_fd()))
			.chain(self.output.iter().map(|f| f.as_raw_fd()))
	}

	/// Child side: moves stage `i`'s ends onto stdin/stdout and closes
	/// every other descriptor of the pipeline, adjacent or not.
	pub fn wire(&self, i: usize) -> nix::Result<()> {
		if let Some(fd) = self.stdin_of(i) {
			unistd::dup2(fd, libc::STDIN_FILENO)?;
		}
		if let Some(fd) = self.stdout_of(i) {
			unistd::dup2(fd, libc::STDOUT_FILENO)?;
		}
		for fd in self.descriptors() {
			if fd > libc::STDERR_FILENO {
				let _ = unistd::close(fd);
			}
		}
		Ok(())
	}
}
