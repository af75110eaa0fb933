use std::convert::Infallible;
use std::io::{self, Write};

use nix::errno::Errno;
use nix::unistd::ForkResult;
use thiserror::Error;
use tracing::{debug, info};

use crate::builtin;
use crate::global;
use crate::job::{self, Job, JobBuilder};
use crate::pipeline::{self, BuildError, Plan};
use crate::signal;
use crate::types::Command;

#[derive(Debug, Error)]
pub enum ExecError {
	#[error(transparent)]
	Build(#[from] BuildError),
	#[error("cannot spawn: {0}")]
	Spawn(#[source] nix::Error),
	#[error("cannot wait for job {job}: {source}")]
	Wait { job: u32, #[source] source: nix::Error },
}

pub enum EvalResult {
	Done(job::Status),
	Builtin(job::Status),
	Background(Job),
	Exit,
}

// Forked children may not allocate: argv is laid out before the fork and
// errors go straight to fd 2.
fn write_stderr(parts: &[&[u8]]) {
	for part in parts {
		unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len()) };
	}
}

fn do_exec_stage(plan: &Plan, i: usize) -> nix::Result<Infallible> {
	signal::reset_for_exec(plan.is_background)?;
	plan.wire(i)?;
	plan.stages[i].exec()
}

fn exec_stage(plan: &Plan, i: usize) -> ! {
	let e = match do_exec_stage(plan, i) {
		Ok(never) => match never {},
		Err(e) => e,
	};
	let stage = &plan.stages[i];
	let code = if e == Errno::ENOENT { 127 } else { 126 };
	// A missing program was already reported by the shell's PATH check.
	if code != 127 || stage.found {
		write_stderr(&[b"ish: ", stage.name().as_bytes(), b": ", e.desc().as_bytes(), b"\n"]);
	}
	unsafe { libc::_exit(code) }
}

fn spawn_stages(plan: &Plan, job_builder: &mut JobBuilder) -> Result<(), ExecError> {
	let _blocked = signal::ChildSignalsBlocked::new().map_err(ExecError::Spawn)?;
	for i in 0 .. plan.len() {
		match job_builder.push_fork().map_err(ExecError::Spawn)? {
			ForkResult::Parent { .. } => {},
			ForkResult::Child => exec_stage(plan, i),
		}
	}
	Ok(())
}

fn report_missing(plan: &Plan) {
	let mut stderr = io::stderr();
	for stage in plan.stages.iter().filter(|s| !s.found) {
		let _ = stderr.write_all(b"ish: command not found: ");
		let _ = stderr.write_all(stage.name().as_bytes());
		let _ = stderr.write_all(b"\n");
	}
	let _ = stderr.flush();
}

/// Forks one process per stage, all in the shell's process group. A
/// foreground job is waited on to completion and yields the last stage's
/// status; a background job is handed back unwaited, the SIGCHLD handler
/// reaps it.
pub fn run(state: &global::State, command: &Command) -> Result<EvalResult, ExecError> {
	let plan = pipeline::build(command, &state.search_cache)?;
	report_missing(&plan);

	let mut job_builder = JobBuilder::new(plan.len(), plan.is_background);
	if !plan.is_background {
		global::set_foreground_job(job_builder.id());
	}
	let spawned = spawn_stages(&plan, &mut job_builder);
	// The shell must not keep any pipe end open, or readers never see EOF.
	drop(plan);
	let mut job = job_builder.build();

	if job.is_background {
		spawned?;
		info!(job = job.id, pids = ?job.pids(), "background job started");
		return Ok(EvalResult::Background(job));
	}

	let waited = if job.processes.is_empty() { Err(Errno::ECHILD) } else { job.wait() };
	global::clear_foreground_job();
	spawned?;
	let status = waited.map_err(|e| ExecError::Wait { job: job.id, source: e })?;
	debug!(job = job.id, %status, "foreground job finished");
	Ok(EvalResult::Done(status))
}

fn warn_ignored_by_builtin(command: &Command) {
	if command.input.is_some() || command.output.is_some() || command.is_background {
		let name = String::from_utf8_lossy(command.stages[0].name());
		let _ = writeln!(io::stderr(), "ish: {}: redirects and '&' are ignored by built-ins", name);
	}
}

pub fn eval(state: &mut global::State, command: &Command) -> Result<EvalResult, ExecError> {
	if command.is_simple() {
		if let Some(builtin) = builtin::match_builtin(command.stages[0].name()) {
			warn_ignored_by_builtin(command);
			return Ok(builtin(state, &command.stages[0]));
		}
	}
	run(state, command)
}
