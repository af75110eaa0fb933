use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use ish::eval::{self, EvalResult};
use ish::{global, job, parser, signal};
use nix::unistd;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "ISH_LOG";

fn init_logging() {
	let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.with_target(false)
		.init();
}

fn prompt() -> String {
	let cwd = env::current_dir().unwrap_or_default();
	let mut tail: Vec<_> = cwd.iter().rev().take(2).collect();
	tail.reverse();
	let tail: PathBuf = tail.into_iter().collect();
	format!("ish:{}> ", tail.display())
}

fn finish() {
	job::sweep_untracked();
	let _ = io::stdout().flush();
}

fn main() -> ExitCode {
	init_logging();
	if let Err(e) = global::init_identity() {
		warn!(error = %e, "cannot lead a process group, hangup will reach the parent group");
		global::record_identity(unistd::getpid(), unistd::getpgrp());
	}
	for e in signal::install() {
		eprintln!("ish: {}", e);
	}

	let mut state = global::State::new();
	let mut stdout = io::stdout();
	let stdin = io::stdin();
	let mut stdin_locked = stdin.lock();
	loop {
		job::sweep_untracked();
		let _ = stdout.write_all(prompt().as_bytes());
		let _ = stdout.flush();

		let mut line: Vec<u8> = vec![];
		match stdin_locked.read_until(b'\n', &mut line) {
			Ok(0) => break,
			Ok(_) => {},
			Err(e) => {
				warn!(error = %e, "cannot read input");
				break;
			},
		}
		if parser::is_blank(&line) {
			continue;
		}

		let command = match parser::parse(&line) {
			Ok(command) => command,
			Err(e) => {
				eprintln!("ish: parse error: {}", e);
				continue;
			},
		};
		match eval::eval(&mut state, &command) {
			Ok(EvalResult::Done(status)) => {
				if !status.success() {
					eprintln!("ish: {}", status);
				}
			},
			Ok(EvalResult::Builtin(_)) | Ok(EvalResult::Background(_)) => {},
			Ok(EvalResult::Exit) => {
				debug!("exit requested");
				finish();
				return ExitCode::SUCCESS;
			},
			Err(e) => eprintln!("ish: {}", e),
		}
	}

	debug!("end of input");
	if let Err(e) = signal::broadcast_hangup() {
		warn!(error = %e, "hangup broadcast failed");
	}
	finish();
	ExitCode::SUCCESS
}
