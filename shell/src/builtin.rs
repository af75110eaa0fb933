use std::env;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::eval::EvalResult;
use crate::global;
use crate::job::Status;
use crate::signal;
use crate::types::Stage;

pub type Builtin = fn(&mut global::State, &Stage) -> EvalResult;

pub fn builtin_cd(_: &mut global::State, stage: &Stage) -> EvalResult {
	let target = match stage.arguments().first() {
		Some(dir) => PathBuf::from(OsStr::from_bytes(dir)),
		None => match env::var_os("HOME") {
			Some(home) => PathBuf::from(home),
			None => {
				let _ = writeln!(io::stderr(), "cd: HOME not set");
				return EvalResult::Builtin(Status::Exited(1));
			},
		},
	};
	match env::set_current_dir(&target) {
		Ok(()) => {
			debug!(dir = %target.display(), "changed directory");
			EvalResult::Builtin(Status::Exited(0))
		},
		Err(e) => {
			let _ = writeln!(io::stderr(), "cd: {}: {}", target.display(), e);
			EvalResult::Builtin(Status::Exited(1))
		},
	}
}

pub fn builtin_exit(_: &mut global::State, _: &Stage) -> EvalResult {
	if let Err(e) = signal::broadcast_hangup() {
		warn!(error = %e, "hangup broadcast failed");
	}
	EvalResult::Exit
}

pub fn builtin_rehash(state: &mut global::State, _: &Stage) -> EvalResult {
	state.search_cache.rehash();
	EvalResult::Builtin(Status::Exited(0))
}

pub fn match_builtin(name: &[u8]) -> Option<Builtin> {
	match name {
		b"cd" => Some(builtin_cd),
		b"exit" => Some(builtin_exit),
		b"rehash" => Some(builtin_rehash),
		_ => None,
	}
}
