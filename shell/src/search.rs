use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::{env, fs, io};

use tracing::debug;

/// Program names found in `$PATH`, first directory wins. Only used to warn
/// about missing commands; `execvp` does the real resolution.
pub struct SearchCache {
	imp: HashMap<OsString, PathBuf>
}

const PATH_KEY: &str = "PATH";

fn is_executable(path: &Path) -> bool {
	match fs::metadata(path) {
		Ok(m) => m.is_file() && m.permissions().mode() & 0o111 != 0,
		Err(_) => false,
	}
}

impl SearchCache {
	pub fn new() -> SearchCache {
		let mut this = SearchCache { imp: HashMap::new() };
		this.rehash();
		this
	}

	fn add_entry(&mut self, entry: io::Result<fs::DirEntry>) -> io::Result<()> {
		let e = entry?;
		let path = e.path();
		if is_executable(&path) {
			self.imp.entry(e.file_name()).or_insert(path);
		}
		Ok(())
	}

	pub fn rehash(&mut self) {
		self.imp.clear();
		if let Some(paths) = env::var_os(PATH_KEY) {
			self.rehash_from(&paths);
		}
		debug!(entries = self.imp.len(), "rehashed PATH");
	}

	pub fn rehash_from(&mut self, paths: &OsStr) {
		for path in env::split_paths(paths) {
			if let Ok(entries) = fs::read_dir(path) {
				for entry in entries {
					let _ = self.add_entry(entry);
				}
			}
		}
	}

	pub fn lookup(&self, name: &[u8]) -> Option<&Path> {
		self.imp.get(OsStr::from_bytes(name)).map(|p| p.as_path())
	}

	pub fn exists(&self, name: &[u8]) -> bool {
		if name.contains(&b'/') {
			is_executable(Path::new(OsStr::from_bytes(name)))
		} else {
			self.lookup(name).is_some()
		}
	}
}

impl Default for SearchCache {
	fn default() -> SearchCache {
		SearchCache::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::unix::ffi::OsStrExt;
	use std::os::unix::fs::PermissionsExt;

	fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
		let path = dir.join(name);
		fs::write(&path, b"#!/bin/sh\n").unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
		path
	}

	#[test]
	fn first_directory_wins() {
		let a = tempfile::tempdir().unwrap();
		let b = tempfile::tempdir().unwrap();
		let first = touch(a.path(), "tool", 0o755);
		touch(b.path(), "tool", 0o755);
		touch(b.path(), "other", 0o755);

		let mut cache = SearchCache { imp: HashMap::new() };
		cache.rehash_from(&env::join_paths([a.path(), b.path()]).unwrap());
		assert_eq!(cache.lookup(b"tool"), Some(first.as_path()));
		assert!(cache.exists(b"other"));
		assert!(!cache.exists(b"missing"));
	}

	#[test]
	fn skips_non_executables() {
		let a = tempfile::tempdir().unwrap();
		touch(a.path(), "data", 0o644);
		let mut cache = SearchCache { imp: HashMap::new() };
		cache.rehash_from(a.path().as_os_str());
		assert!(!cache.exists(b"data"));
	}

	#[test]
	fn slash_names_are_checked_directly() {
		let a = tempfile::tempdir().unwrap();
		let tool = touch(a.path(), "tool", 0o755);
		let cache = SearchCache { imp: HashMap::new() };
		assert!(cache.exists(tool.as_os_str().as_bytes()));
		assert!(!cache.exists(b"/does/not/exist"));
	}
}
