use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::pty::openpty;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{self, Pid};

struct IshHandler {
	child: Child,
	stdin: Option<ChildStdin>,
}

struct Finished {
	status: ExitStatus,
	stdout: String,
	stderr: String,
}

fn sleep_little() {
	sleep(Duration::from_millis(400));
}

impl IshHandler {
	fn new(cwd: &Path) -> IshHandler {
		let mut child = Command::new(env!("CARGO_BIN_EXE_ish"))
			.current_dir(cwd)
			.env("ISH_LOG", "warn")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0)
			.spawn()
			.unwrap();
		let stdin = child.stdin.take();
		IshHandler { child: child, stdin: stdin }
	}

	fn pid(&self) -> i32 {
		self.child.id() as i32
	}

	fn send(&mut self, line: &str) {
		let stdin = self.stdin.as_mut().unwrap();
		stdin.write_all(line.as_bytes()).unwrap();
		stdin.write_all(b"\n").unwrap();
		stdin.flush().unwrap();
		sleep_little();
	}

	fn wait(mut self, timeout: Duration) -> Finished {
		drop(self.stdin.take());
		let deadline = Instant::now() + timeout;
		let status = loop {
			if let Some(status) = self.child.try_wait().unwrap() {
				break status;
			}
			if Instant::now() > deadline {
				let _ = self.child.kill();
				let _ = self.child.wait();
				panic!("ish did not terminate within {:?}", timeout);
			}
			sleep(Duration::from_millis(20));
		};
		let mut stdout = String::new();
		let mut stderr = String::new();
		self.child.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
		self.child.stderr.take().unwrap().read_to_string(&mut stderr).unwrap();
		Finished { status: status, stdout: stdout, stderr: stderr }
	}

	fn finish(self) -> Finished {
		self.wait(Duration::from_secs(5))
	}
}

impl Drop for IshHandler {
	fn drop(&mut self) {
		if let Ok(None) = self.child.try_wait() {
			let _ = self.child.kill();
			let _ = self.child.wait();
		}
	}
}

/// `(pid, state)` of every process whose parent is `ppid`.
fn children_of(ppid: i32) -> Vec<(i32, char)> {
	let mut children = vec![];
	for entry in fs::read_dir("/proc").unwrap().flatten() {
		let pid: i32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
			Some(pid) => pid,
			None => continue,
		};
		let stat = match fs::read_to_string(entry.path().join("stat")) {
			Ok(stat) => stat,
			Err(_) => continue,
		};
		let after_comm = match stat.rfind(')') {
			Some(i) => &stat[i + 1 ..],
			None => continue,
		};
		let mut fields = after_comm.split_whitespace();
		let state = fields.next().and_then(|s| s.chars().next()).unwrap_or('?');
		let parent: i32 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
		if parent == ppid {
			children.push((pid, state));
		}
	}
	children
}

fn live_children_of(ppid: i32) -> Vec<i32> {
	children_of(ppid).into_iter().filter(|&(_, state)| state != 'Z').map(|(pid, _)| pid).collect()
}

fn assert_no_zombies(ppid: i32) {
	let zombies: Vec<i32> = children_of(ppid).into_iter().filter(|&(_, state)| state == 'Z').map(|(pid, _)| pid).collect();
	assert!(zombies.is_empty(), "zombie children: {:?}", zombies);
}

fn is_gone(pid: i32) -> bool {
	match fs::read_to_string(format!("/proc/{}/stat", pid)) {
		Err(_) => true,
		Ok(stat) => stat.rfind(')').map_or(false, |i| stat[i + 1 ..].trim_start().starts_with('Z')),
	}
}

#[test]
fn end_of_input_exits_successfully() {
	let dir = tempfile::tempdir().unwrap();
	let out = IshHandler::new(dir.path()).finish();
	assert!(out.status.success());
	assert_eq!(out.stderr, "");
	assert!(out.stdout.starts_with("ish:"));
}

#[test]
fn end_of_input_hangs_up_every_descendant() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("sleep 60 | cat &");
	let descendants = live_children_of(ish.pid());
	assert_eq!(descendants.len(), 2);
	let out = ish.finish();
	assert!(out.status.success());
	sleep_little();
	for pid in descendants {
		assert!(is_gone(pid), "{} survived end of input", pid);
	}
}

#[test]
fn exit_command() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("exit");
	let out = ish.wait(Duration::from_secs(3));
	assert!(out.status.success());
}

#[test]
fn three_stage_pipeline() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("echo hello world | grep hello | wc -w");
	assert_no_zombies(ish.pid());
	let out = ish.finish();
	assert!(out.stdout.contains('2'), "stdout: {}", out.stdout);
}

#[test]
fn input_and_output_redirection() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("echo hello > hello.txt");
	ish.send("grep el < hello.txt > out.txt");
	ish.send("tr a-z A-Z < out.txt");
	let out = ish.finish();
	assert_eq!(fs::read_to_string(dir.path().join("hello.txt")).unwrap(), "hello\n");
	assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello\n");
	assert!(out.stdout.contains("HELLO"));
}

#[test]
fn cd_changes_directory() {
	let parent = tempfile::tempdir().unwrap();
	let target = parent.path().join("inner");
	fs::create_dir(&target).unwrap();
	fs::write(target.join("marker.txt"), b"").unwrap();
	let mut ish = IshHandler::new(parent.path());
	ish.send(&format!("cd {}", target.display()));
	ish.send("ls");
	let out = ish.finish();
	assert!(out.stdout.contains("marker.txt"), "stdout: {}", out.stdout);
}

#[test]
fn cd_to_missing_directory() {
	let dir = tempfile::tempdir().unwrap();
	let cwd = dir.path().canonicalize().unwrap();
	let mut ish = IshHandler::new(&cwd);
	ish.send("cd /does/not/exist");
	assert!(live_children_of(ish.pid()).is_empty());
	ish.send("pwd");
	let out = ish.finish();
	assert!(out.stderr.contains("cd: /does/not/exist"), "stderr: {}", out.stderr);
	assert!(out.stdout.contains(cwd.to_str().unwrap()), "stdout: {}", out.stdout);
}

#[test]
fn foreground_pipeline_blocks_the_prompt() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	let start = Instant::now();
	ish.send("sleep 1 | echo first");
	ish.send("echo second");
	let out = ish.finish();
	assert!(start.elapsed() >= Duration::from_secs(1));
	let first = out.stdout.find("first").unwrap();
	let second = out.stdout.find("second").unwrap();
	assert!(first < second);
	// One prompt per command plus the one answered by end of input.
	assert_eq!(out.stdout.matches("ish:").count(), 3, "stdout: {}", out.stdout);
}

#[test]
fn background_job_does_not_block() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	let start = Instant::now();
	ish.send("sleep 5 &");
	ish.send("echo ready");
	let out = ish.finish();
	assert!(start.elapsed() < Duration::from_secs(4));
	assert!(out.stdout.contains("ready"));
}

#[test]
fn background_job_is_reaped() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("sleep 1 &");
	assert_eq!(live_children_of(ish.pid()).len(), 1);
	ish.send("echo hello");
	sleep(Duration::from_millis(1500));
	assert!(children_of(ish.pid()).is_empty(), "children: {:?}", children_of(ish.pid()));
	let out = ish.finish();
	assert!(out.status.success());
}

#[test]
fn stopped_background_job_is_killed() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("sleep 60 &");
	let background = live_children_of(ish.pid());
	assert_eq!(background.len(), 1);
	kill(Pid::from_raw(background[0]), Signal::SIGSTOP).unwrap();
	sleep_little();
	assert!(children_of(ish.pid()).is_empty(), "children: {:?}", children_of(ish.pid()));
	ish.send("echo alive");
	let out = ish.finish();
	assert!(out.status.success());
	assert!(out.stdout.contains("alive"));
}

#[test]
fn exit_hangs_up_every_descendant() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("sleep 60 &");
	ish.send("sleep 60 | cat &");
	let descendants = live_children_of(ish.pid());
	assert_eq!(descendants.len(), 3);
	ish.send("exit");
	let out = ish.wait(Duration::from_secs(3));
	assert!(out.status.success());
	sleep_little();
	for pid in descendants {
		assert!(is_gone(pid), "{} survived exit", pid);
	}
}

#[test]
fn interrupt_kills_only_the_foreground_job() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("sleep 60 &");
	let background = live_children_of(ish.pid());
	assert_eq!(background.len(), 1);
	ish.send("sleep 60 | sleep 60");
	assert_eq!(live_children_of(ish.pid()).len(), 3);

	killpg(Pid::from_raw(ish.pid()), Signal::SIGINT).unwrap();
	sleep_little();
	assert_eq!(live_children_of(ish.pid()), background);
	assert_no_zombies(ish.pid());

	ish.send("echo alive");
	let out = ish.finish();
	assert!(out.status.success());
	assert!(out.stdout.contains("alive"));
	assert!(out.stderr.contains("SIGINT"), "stderr: {}", out.stderr);
}

#[test]
fn errors_do_not_end_the_loop() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("ls |");
	ish.send("no-such-program-ish arg");
	ish.send("cat < missing.txt");
	ish.send("echo still here");
	let out = ish.finish();
	assert!(out.status.success());
	assert!(out.stderr.contains("parse error"));
	assert!(out.stderr.contains("command not found: no-such-program-ish"));
	assert!(out.stderr.contains("missing.txt"));
	assert!(out.stdout.contains("still here"));
}

#[test]
fn builtin_ignores_redirects_with_a_warning() {
	let dir = tempfile::tempdir().unwrap();
	let mut ish = IshHandler::new(dir.path());
	ish.send("cd . > out.txt");
	let out = ish.finish();
	assert!(out.status.success());
	assert!(!dir.path().join("out.txt").exists());
	assert!(out.stderr.contains("cd: redirects and '&' are ignored"), "stderr: {}", out.stderr);
}

// `sh` owns a fresh terminal and runs ish as a plain member of its group,
// so ish has to found its own group and move the terminal over to it.
#[test]
fn takes_the_terminal_when_started_inside_another_group() {
	let pty = openpty(None, None).unwrap();
	let mut command = Command::new("sh");
	command.arg("-c").arg("\"$0\"; exit $?").arg(env!("CARGO_BIN_EXE_ish"))
		.stdin(Stdio::from(pty.slave))
		.stdout(Stdio::null())
		.stderr(Stdio::null());
	unsafe {
		command.pre_exec(|| {
			if libc::setsid() < 0 || libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
				return Err(io::Error::last_os_error());
			}
			Ok(())
		});
	}
	let mut sh = command.spawn().unwrap();

	let deadline = Instant::now() + Duration::from_secs(5);
	let ish = loop {
		let leader = children_of(sh.id() as i32).first().map(|&(pid, _)| Pid::from_raw(pid));
		if let Some(pid) = leader {
			if unistd::tcgetpgrp(&pty.master) == Ok(pid) {
				break pid;
			}
		}
		if Instant::now() > deadline {
			let _ = sh.kill();
			let _ = sh.wait();
			panic!("ish never became the terminal's foreground group");
		}
		sleep(Duration::from_millis(20));
	};

	let mut terminal = File::from(pty.master);
	terminal.write_all(b"exit\n").unwrap();
	let deadline = Instant::now() + Duration::from_secs(5);
	let status = loop {
		if let Some(status) = sh.try_wait().unwrap() {
			break status;
		}
		assert!(Instant::now() < deadline, "ish {} did not exit", ish);
		sleep(Duration::from_millis(20));
	};
	assert!(status.success());
}
