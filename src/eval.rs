use std::ffi::{self, CString, OsStr};
use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, warn};

use crate::builtin;
use crate::global;
use crate::job::{self, WaitStatusExt};
use crate::signal;
use crate::types::*;

const EXIT_NOT_FOUND: i32 = 127;
const EXIT_CANNOT_EXEC: i32 = 126;
const EXIT_REDIRECT_FAILED: i32 = 1;
const CREATE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("syntax error: empty command in pipeline")]
	EmptyCommand,
	#[error("pipe: {0}")]
	Pipe(#[source] nix::Error),
	#[error("fork: {0}")]
	Fork(#[source] nix::Error),
	#[error("{path}: {source}")]
	Redirect { path: String, source: io::Error },
	#[error("{name}: command not found")]
	NotFound { name: String },
	#[error("{name}: {source}")]
	Exec { name: String, source: nix::Error },
	#[error("{0}")]
	Nix(#[from] nix::Error),
	#[error("nul byte in argument: {0}")]
	Nul(#[from] ffi::NulError),
	#[error(transparent)]
	Job(#[from] job::JobError),
}

impl ExecError {
	fn child_status(&self) -> i32 {
		match *self {
			ExecError::Redirect { .. } => EXIT_REDIRECT_FAILED,
			ExecError::NotFound { .. } | ExecError::Exec { .. } => EXIT_NOT_FOUND,
			_ => EXIT_CANNOT_EXEC,
		}
	}
}

fn lossy(bytes: &[u8]) -> String {
	String::from_utf8_lossy(bytes).into_owned()
}

fn open_input(path: &[u8]) -> Result<fs::File, ExecError> {
	fs::File::open(OsStr::from_bytes(path))
		.map_err(|e| ExecError::Redirect { path: lossy(path), source: e })
}

fn open_output(output: &OutputRedirect) -> Result<fs::File, ExecError> {
	let mut oopt = fs::OpenOptions::new();
	oopt.write(true).create(true).mode(CREATE_MODE);
	let _ = match output.mode {
		WriteMode::Truncate => oopt.truncate(true),
		WriteMode::Append => oopt.append(true),
	};
	oopt.open(OsStr::from_bytes(&output.target))
		.map_err(|e| ExecError::Redirect { path: lossy(&output.target), source: e })
}

// `fd` is consumed; if it already sits on `target` it is kept open.
fn replace_fd(fd: OwnedFd, target: RawFd) -> nix::Result<()> {
	if fd.as_raw_fd() == target {
		let _ = fd.into_raw_fd();
		return Ok(());
	}
	unistd::dup2(fd.as_raw_fd(), target)?;
	Ok(())
}

fn do_exec_command(state: &mut global::State, command: &Command,
                   pipe_stdin: Option<&OwnedFd>, pipe_stdout: Option<&OwnedFd>) -> Result<i32, ExecError> {
	signal::reset_for_child()?;

	// Pipes first so that file redirections win at either end.
	if let Some(fd) = pipe_stdin {
		unistd::dup2(fd.as_raw_fd(), libc::STDIN_FILENO)?;
	}
	if let Some(fd) = pipe_stdout {
		unistd::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO)?;
	}
	if let Some(ref input) = command.input {
		replace_fd(open_input(input)?.into(), libc::STDIN_FILENO)?;
	}
	if let Some(ref output) = command.output {
		replace_fd(open_output(output)?.into(), libc::STDOUT_FILENO)?;
	}

	let name = match command.name() {
		Some(name) => name,
		None => { return Err(ExecError::EmptyCommand); },
	};
	if let Some(builtin) = builtin::match_builtin(name) {
		return Ok(builtin(state, &command.arguments, &mut io::stdout()));
	}

	// The pipe descriptors are O_CLOEXEC; only the dup2'd copies survive exec.
	let argv = command.arguments.iter()
		.map(|a| CString::new(a.as_slice()))
		.collect::<Result<Vec<CString>, ffi::NulError>>()?;
	match unistd::execvp(&argv[0], &argv) {
		Ok(never) => match never {},
		Err(Errno::ENOENT) => Err(ExecError::NotFound { name: lossy(name) }),
		Err(e) => Err(ExecError::Exec { name: lossy(name), source: e }),
	}
}

fn exec_command(state: &mut global::State, command: &Command,
                pipe_stdin: Option<&OwnedFd>, pipe_stdout: Option<&OwnedFd>) -> ! {
	let s = do_exec_command(state, command, pipe_stdin, pipe_stdout).unwrap_or_else(|e| {
		let _ = writeln!(&mut io::stderr(), "{}", e);
		e.child_status()
	});
	let _ = io::stdout().flush();
	unsafe { libc::_exit(s) }
}

/// Forks one child per command, chaining each stdout into the next stdin.
/// Returns the pid of the last child. On a pipe or fork failure the children
/// already started are left running.
fn spawn_commands(state: &mut global::State, pipeline: &Pipeline) -> Result<Pid, ExecError> {
	let mut pipe_stdin: Option<OwnedFd> = None;
	let mut last_pid = None;
	let count = pipeline.commands.len();
	for (i, command) in pipeline.commands.iter().enumerate() {
		let is_last = i + 1 == count;
		let pipe = if is_last {
			None
		} else {
			Some(unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| {
				warn!(error = %e, segment = i, "pipe failed, abandoning pipeline");
				ExecError::Pipe(e)
			})?)
		};
		let _ = io::stdout().flush();
		// SAFETY: the interpreter runs a single thread, so the child may
		// allocate freely before exec.
		let forked = unsafe { unistd::fork() }.map_err(|e| {
			warn!(error = %e, segment = i, "fork failed, abandoning pipeline");
			ExecError::Fork(e)
		})?;
		match forked {
			ForkResult::Parent { child } => {
				debug!(pid = %child, segment = i, "spawned");
				last_pid = Some(child);
				// Drops our copy of the write end and the previous read end.
				pipe_stdin = pipe.map(|(read, _write)| read);
			},
			ForkResult::Child => {
				let pipe_stdout = pipe.as_ref().map(|(_, write)| write);
				exec_command(state, command, pipe_stdin.as_ref(), pipe_stdout);
			},
		}
	}
	last_pid.ok_or(ExecError::EmptyCommand)
}

/// Blocks until `pid` itself has terminated. Other children are left to the
/// reaper, which may also collect `pid` first and leave its status in `watch`.
fn wait_foreground(pid: Pid, watch: &signal::ForegroundWatch) -> Result<i32, ExecError> {
	loop {
		match waitpid(pid, None) {
			Ok(status) => if let Some(completion) = status.completion() {
				return Ok(completion.code());
			},
			Err(Errno::EINTR) => {},
			Err(Errno::ECHILD) => {
				return watch.reaped_status().ok_or(ExecError::Nix(Errno::ECHILD));
			},
			Err(e) => { return Err(e.into()); },
		}
	}
}

fn run_builtin(state: &mut global::State, builtin: builtin::Builtin, command: &Command) -> Result<i32, ExecError> {
	match command.output {
		Some(ref output) => {
			let mut file = open_output(output)?;
			Ok(builtin(state, &command.arguments, &mut file))
		},
		None => {
			let mut stdout = io::stdout();
			let s = builtin(state, &command.arguments, &mut stdout);
			let _ = stdout.flush();
			Ok(s)
		},
	}
}

#[derive(Debug)]
pub enum EvalResult {
	Done(i32),
	Background(job::Job),
}

pub fn eval(state: &mut global::State, pipeline: &Pipeline) -> Result<EvalResult, ExecError> {
	let commands = &pipeline.commands;
	if commands.is_empty() || commands.iter().any(|c| c.arguments.is_empty()) {
		return Err(ExecError::EmptyCommand);
	}

	if commands.len() == 1 {
		if let Some(builtin) = builtin::match_builtin(&commands[0].arguments[0]) {
			return run_builtin(state, builtin, &commands[0]).map(EvalResult::Done);
		}
	}

	// SIGCHLD stays blocked until the last pid is either registered or
	// watched, never across the foreground wait itself.
	let (pid, watch) = {
		let _blocked = signal::SigchldBlock::new()?;
		let pid = spawn_commands(state, pipeline)?;
		if pipeline.is_background {
			let job = state.jobs.register(pid, &pipeline.text)?;
			debug!(job = job.id, pid = %pid, "registered");
			let mut stdout = io::stdout();
			let _ = writeln!(stdout, "[{}] {}", job.id, job.pid);
			let _ = stdout.flush();
			return Ok(EvalResult::Background(job));
		}
		(pid, signal::ForegroundWatch::new(pid))
	};
	wait_foreground(pid, &watch).map(EvalResult::Done)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::JobTable;
	use crate::lexer::tokenize;
	use crate::parser::parse;

	fn state() -> global::State {
		global::State::new(Box::leak(Box::new(JobTable::new())), false)
	}

	fn pipeline(line: &str) -> Pipeline {
		parse(tokenize(line.as_bytes()), line.as_bytes()).unwrap()
	}

	#[test]
	fn empty_segments_are_rejected_before_forking() {
		let mut state = state();
		for line in &["a | | b", "| a", "a |", "&", "> out.txt"] {
			match eval(&mut state, &pipeline(line)) {
				Err(ExecError::EmptyCommand) => {},
				other => panic!("{:?}: expected EmptyCommand, got {:?}", line, other),
			}
		}
	}

	#[test]
	fn lone_builtin_honours_output_redirect() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("jobs.txt");
		let mut state = state();
		state.jobs.register(Pid::from_raw(77), b"sleep 9 &").unwrap();

		let line = format!("jobs > {}", path.display());
		match eval(&mut state, &pipeline(&line)) {
			Ok(EvalResult::Done(0)) => {},
			other => panic!("unexpected {:?}", other),
		}
		assert_eq!(fs::read(&path).unwrap(), b"[1] 77  sleep 9 &\n".to_vec());

		let line = format!("jobs >> {}", path.display());
		eval(&mut state, &pipeline(&line)).unwrap();
		assert_eq!(fs::read(&path).unwrap(), b"[1] 77  sleep 9 &\n[1] 77  sleep 9 &\n".to_vec());
	}

	#[test]
	fn output_files_are_created_with_mode_0644() {
		use std::os::unix::fs::PermissionsExt;

		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("new.txt");
		let output = OutputRedirect {
			target: target.as_os_str().as_bytes().to_vec(),
			mode: WriteMode::Truncate,
		};
		drop(open_output(&output).unwrap());
		let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode & !0o644, 0);
	}

	#[test]
	fn missing_input_is_a_redirect_error() {
		match open_input(b"/no/such/input/file") {
			Err(e @ ExecError::Redirect { .. }) => assert_eq!(e.child_status(), EXIT_REDIRECT_FAILED),
			other => panic!("unexpected {:?}", other.map(|_| ())),
		}
	}
}
