use std::env;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process;

use crate::global;

/// Builtins get the whole argument list, name included, and report a
/// shell status.
pub type Builtin = fn(&mut global::State, &[Vec<u8>], &mut dyn Write) -> i32;

const HOME_KEY: &str = "HOME";

pub fn builtin_cd(_: &mut global::State, arguments: &[Vec<u8>], _: &mut dyn Write) -> i32 {
	let target: OsString = match arguments.get(1) {
		Some(dir) => OsStr::from_bytes(dir).to_owned(),
		None => match env::var_os(HOME_KEY) {
			Some(home) => home,
			None => {
				eprintln!("cd: {} not set", HOME_KEY);
				return 1;
			},
		},
	};
	match env::set_current_dir(&target) {
		Ok(()) => 0,
		Err(e) => {
			eprintln!("cd: {}: {}", Path::new(&target).display(), e);
			1
		},
	}
}

pub fn builtin_exit(_: &mut global::State, _: &[Vec<u8>], out: &mut dyn Write) -> i32 {
	let _ = out.flush();
	process::exit(0)
}

pub fn builtin_jobs(state: &mut global::State, _: &[Vec<u8>], out: &mut dyn Write) -> i32 {
	for job in state.jobs.running() {
		let r = write!(out, "[{}] {}  ", job.id, job.pid)
			.and_then(|_| out.write_all(job.text.as_bytes()))
			.and_then(|_| out.write_all(b"\n"));
		if let Err(e) = r {
			eprintln!("jobs: {}", e);
			return 1;
		}
	}
	0
}

pub fn match_builtin(name: &[u8]) -> Option<Builtin> {
	match name {
		b"cd" => Some(builtin_cd),
		b"exit" => Some(builtin_exit),
		b"jobs" => Some(builtin_jobs),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::JobTable;
	use nix::unistd::Pid;

	fn state() -> global::State {
		global::State::new(Box::leak(Box::new(JobTable::new())), false)
	}

	#[test]
	fn dispatch_by_name() {
		assert!(match_builtin(b"cd").is_some());
		assert!(match_builtin(b"exit").is_some());
		assert!(match_builtin(b"jobs").is_some());
		assert!(match_builtin(b"ls").is_none());
		assert!(match_builtin(b"").is_none());
	}

	#[test]
	fn jobs_lists_running_entries() {
		let mut state = state();
		state.jobs.register(Pid::from_raw(11), b"sleep 5 &").unwrap();
		state.jobs.register(Pid::from_raw(12), b"sleep 6 &").unwrap();
		state.jobs.finish(Pid::from_raw(11)).unwrap();

		let mut out: Vec<u8> = vec![];
		assert_eq!(builtin_jobs(&mut state, &[b"jobs".to_vec()], &mut out), 0);
		assert_eq!(out, b"[2] 12  sleep 6 &\n".to_vec());
	}

	#[test]
	fn cd_into_missing_directory_fails() {
		let mut state = state();
		let before = env::current_dir().unwrap();
		let args = vec![b"cd".to_vec(), b"/definitely/not/a/dir".to_vec()];
		assert_eq!(builtin_cd(&mut state, &args, &mut std::io::sink()), 1);
		assert_eq!(env::current_dir().unwrap(), before);
	}
}
