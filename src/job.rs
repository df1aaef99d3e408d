//! Fixed-capacity background job table.
//!
//! The table has two writers: the launch path, which claims a free slot and
//! fills it, and the SIGCHLD reaper, which only ever flips a running slot to
//! finished. Neither takes a lock, so the reaper may run at any point of the
//! main flow, including in the middle of `register`.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use thiserror::Error;

pub const MAX_JOBS: usize = 128;
pub const MAX_JOB_TEXT: usize = 511;

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const RUNNING: u8 = 2;
const FINISHED: u8 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
	#[error("job table full")]
	TableFull,
}

/// How a reaped child ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Completion {
	Exited(i32),
	Signaled(i32),
}

pub trait WaitStatusExt {
	fn completion(self) -> Option<Completion>;
}

impl WaitStatusExt for WaitStatus {
	fn completion(self) -> Option<Completion> {
		match self {
			WaitStatus::Exited(_, code) => Some(Completion::Exited(code)),
			WaitStatus::Signaled(_, sig, _) => Some(Completion::Signaled(sig as i32)),
			_ => None,
		}
	}
}

impl Completion {
	/// Shell-style status: the exit code, or 128 plus the signal number.
	pub fn code(self) -> i32 {
		match self {
			Completion::Exited(code) => code,
			Completion::Signaled(sig) => 128 + sig,
		}
	}
}

/// Display text copied out of a slot.
#[derive(Clone, Copy)]
pub struct JobText {
	buf: [u8; MAX_JOB_TEXT],
	len: usize,
}

impl JobText {
	pub fn as_bytes(&self) -> &[u8] {
		&self.buf[.. self.len]
	}
}

impl fmt::Debug for JobText {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
	}
}

#[derive(Debug, Clone, Copy)]
pub struct Job {
	/// 1-based slot number, as shown to the user.
	pub id: usize,
	pub pid: Pid,
	pub text: JobText,
}

struct Slot {
	state: AtomicU8,
	pid: AtomicI32,
	text_len: AtomicUsize,
	text: UnsafeCell<[u8; MAX_JOB_TEXT]>,
}

impl Slot {
	fn new() -> Slot {
		Slot {
			state: AtomicU8::new(FREE),
			pid: AtomicI32::new(0),
			text_len: AtomicUsize::new(0),
			text: UnsafeCell::new([0; MAX_JOB_TEXT]),
		}
	}

	fn claim(&self) -> bool {
		[FREE, FINISHED].iter().any(|&from| {
			self.state.compare_exchange(from, CLAIMED, Ordering::Acquire, Ordering::Relaxed).is_ok()
		})
	}

	fn fill(&self, pid: Pid, text: &[u8]) {
		let len = text.len().min(MAX_JOB_TEXT);
		// SAFETY: the slot is CLAIMED, a state nobody but the claimer reads or writes.
		unsafe { (&mut (*self.text.get()))[.. len].copy_from_slice(&text[.. len]); }
		self.text_len.store(len, Ordering::Relaxed);
		self.pid.store(pid.as_raw(), Ordering::Relaxed);
	}

	fn snapshot(&self, id: usize) -> Job {
		let len = self.text_len.load(Ordering::Relaxed);
		let mut buf = [0; MAX_JOB_TEXT];
		// SAFETY: only called on RUNNING or FINISHED slots, whose text is never written.
		unsafe { buf[.. len].copy_from_slice(&(&(*self.text.get()))[.. len]); }
		Job {
			id,
			pid: Pid::from_raw(self.pid.load(Ordering::Relaxed)),
			text: JobText { buf, len },
		}
	}
}

pub struct JobTable {
	slots: [Slot; MAX_JOBS],
}

// SAFETY: slot text is only written while the slot is CLAIMED and only read
// after an Acquire load has observed RUNNING or FINISHED.
unsafe impl Sync for JobTable {}

impl JobTable {
	pub fn new() -> JobTable {
		JobTable { slots: std::array::from_fn(|_| Slot::new()) }
	}

	/// Launch path. Takes the first slot that is free or already finished.
	pub fn register(&self, pid: Pid, text: &[u8]) -> Result<Job, JobError> {
		for (i, slot) in self.slots.iter().enumerate() {
			if slot.claim() {
				slot.fill(pid, text);
				slot.state.store(RUNNING, Ordering::Release);
				return Ok(slot.snapshot(i + 1));
			}
		}
		Err(JobError::TableFull)
	}

	/// Reaper path. Marks the running job owning `pid` as finished; a pid
	/// with no running job yields `None`. Does not allocate.
	pub fn finish(&self, pid: Pid) -> Option<Job> {
		for (i, slot) in self.slots.iter().enumerate() {
			if slot.state.load(Ordering::Acquire) != RUNNING || slot.pid.load(Ordering::Relaxed) != pid.as_raw() {
				continue;
			}
			if slot.state.compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
				return Some(slot.snapshot(i + 1));
			}
		}
		None
	}

	pub fn running(&self) -> impl Iterator<Item = Job> + '_ {
		self.slots.iter().enumerate()
			.filter(|&(_, slot)| slot.state.load(Ordering::Acquire) == RUNNING)
			.map(|(i, slot)| slot.snapshot(i + 1))
	}
}

impl Default for JobTable {
	fn default() -> JobTable {
		JobTable::new()
	}
}

pub const NOTICE_CAP: usize = MAX_JOB_TEXT + 96;

/// Completion notice, formatted on the stack so the reaper can build it
/// without allocating.
pub struct Notice {
	buf: [u8; NOTICE_CAP],
	len: usize,
}

impl Notice {
	pub fn finished(job: &Job, completion: Completion) -> Notice {
		use std::fmt::Write;

		let mut notice = Notice { buf: [0; NOTICE_CAP], len: 0 };
		let _ = match completion {
			Completion::Exited(code) => write!(notice, "\nJob [{}] {} finished (exit {}): ", job.id, job.pid, code),
			Completion::Signaled(sig) => write!(notice, "\nJob [{}] {} killed by signal {}: ", job.id, job.pid, sig),
		};
		notice.push(job.text.as_bytes());
		notice.push(b"\n");
		notice
	}

	fn push(&mut self, bytes: &[u8]) {
		let n = bytes.len().min(NOTICE_CAP - self.len);
		self.buf[self.len .. self.len + n].copy_from_slice(&bytes[.. n]);
		self.len += n;
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.buf[.. self.len]
	}
}

impl fmt::Write for Notice {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		self.push(s.as_bytes());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pid(n: i32) -> Pid {
		Pid::from_raw(n)
	}

	#[test]
	fn register_then_finish() {
		let table = JobTable::new();
		let job = table.register(pid(100), b"sleep 1 &").unwrap();
		assert_eq!(job.id, 1);
		assert_eq!(job.text.as_bytes(), b"sleep 1 &");

		let running: Vec<Job> = table.running().collect();
		assert_eq!(running.len(), 1);
		assert_eq!(running[0].pid, pid(100));

		let done = table.finish(pid(100)).unwrap();
		assert_eq!(done.id, 1);
		assert_eq!(done.text.as_bytes(), b"sleep 1 &");
		assert_eq!(table.running().count(), 0);
		assert!(table.finish(pid(100)).is_none());
	}

	#[test]
	fn untracked_pid_is_ignored() {
		let table = JobTable::new();
		table.register(pid(7), b"a &").unwrap();
		assert!(table.finish(pid(8)).is_none());
		assert_eq!(table.running().count(), 1);
	}

	#[test]
	fn finished_slot_is_reused_first_fit() {
		let table = JobTable::new();
		assert_eq!(table.register(pid(1), b"one").unwrap().id, 1);
		assert_eq!(table.register(pid(2), b"two").unwrap().id, 2);
		table.finish(pid(1)).unwrap();
		let job = table.register(pid(3), b"three").unwrap();
		assert_eq!(job.id, 1);
		assert_eq!(job.text.as_bytes(), b"three");
		assert_eq!(table.register(pid(4), b"four").unwrap().id, 3);
	}

	#[test]
	fn full_table_reports_instead_of_dropping() {
		let table = JobTable::new();
		for i in 0 .. MAX_JOBS {
			table.register(pid(1000 + i as i32), b"x").unwrap();
		}
		assert_eq!(table.register(pid(9999), b"x").unwrap_err(), JobError::TableFull);
		assert_eq!(table.running().count(), MAX_JOBS);

		table.finish(pid(1050)).unwrap();
		assert_eq!(table.register(pid(9999), b"x").unwrap().id, 51);
	}

	#[test]
	fn long_text_is_truncated() {
		let table = JobTable::new();
		let text = vec![b'a'; MAX_JOB_TEXT + 40];
		let job = table.register(pid(5), &text).unwrap();
		assert_eq!(job.text.as_bytes().len(), MAX_JOB_TEXT);
	}

	#[test]
	fn notice_text() {
		let table = JobTable::new();
		let job = table.register(pid(42), b"sleep 1 &").unwrap();
		let exited = Notice::finished(&job, Completion::Exited(0));
		assert_eq!(exited.as_bytes(), b"\nJob [1] 42 finished (exit 0): sleep 1 &\n");
		let killed = Notice::finished(&job, Completion::Signaled(9));
		assert_eq!(killed.as_bytes(), b"\nJob [1] 42 killed by signal 9: sleep 1 &\n");
	}

	#[test]
	fn completion_from_wait_status() {
		use nix::sys::signal::Signal;

		assert_eq!(WaitStatus::Exited(pid(1), 3).completion(), Some(Completion::Exited(3)));
		assert_eq!(
			WaitStatus::Signaled(pid(1), Signal::SIGKILL, false).completion(),
			Some(Completion::Signaled(9)),
		);
		assert_eq!(WaitStatus::StillAlive.completion(), None);
		assert_eq!(Completion::Signaled(2).code(), 130);
	}
}
