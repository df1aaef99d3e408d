//! SIGCHLD reaping and SIGINT suppression.
//!
//! Everything reachable from the handlers here must be async-signal-safe:
//! no allocation, no locks, no tracing. Output goes straight to fd 1 with
//! `write(2)`.

use std::os::fd::BorrowedFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

use libc::c_int;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

use crate::job::{JobTable, Notice, WaitStatusExt};

static REAPED_JOBS: AtomicPtr<JobTable> = AtomicPtr::new(ptr::null_mut());

const NO_STATUS: i32 = i32::MIN;
static FOREGROUND_PID: AtomicI32 = AtomicI32::new(0);
static FOREGROUND_STATUS: AtomicI32 = AtomicI32::new(NO_STATUS);

fn stdout_fd() -> BorrowedFd<'static> {
	// SAFETY: fd 1 is never closed by the interpreter.
	unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) }
}

extern "C" fn handle_sigchld(_: c_int) {
	let saved = Errno::last_raw();
	let jobs = REAPED_JOBS.load(Ordering::Acquire);
	if !jobs.is_null() {
		// SAFETY: only `install` stores here, and it takes a &'static.
		reap(unsafe { &*jobs }, stdout_fd());
	}
	Errno::set_raw(saved);
}

extern "C" fn handle_sigint(_: c_int) {
	let saved = Errno::last_raw();
	let _ = unistd::write(stdout_fd(), b"\n");
	Errno::set_raw(saved);
}

/// Collects every child that has terminated so far, without blocking.
/// Children that belong to a running job get it marked finished and a notice
/// written to `out`; any other pid is dropped silently.
pub fn reap(jobs: &JobTable, out: BorrowedFd) {
	loop {
		let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
			Ok(WaitStatus::StillAlive) | Err(_) => { break; },
			Ok(status) => status,
		};
		let (pid, completion) = match (status.pid(), status.completion()) {
			(Some(pid), Some(completion)) => (pid, completion),
			_ => { continue; },
		};
		if record_foreground(pid, completion.code()) {
			continue;
		}
		if let Some(job) = jobs.finish(pid) {
			let _ = unistd::write(out, Notice::finished(&job, completion).as_bytes());
		}
	}
}

// Keeps the status of the watched foreground pid for `wait_foreground`.
fn record_foreground(pid: Pid, code: i32) -> bool {
	if pid.as_raw() != FOREGROUND_PID.load(Ordering::Acquire) {
		return false;
	}
	FOREGROUND_STATUS.store(code, Ordering::Release);
	true
}

/// Publishes the foreground pid to the reaper for as long as it lives. If the
/// reaper collects that pid first, its status is kept here instead of being
/// dropped.
pub struct ForegroundWatch(());

impl ForegroundWatch {
	/// Must be created while SIGCHLD is still blocked.
	pub fn new(pid: Pid) -> ForegroundWatch {
		FOREGROUND_STATUS.store(NO_STATUS, Ordering::Release);
		FOREGROUND_PID.store(pid.as_raw(), Ordering::Release);
		ForegroundWatch(())
	}

	pub fn reaped_status(&self) -> Option<i32> {
		match FOREGROUND_STATUS.load(Ordering::Acquire) {
			NO_STATUS => None,
			s => Some(s),
		}
	}
}

impl Drop for ForegroundWatch {
	fn drop(&mut self) {
		FOREGROUND_PID.store(0, Ordering::Release);
	}
}

/// Hands `jobs` to the SIGCHLD handler and installs both handlers.
pub fn install(jobs: &'static JobTable) -> nix::Result<()> {
	REAPED_JOBS.store(jobs as *const JobTable as *mut JobTable, Ordering::Release);
	let chld = SigAction::new(
		SigHandler::Handler(handle_sigchld),
		SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
		SigSet::empty(),
	);
	let int = SigAction::new(SigHandler::Handler(handle_sigint), SaFlags::SA_RESTART, SigSet::empty());
	// SAFETY: both handlers only make async-signal-safe calls.
	unsafe {
		signal::sigaction(Signal::SIGCHLD, &chld)?;
		signal::sigaction(Signal::SIGINT, &int)?;
	}
	Ok(())
}

fn sigchld_set() -> SigSet {
	let mut set = SigSet::empty();
	set.add(Signal::SIGCHLD);
	set
}

/// Keeps SIGCHLD blocked while alive. Held across a launch so the reaper
/// cannot collect a pid before it is registered or watched.
pub struct SigchldBlock(SigSet);

impl SigchldBlock {
	pub fn new() -> nix::Result<SigchldBlock> {
		let set = sigchld_set();
		set.thread_block()?;
		Ok(SigchldBlock(set))
	}
}

impl Drop for SigchldBlock {
	fn drop(&mut self) {
		let _ = self.0.thread_unblock();
	}
}

/// Undoes the interpreter's signal setup in a freshly forked child: SIGINT
/// back to default, SIGCHLD unblocked.
pub fn reset_for_child() -> nix::Result<()> {
	// SAFETY: SigDfl installs no Rust code.
	unsafe { signal::signal(Signal::SIGINT, SigHandler::SigDfl)?; }
	sigchld_set().thread_unblock()
}
