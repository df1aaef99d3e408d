mod builtin;
mod eval;
mod global;
mod job;
mod lexer;
mod parser;
mod signal;
mod types;

use std::io;
use std::io::{BufRead, IsTerminal, Write};
use std::process::ExitCode;

use tracing::debug;
use tracing_subscriber::EnvFilter;

const PROMPT: &[u8] = b"pipesh$ ";
const LOG_ENV: &str = "PIPESH_LOG";

fn init_tracing() {
	let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.init();
}

/// Drops the line terminator and any leading blanks.
fn trim_line(line: &[u8]) -> &[u8] {
	let line = line.strip_suffix(b"\n").unwrap_or(line);
	let start = line.iter().position(|&c| c != b' ' && c != b'\t').unwrap_or(line.len());
	&line[start ..]
}

fn run_line(state: &mut global::State, line: &[u8]) {
	let tokens = lexer::tokenize(line);
	debug!(?tokens, "tokenized");
	let pipeline = match parser::parse(tokens, line) {
		Ok(pipeline) => pipeline,
		Err(e) => {
			eprintln!("{}", e);
			return;
		},
	};
	debug!(segments = pipeline.commands.len(), background = pipeline.is_background, "parsed");
	match eval::eval(state, &pipeline) {
		Ok(eval::EvalResult::Done(status)) => debug!(status, "done"),
		Ok(eval::EvalResult::Background(job)) => debug!(job = job.id, "running in background"),
		Err(e) => eprintln!("pipesh: {}", e),
	}
}

fn main() -> ExitCode {
	init_tracing();

	let jobs: &'static job::JobTable = Box::leak(Box::new(job::JobTable::new()));
	if let Err(e) = signal::install(jobs) {
		eprintln!("pipesh: cannot install signal handlers: {}", e);
		return ExitCode::FAILURE;
	}

	let stdin = io::stdin();
	let mut state = global::State::new(jobs, stdin.is_terminal());
	let mut stdout = io::stdout();
	let mut stdin_locked = stdin.lock();
	loop {
		if state.interactive {
			let _ = stdout.write_all(PROMPT);
			let _ = stdout.flush();
		}
		let mut line: Vec<u8> = vec![];
		match stdin_locked.read_until(b'\n', &mut line) {
			Ok(0) => {
				if state.interactive {
					let _ = stdout.write_all(b"\n");
				}
				break;
			},
			Ok(_) => {},
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => { continue; },
			Err(e) => {
				eprintln!("pipesh: read error: {}", e);
				return ExitCode::FAILURE;
			},
		}
		let line = trim_line(&line);
		if line.is_empty() {
			continue;
		}
		run_line(&mut state, line);
	}
	ExitCode::SUCCESS
}
