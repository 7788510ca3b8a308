//! Diagnostic sink. Every call site goes through [`ltx_log!`] (plain lines)
//! or [`fatal!`] (unrecoverable, does not return), both of which format a
//! `[file:function:line] message` line, write it to stderr unconditionally,
//! and — only from the parent executor process — additionally wrap it as a
//! log frame (`protocol::encode_log_frame`) and write it synchronously to the
//! outbound pipe.
//!
//! Grounded on `ltx.c`'s `ltx_log`: the parent-process gate (`ltx_pid ==
//! getpid()`), the "format once, write to both places" shape, and the
//! fatal-assertion macro that prints a trace before exiting. The stderr-only
//! half plays the same role as `open-sourceress-myway/src/logger.rs`'s
//! `log::Log` impl, but this sink is a distinct mechanism: it needs
//! synchronous access to the real outbound fd to honor the ordering and
//! best-effort-write rules for log frames, so it is plain functions and
//! thread-locals rather than something routed through the `log` facade.
use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::unistd;

use crate::protocol;

thread_local! {
	/// The outbound pipe's fd, set once at startup. `None` before `init()` runs.
	static OUT_FD: Cell<Option<RawFd>> = const { Cell::new(None) };
	/// The pid captured when the process started, i.e. the reference
	/// implementation's `ltx_pid`. A forked child inherits this thread-local's
	/// value as it was at fork time, but its own `getpid()` differs from it —
	/// exactly the signal used below to suppress child log frames.
	static STARTUP_PID: Cell<i32> = const { Cell::new(0) };
}

/// Record the outbound fd and the current pid as the "we are the parent"
/// baseline. Must be called once, early in `main`, before any child is
/// forked.
pub fn init(out_fd: RawFd) {
	OUT_FD.with(|c| c.set(Some(out_fd)));
	STARTUP_PID.with(|c| c.set(unistd::getpid().as_raw()));
}

fn is_parent_process() -> bool {
	STARTUP_PID.with(|c| c.get() == unistd::getpid().as_raw())
}

/// Source location captured by the [`ltx_log!`]/[`fatal!`] macros at the call
/// site.
pub struct LogPos {
	pub file: &'static str,
	pub function: &'static str,
	pub line: u32,
}

/// Format and dispatch one diagnostic line. Not called directly; use
/// [`ltx_log!`] or [`fatal!`].
pub fn log_line(pos: LogPos, args: fmt::Arguments<'_>) {
	let line = format!("[{}:{}:{}] {}\n", pos.file, pos.function, pos.line, args);
	let _ = std::io::stderr().write_all(line.as_bytes());
	if is_parent_process() {
		if let Some(fd) = OUT_FD.with(Cell::get) {
			emit_log_frame(fd, line.trim_end_matches('\n'));
		}
	}
}

/// Write a `log` frame for `text` straight to `fd`, bypassing the shared
/// outbound buffer entirely: a synchronous, best-effort side channel, not
/// part of the ordered frame stream the event loop drains.
fn emit_log_frame(fd: RawFd, text: &str) {
	let now_ns = monotonic_now_ns();
	let mut bytes = Vec::new();
	protocol::encode_log_frame(&mut bytes, None, now_ns, text);

	let fd = unsafe { BorrowedFd::borrow_raw(fd) };
	let mut written = 0;
	while written < bytes.len() {
		match unistd::write(fd, &bytes[written..]) {
			Ok(0) => break,
			Ok(n) => written += n,
			Err(Errno::EINTR) => continue,
			// Best-effort: a short write retries, but a pipe that would block
			// is abandoned rather than spun on — this write happens inline on
			// whichever thread is logging, including the `fatal!` path, and
			// spinning here while the peer isn't draining would keep the
			// process from ever reaching `process::exit`.
			Err(Errno::EAGAIN) => break,
			Err(_) => break,
		}
	}
}

fn monotonic_now_ns() -> u64 {
	let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC).expect("clock_gettime(CLOCK_MONOTONIC) cannot fail on Linux");
	ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
}

/// Print a raw backtrace to stderr, as the fatal-assertion path's last step
/// before exit.
pub fn print_fatal_backtrace() {
	eprintln!("{}", std::backtrace::Backtrace::force_capture());
}

/// Expands to the enclosing function's unqualified path; `line!()` and
/// `file!()` are built in but Rust has no `function!()`.
#[macro_export]
macro_rules! function_name {
	() => {{
		fn f() {}
		fn type_name_of<T>(_: T) -> &'static str {
			std::any::type_name::<T>()
		}
		let name = type_name_of(f);
		&name[..name.len() - 3]
	}};
}

/// Format and log a line.
#[macro_export]
macro_rules! ltx_log {
	($($arg:tt)*) => {
		$crate::logging::log_line(
			$crate::logging::LogPos { file: file!(), function: $crate::function_name!(), line: line!() },
			format_args!($($arg)*),
		)
	};
}

/// Log a fatal diagnostic, print a backtrace, and exit 1. Never returns; usable
/// as an expression since it diverges.
#[macro_export]
macro_rules! fatal {
	($($arg:tt)*) => {{
		$crate::logging::log_line(
			$crate::logging::LogPos { file: file!(), function: $crate::function_name!(), line: line!() },
			format_args!("fatal: {}", format_args!($($arg)*)),
		);
		$crate::logging::print_fatal_backtrace();
		std::process::exit(1)
	}};
}

pub use crate::fatal;
pub use crate::ltx_log;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn is_parent_process_is_false_before_init_runs() {
		// STARTUP_PID defaults to 0, which never equals a real pid, so the
		// uninitialized state behaves like "not the parent" rather than
		// emitting frames to a bogus fd.
		assert!(!is_parent_process());
	}

	#[test]
	fn function_name_resolves_to_enclosing_fn() {
		fn probe() -> &'static str {
			function_name!()
		}
		assert!(probe().ends_with("probe"));
	}
}
