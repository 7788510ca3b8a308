//! Reads batches of `signalfd_siginfo` records off the `SIGCHLD` signalfd and
//! turns each into a `waitpid` reap plus a `result` frame.
//!
//! Grounded on `open-sourceress-myway/src/fds.rs`/`src/signals.rs` for the
//! signal-as-fd pattern (there used for `SIGINT`, read for readability only);
//! generalized here to `SIGCHLD` and to draining every queued record in one
//! `read(2)`, matching `ltx.c`'s `process_event` signal branch, which loops
//! `read(sigfd, &info, sizeof info)` until it would block.
use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::children::ChildTable;
use crate::fatal;
use crate::msgpack::Sink;
use crate::protocol;

/// One `signalfd_siginfo` record is this many bytes; reads are always a
/// whole multiple of it.
const SIGINFO_SIZE: usize = size_of::<libc::signalfd_siginfo>();

/// Drain every currently-queued `SIGCHLD` record from `sigfd`, reap the
/// corresponding child with `waitpid`, and append a `result` frame per reap
/// to `out`.
pub fn drain(sigfd: &impl AsFd, table: &mut ChildTable, now_ns: impl Fn() -> u64, out: &mut impl Sink) -> io::Result<()> {
	let mut raw = [0u8; 16 * SIGINFO_SIZE];
	loop {
		let n = match nix::unistd::read(sigfd.as_fd().as_raw_fd(), &mut raw) {
			Ok(n) => n,
			Err(nix::errno::Errno::EAGAIN) => return Ok(()),
			Err(nix::errno::Errno::EINTR) => continue,
			Err(err) => return Err(err.into()),
		};
		if n == 0 {
			return Ok(());
		}
		assert_eq!(n % SIGINFO_SIZE, 0, "short signalfd read: {n} bytes is not a whole number of siginfo records");

		for chunk in raw[..n].chunks_exact(SIGINFO_SIZE) {
			// Safety: signalfd(7) guarantees each chunk is a valid
			// signalfd_siginfo; the struct is plain old data (repr(C), no
			// padding-sensitive invariants we rely on).
			let info: libc::signalfd_siginfo = unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast()) };
			reap_one(Pid::from_raw(info.ssi_pid as i32), table, &now_ns, out)?;
		}
	}
}

fn reap_one(pid: Pid, table: &mut ChildTable, now_ns: &impl Fn() -> u64, out: &mut impl Sink) -> io::Result<()> {
	let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
		Ok(status) => status,
		Err(err) => fatal!("waitpid({pid}) failed after SIGCHLD: {err}"),
	};
	let (si_code, si_status) = match status {
		WaitStatus::Exited(_, code) => (libc::CLD_EXITED as u64, code as u64),
		WaitStatus::Signaled(_, signal, _) => (libc::CLD_KILLED as u64, signal as u64),
		WaitStatus::StillAlive => return Ok(()),
		other => fatal!("unexpected waitpid status for {pid}: {other:?}"),
	};

	let (table_id, _done) = table.mark_reaped(pid, &status);
	protocol::encode_result(out, table_id as u64, now_ns(), si_code, si_status);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn siginfo_record_size_matches_kernel_struct() {
		assert_eq!(SIGINFO_SIZE, std::mem::size_of::<libc::signalfd_siginfo>());
	}
}
