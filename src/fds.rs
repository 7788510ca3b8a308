use std::os::fd::{FromRawFd, OwnedFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{signalfd, SfdFlags};

/// Block `SIGCHLD` on the current thread and return a file descriptor that
/// becomes readable when a child terminates. The returned fd is
/// nonblocking and close-on-exec; register it with the multiplexer at
/// `EPOLLIN` level-triggered interest.
///
/// Grounded on `open-sourceress-myway/src/signals.rs`'s `catch_sigint`,
/// generalized from `SIGINT` to `SIGCHLD` — the reference implementation's
/// signal of interest for reaping terminated children.
pub fn catch_sigchld() -> nix::Result<OwnedFd> {
	let mut signals = SigSet::empty();
	signals.add(Signal::SIGCHLD);
	signals.thread_block()?;
	let fd = signalfd(-1, &signals, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;
	// Safety: signalfd returns a newly created fd that we immediately wrap.
	Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
