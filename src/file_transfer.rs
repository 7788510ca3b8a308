//! Serves a `get_file` request: open, stat, echo, `data` header, then stream
//! the file's bytes over the outbound fd using the kernel `sendfile`
//! fast path.
//!
//! Grounded on `ltx.c`'s `process_get_file_msg`; `nix::sys::sendfile` is the
//! idiomatic wrapper for the same syscall the C original calls directly (no
//! corpus example streams a file this way, so this is sourced straight from
//! `nix`, not imitated from another example).
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::sendfile::sendfile;

use crate::fatal;

/// Everything `serve` needs from the engine, kept narrow so this module
/// doesn't need to know about the rest of `Engine`'s fields.
pub trait FileTransferHost {
	fn stdout_fd(&self) -> BorrowedFd<'_>;
	/// Flush the outbound buffer completely, blocking if necessary. Called
	/// before switching the outbound fd to blocking mode.
	fn flush_outbound_blocking(&mut self) -> io::Result<()>;
	fn enqueue_get_file_echo(&mut self, path: &str);
	fn enqueue_data_header(&mut self, len: u64);
}

/// Serve one `get_file` request end to end.
pub fn serve(host: &mut impl FileTransferHost, path: &str) -> io::Result<()> {
	let file = File::open(path)?;
	let metadata = file.metadata()?;
	let size = metadata.len();
	if size > u32::MAX as u64 {
		fatal!("get_file: {path} is {size} bytes, too large to declare in a bin32 header");
	}

	host.enqueue_get_file_echo(path);
	host.enqueue_data_header(size);
	host.flush_outbound_blocking()?;

	set_blocking(host.stdout_fd(), true)?;
	let result = stream_file(&file, host.stdout_fd(), size);
	set_blocking(host.stdout_fd(), false)?;
	result
}

fn stream_file(file: &File, out: BorrowedFd<'_>, size: u64) -> io::Result<()> {
	let in_fd = file.as_fd();
	let mut sent: u64 = 0;
	while sent < size {
		let remaining = (size - sent) as usize;
		match sendfile(out, in_fd, None, remaining) {
			Ok(0) => break,
			Ok(n) => sent += n as u64,
			Err(nix::errno::Errno::EINTR) => continue,
			Err(err) => return Err(err.into()),
		}
	}
	if sent != size {
		fatal!("sendfile transferred {sent} bytes, expected exactly {size}");
	}
	Ok(())
}

fn set_blocking(fd: BorrowedFd<'_>, blocking: bool) -> io::Result<()> {
	let current = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
	let mut flags = OFlag::from_bits_truncate(current);
	flags.set(OFlag::O_NONBLOCK, !blocking);
	fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
	Ok(())
}
