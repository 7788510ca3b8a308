//! Thin wrapper over Linux epoll. Grounded on
//! `open-sourceress-myway/src/epoll.rs`, generalized in one respect: the
//! teacher always registers with `EPOLLET`, but the executor needs
//! level-triggered interest on every fd except the outbound pipe (see
//! `engine.rs`), so `register` takes the trigger mode explicitly instead of
//! hard-coding it.
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use log::trace;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::Result;

pub type Event = EpollEvent;
pub type Interest = EpollFlags;

pub const EPOLLIN: Interest = EpollFlags::EPOLLIN;
pub const EPOLLOUT: Interest = EpollFlags::EPOLLOUT;
pub const EPOLLHUP: Interest = EpollFlags::EPOLLHUP;
pub const EPOLLERR: Interest = EpollFlags::EPOLLERR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
	LevelTriggered,
	EdgeTriggered,
}

#[derive(Debug)]
pub struct Epoll {
	epfd: OwnedFd,
}

impl Epoll {
	pub fn new() -> Result<Self> {
		let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
		// Safety: epoll_create1 returns a newly created fd we immediately wrap.
		let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
		trace!("created epollfd {}", epfd.as_raw_fd());
		Ok(Self { epfd })
	}

	pub fn register(&self, fd: &impl AsRawFd, interest: Interest, trigger: Trigger, key: u64) -> Result<()> {
		let flags = match trigger {
			Trigger::LevelTriggered => interest,
			Trigger::EdgeTriggered => interest | EpollFlags::EPOLLET,
		};
		let fd = fd.as_raw_fd();
		epoll_ctl(self.epfd.as_raw_fd(), EpollOp::EpollCtlAdd, fd, &mut Some(EpollEvent::new(flags, key)))?;
		trace!("registered fd {fd} with epoll (trigger={trigger:?})");
		Ok(())
	}

	pub fn deregister(&self, fd: &impl AsRawFd) -> Result<()> {
		let fd = fd.as_raw_fd();
		epoll_ctl(self.epfd.as_raw_fd(), EpollOp::EpollCtlDel, fd, &mut None)?;
		trace!("deregistered fd {fd} from epoll");
		Ok(())
	}

	pub fn wait_for_activity<'e>(&self, events: &'e mut [Event], timeout: Option<Duration>) -> Result<&'e [Event]> {
		let timeout = timeout.map_or(-1, |d| d.as_millis() as _);
		let n = epoll_wait(self.epfd.as_raw_fd(), events, timeout)?;
		Ok(&events[..n])
	}
}
