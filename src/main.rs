mod buffer;
mod children;
mod cursor;
mod engine;
mod epoll;
mod fds;
mod file_transfer;
mod logger;
mod logging;
mod msgpack;
mod protocol;
mod reaper;

use engine::Engine;

use crate::fatal;

fn main() {
	logger::init();
	let mut eng = match Engine::new() {
		Ok(eng) => eng,
		Err(err) => fatal!("failed to initialize: {err}"),
	};
	if let Err(err) = eng.run() {
		fatal!("event loop failed: {err}");
	}
}
