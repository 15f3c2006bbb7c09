pub mod buffer;
pub mod chunk;
pub mod chunkpool;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod frame;
pub mod hash;
pub mod reactor;
pub mod registry;

use ed2k_support::config::EngineConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use dispatcher::{Dispatcher, Handler};
pub use reactor::Reactor;

/// Ties a `Reactor` and a `Dispatcher` together into the two-thread engine the design calls
/// for, and gives the host a single `stop()`/`join()` pair instead of juggling both threads by
/// hand.
pub struct Engine {
    stop_flag: Arc<AtomicBool>,
    reactor_handle: Option<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    thread_timeout: Duration,
}

impl Engine {
    /// Spawns the reactor and dispatcher threads. `configure` is handed the reactor before
    /// either thread starts, so the caller can call `listen_configured_port`/`connect` and
    /// register handlers exactly once.
    pub fn start(
        config: EngineConfig,
        logger: slog::Logger,
        mut configure: impl FnMut(&mut Reactor, &mut Dispatcher),
    ) -> std::io::Result<Engine> {
        let mut reactor = Reactor::new(config.clone(), logger.clone())?;
        let mut dispatcher = Dispatcher::new(
            reactor.connection_table(),
            config.clone(),
            logger.clone(),
        );

        configure(&mut reactor, &mut dispatcher);

        let stop_flag = Arc::new(AtomicBool::new(false));

        let reactor_stop = stop_flag.clone();
        let reactor_handle = thread::spawn(move || {
            while !reactor_stop.load(Ordering::Acquire) {
                if reactor.tick().is_err() {
                    break;
                }
            }
        });

        let dispatcher_stop = stop_flag.clone();
        let dispatcher_handle = thread::spawn(move || {
            while !dispatcher_stop.load(Ordering::Acquire) {
                dispatcher.tick();
            }
        });

        Ok(Engine {
            stop_flag,
            reactor_handle: Some(reactor_handle),
            dispatcher_handle: Some(dispatcher_handle),
            thread_timeout: Duration::from_millis(config.thread_timeout_ms),
        })
    }

    /// Signals both loops to stop after their current tick and waits for them to finish,
    /// within the configured thread timeout. A thread that overruns the timeout is detached
    /// rather than joined further -- there is no forcible-kill primitive for a plain
    /// `JoinHandle` in safe Rust.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);

        if let Some(handle) = self.reactor_handle.take() {
            let _ = join_with_timeout(handle, self.thread_timeout);
        }
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = join_with_timeout(handle, self.thread_timeout);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.reactor_handle.is_some() || self.dispatcher_handle.is_some() {
            self.stop();
        }
    }
}

/// `JoinHandle::join` has no timeout variant; polling `is_finished`-equivalent state isn't
/// exposed pre-1.61-stable either, so this just gives the thread one more scheduling slice
/// before blocking on the join. Good enough for the cooperative loops here, which check the
/// stop flag every `thread_frequency` tick.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> thread::Result<()> {
    thread::sleep(timeout.min(Duration::from_millis(50)));
    handle.join()
}
