//! Construction surface for [`crate::Engine`].
//!
//! Grounded in `examples/MazinLab-jpe/src/builder.rs`'s type-state builder,
//! simplified to a single state: every field but the handler is optional
//! and defaults sensibly, so there is no invalid intermediate state to
//! guard against with marker types.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::handler::{Handler, NoopHandler};
use crate::transport::DuplexStream;
use crate::types::CommandResponse;

/// Builds an [`Engine`] from a `Handler` plus optional callbacks, a poll
/// interval, and a transport.
pub struct EngineBuilder {
    handler: Arc<dyn Handler>,
    on_read: Arc<dyn Fn(String) + Send + Sync>,
    on_update: Arc<dyn Fn(CommandResponse) + Send + Sync>,
    poll_interval: Option<Duration>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            handler: Arc::new(NoopHandler),
            on_read: Arc::new(|_| {}),
            on_update: Arc::new(|_| {}),
            poll_interval: None,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the protocol `Handler`. Defaults to [`NoopHandler`] (everything
    /// admitted immediately, nothing ever paused).
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Called on the callback thread for each line read from the device.
    /// Defaults to a no-op.
    pub fn on_read(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_read = Arc::new(f);
        self
    }

    /// Called on the callback thread for each command lifecycle event.
    /// Defaults to a no-op.
    pub fn on_update(mut self, f: impl Fn(CommandResponse) + Send + Sync + 'static) -> Self {
        self.on_update = Arc::new(f);
        self
    }

    /// Enables the poll task, calling `Handler::poll_command` every
    /// `interval` and queuing its result (if any) like any other
    /// submission. Disabled (the default) when never called.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Builds the engine over an already-connected duplex stream.
    pub fn build<S>(self, stream: S) -> crate::Result<Engine>
    where
        S: DuplexStream,
    {
        let (reader, writer) = stream.split()?;
        Ok(Engine::spawn(
            reader,
            writer,
            self.handler,
            self.on_read,
            self.on_update,
            self.poll_interval,
        ))
    }

    /// Opens a serial port at `baud_rate` and builds the engine over it.
    #[cfg(feature = "serial")]
    pub fn build_serial(self, path: &str, baud_rate: u32) -> crate::Result<Engine> {
        let port = serial2::SerialPort::open(path, baud_rate)?;
        self.build(port)
    }

    /// Connects to `addr` over TCP and builds the engine over the
    /// resulting stream.
    #[cfg(feature = "net")]
    pub fn build_tcp(self, addr: impl std::net::ToSocketAddrs) -> crate::Result<Engine> {
        let stream = std::net::TcpStream::connect(addr)?;
        self.build(stream)
    }
}
