//! A per-port buffered serial I/O engine mediating between network clients
//! and line-oriented, flow-controlled serial devices.
//!
//! `flowport` owns the buffered dispatch loop for a single device
//! connection: four prioritized, admission-controlled queues (control,
//! priority, normal, meta), a pluggable [`Handler`] that enforces
//! device-specific buffer-capacity accounting and response correlation, and
//! a callback dispatcher that delivers read lines and command lifecycle
//! events back to the embedder in order.
//!
//! The included [`grbl`] module is a worked `Handler` for Grbl-family CNC
//! controllers.
//!
//! # Example
//! ```no_run
//! # fn example() -> flowport::Result<()> {
//! use flowport::{EngineBuilder, grbl::GrblHandler};
//!
//! let engine = EngineBuilder::new()
//!     .handler(GrblHandler::new())
//!     .on_read(|line| println!("< {line}"))
//!     .on_update(|resp| println!("{resp:?}"))
//!     .build_serial("/dev/ttyUSB0", 115200)?;
//!
//! engine.queue_command("move-1", "G0 X10 Y10")?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod builder;
pub mod engine;
pub mod flow;
pub mod grbl;
pub mod handler;
pub mod queue;
pub mod scanner;
pub mod transport;
pub mod types;

pub use builder::EngineBuilder;
pub use engine::Engine;
pub use flow::FlowConfig;
pub use handler::{Handler, NoopHandler};
pub use queue::Queue;
pub use transport::DuplexStream;
pub use types::{ByteLenable, CommandResponse, QueueItem};

/// Errors surfaced across the engine's programmatic boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// The engine (or one of its internal queues) is closed; no further
    /// submissions are accepted.
    #[error("engine closed")]
    Closed,
    /// A malformed or unrecognized protocol exchange (e.g. an unknown meta
    /// command, or a device error response).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The device reported a reset; in-flight commands were discarded.
    #[error("device reset")]
    Reset,
    /// A submission was rejected at the admission boundary.
    #[error("admission rejected: {0}")]
    Admission(String),
    /// An unrecoverable I/O failure; the engine tears itself down after
    /// surfacing this once.
    #[error(transparent)]
    Fatal(#[from] std::io::Error),
    /// A `Handler` implementation violated its own contract (e.g. responded
    /// to a line it never admitted).
    #[error("handler invariant violated: {0}")]
    HandlerInvariant(String),
}

// `std::io::Error` has no `PartialEq`, so this can't be derived; `Fatal`
// variants compare by `ErrorKind`, which is the most specific equality
// `io::Error` supports.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Closed, Error::Closed) => true,
            (Error::Protocol(a), Error::Protocol(b)) => a == b,
            (Error::Reset, Error::Reset) => true,
            (Error::Admission(a), Error::Admission(b)) => a == b,
            (Error::Fatal(a), Error::Fatal(b)) => a.kind() == b.kind(),
            (Error::HandlerInvariant(a), Error::HandlerInvariant(b)) => a == b,
            _ => false,
        }
    }
}

/// The result type used throughout the engine's public API.
pub type Result<T> = std::result::Result<T, Error>;
