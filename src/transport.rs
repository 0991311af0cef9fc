//! Splits a duplex byte stream into independently-owned read/write halves.
//!
//! The engine's reader thread and its dispatch thread's writes must never
//! contend on a shared lock (spec.md §5: "no other task writes to it after
//! construction"). Grounded in `examples/MazinLab-jpe/src/transport.rs`'s
//! `Connection`/`BufClear` pair, generalized here to a small trait so either
//! half can be handed to its own thread.

use std::io::{Read, Write};

use crate::Error;

/// A bidirectional byte stream that can be split into an owned reader and
/// an owned writer, so each can live on its own thread.
pub trait DuplexStream {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;

    fn split(self) -> Result<(Self::Reader, Self::Writer), Error>;
}

#[cfg(feature = "net")]
mod net_impl {
    use super::*;
    use std::net::TcpStream;

    impl DuplexStream for TcpStream {
        type Reader = TcpStream;
        type Writer = TcpStream;

        fn split(self) -> Result<(TcpStream, TcpStream), Error> {
            let writer = self.try_clone()?;
            Ok((self, writer))
        }
    }
}

#[cfg(feature = "serial")]
mod serial_impl {
    use super::*;
    use serial2::SerialPort;

    impl DuplexStream for SerialPort {
        type Reader = SerialPort;
        type Writer = SerialPort;

        fn split(self) -> Result<(SerialPort, SerialPort), Error> {
            let writer = self.try_clone()?;
            Ok((self, writer))
        }
    }
}
