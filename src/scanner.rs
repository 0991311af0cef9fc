//! A generic `bufio.Scanner`-equivalent: drives a [`SplitFn`] tokenizer over
//! a growing byte buffer fed by chunked reads.
//!
//! Grounded in `examples/MazinLab-jpe/src/transport.rs`'s `read_chunks` (chunk
//! size, `WouldBlock`/`TimedOut` tolerance, overflow detection) and in
//! `original_source/buffer/buffer.go`'s use of `bufio.Scanner` with a
//! `SplitFunc`.

use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};

use crate::Error;

const READ_CHUNK_SIZE: usize = 64;
/// Matches the teacher's `MAX_FRAME_SIZE`; a tokenized unit larger than this
/// is considered a malformed/runaway stream rather than a slow device.
pub const MAX_TOKEN_SIZE: usize = 4096;

/// Examines `data`; `at_eof` is true once the underlying reader has hit EOF.
/// Returns `(consumed, Some(token))` when a full token was found at the
/// front of `data`, or `(0, None)` when more bytes are needed.
pub type SplitFn = Box<dyn Fn(&[u8], bool) -> Result<(usize, Option<Vec<u8>>), Error> + Send + Sync>;

/// The default tokenizer: splits on `\n`, tolerating and stripping a
/// preceding `\r` (CR/LF or bare LF line endings).
pub fn scan_lines(data: &[u8], at_eof: bool) -> Result<(usize, Option<Vec<u8>>), Error> {
    if let Some(pos) = data.iter().position(|&b| b == b'\n') {
        let mut end = pos;
        if end > 0 && data[end - 1] == b'\r' {
            end -= 1;
        }
        return Ok((pos + 1, Some(data[..end].to_vec())));
    }
    if at_eof && !data.is_empty() {
        return Ok((data.len(), Some(data.to_vec())));
    }
    Ok((0, None))
}

/// Drives `split` over chunked reads from `r`, invoking `on_token` for each
/// complete token. Runs until the stream returns `Ok(0)` (EOF) or an error
/// other than `WouldBlock`/`TimedOut`.
pub struct Scanner<R: Read> {
    reader: R,
    buf: BytesMut,
    split: SplitFn,
}

impl<R: Read> Scanner<R> {
    pub fn new(reader: R, split: SplitFn) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(MAX_TOKEN_SIZE),
            split,
        }
    }

    /// Blocks until one token is available, EOF is reached (`Ok(None)`), or
    /// an I/O error (other than transient would-block/timeout) occurs.
    pub fn next_token(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            let (consumed, token) = (self.split)(&self.buf, false)?;
            if let Some(token) = token {
                self.buf.advance(consumed);
                return Ok(Some(token));
            }

            if self.buf.len() > MAX_TOKEN_SIZE {
                self.buf.clear();
                return Err(Error::Protocol(format!(
                    "token exceeded {MAX_TOKEN_SIZE} bytes without a terminator"
                )));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    let (consumed, token) = (self.split)(&self.buf, true)?;
                    if let Some(token) = token {
                        self.buf.advance(consumed);
                        return Ok(Some(token));
                    }
                    return Ok(None);
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(Error::Fatal(e)),
            }
        }
    }
}

/// Tokenizes an in-memory byte slice in full, as opposed to [`Scanner`]
/// which drives `split` incrementally over chunked reads. Used to split a
/// single client submission into its constituent lines without spinning up
/// a reader thread for it.
pub fn tokenize_all(split: &SplitFn, mut data: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let mut tokens = Vec::new();
    while !data.is_empty() {
        let (consumed, token) = split(data, true)?;
        match token {
            Some(token) => {
                tokens.push(token);
                data = &data[consumed..];
            }
            None => break,
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn scan_lines_splits_on_lf() {
        let (consumed, tok) = scan_lines(b"abc\ndef", false).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(tok.unwrap(), b"abc");
    }

    #[test]
    fn scan_lines_strips_cr() {
        let (consumed, tok) = scan_lines(b"abc\r\ndef", false).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(tok.unwrap(), b"abc");
    }

    #[test]
    fn scan_lines_needs_more_without_terminator() {
        let (consumed, tok) = scan_lines(b"abc", false).unwrap();
        assert_eq!(consumed, 0);
        assert!(tok.is_none());
    }

    #[test]
    fn scan_lines_flushes_trailing_fragment_at_eof() {
        let (consumed, tok) = scan_lines(b"abc", true).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(tok.unwrap(), b"abc");
    }

    #[test]
    fn scanner_yields_tokens_across_chunk_boundaries() {
        let data = Cursor::new(b"ok\r\nerror:1\r\n".to_vec());
        let mut scanner = Scanner::new(data, Box::new(scan_lines));
        assert_eq!(scanner.next_token().unwrap().unwrap(), b"ok");
        assert_eq!(scanner.next_token().unwrap().unwrap(), b"error:1");
        assert_eq!(scanner.next_token().unwrap(), None);
    }

    #[test]
    fn scanner_rejects_runaway_token() {
        let data = Cursor::new(vec![b'a'; MAX_TOKEN_SIZE + 100]);
        let mut scanner = Scanner::new(data, Box::new(scan_lines));
        assert!(scanner.next_token().is_err());
    }

    #[test]
    fn tokenize_all_splits_multi_line_submission() {
        let split: SplitFn = Box::new(scan_lines);
        let tokens = tokenize_all(&split, b"G0X1\nG0Y1\nG0Z1").unwrap();
        assert_eq!(tokens, vec![b"G0X1".to_vec(), b"G0Y1".to_vec(), b"G0Z1".to_vec()]);
    }

    #[test]
    fn tokenize_all_handles_single_line_without_terminator() {
        let split: SplitFn = Box::new(scan_lines);
        let tokens = tokenize_all(&split, b"G0X1").unwrap();
        assert_eq!(tokens, vec![b"G0X1".to_vec()]);
    }
}
