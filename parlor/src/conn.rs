//! Transport-facing interfaces.
//!
//! The chat core never touches sockets or terminals directly. A transport
//! supplies a [`Connection`] describing the client and a [`Terminal`] for
//! reading input lines; output goes to any [`tokio::io::AsyncWrite`].
//!
//! [`Peer`] and [`LineTerminal`] are plain implementations for line-based
//! transports and in-memory tests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::key::PublicKey;

/// Longest input line accepted, in bytes, terminator included.
pub const MAX_LINE_LEN: usize = 8192;

/// Errors produced while reading from a [`Terminal`].
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    /// The client disconnected.
    #[error("end of input")]
    Eof,

    /// The line was longer than the terminal accepts. The rest of it has
    /// been discarded; the next read starts on the following line.
    #[error("line exceeds {limit} bytes")]
    LineTooLong {
        /// Byte limit that was exceeded.
        limit: usize,
    },

    /// The underlying stream failed.
    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tab-completion callback: given the line and cursor position, returns the
/// completed line and new cursor position, or `None` to leave it alone.
pub type Completer = Arc<dyn Fn(&str, usize) -> Option<(String, usize)> + Send + Sync>;

/// An authenticated client connection.
pub trait Connection: Send + Sync {
    /// Name the client asked for.
    fn name(&self) -> String;

    /// Credential the client presented, if any.
    fn public_key(&self) -> Option<PublicKey>;

    /// Remote address, if the transport has one.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Client software version string.
    fn client_version(&self) -> String;

    /// Tears the connection down.
    fn close(&self);
}

/// The input side of a client's terminal.
pub trait Terminal: Send {
    /// Reads the next line, without its terminator.
    ///
    /// Returns [`TerminalError::Eof`] once the client is gone.
    fn read_line(&mut self) -> impl Future<Output = Result<String, TerminalError>> + Send;

    /// Sets the input prompt.
    fn set_prompt(&mut self, prompt: &str);

    /// Installs the tab-completion callback.
    fn set_autocomplete(&mut self, completer: Completer);
}

/// A [`Connection`] whose details are fixed at construction.
#[derive(Debug, Default)]
pub struct Peer {
    name: String,
    key: Option<PublicKey>,
    addr: Option<SocketAddr>,
    client: String,
    closed: AtomicBool,
}

impl Peer {
    /// Creates a peer with no key, address, or client string.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the presented credential.
    #[must_use]
    pub fn with_key(mut self, key: PublicKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Sets the remote address.
    #[must_use]
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Sets the client version string.
    #[must_use]
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Connection for Peer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn public_key(&self) -> Option<PublicKey> {
        self.key.clone()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn client_version(&self) -> String {
        self.client.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A [`Terminal`] reading newline-terminated input from a byte stream.
///
/// There is no line editing; the prompt and completer are recorded for the
/// transport to use.
pub struct LineTerminal<R> {
    reader: R,
    prompt: String,
    completer: Option<Completer>,
}

impl<R> LineTerminal<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Wraps a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            prompt: String::new(),
            completer: None,
        }
    }

    /// Current prompt.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Skips input up to and including the next newline.
    async fn discard_line(&mut self) -> std::io::Result<()> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.reader.consume(end + 1);
                    return Ok(());
                }
                None => {
                    let len = buf.len();
                    self.reader.consume(len);
                }
            }
        }
    }

    /// Runs the installed completer on `line` with the cursor at its end.
    #[must_use]
    pub fn complete(&self, line: &str) -> Option<String> {
        let completer = self.completer.as_ref()?;
        completer(line, line.len()).map(|(line, _)| line)
    }
}

impl<R> Terminal for LineTerminal<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn read_line(&mut self) -> Result<String, TerminalError> {
        let mut raw = Vec::new();
        let limit = u64::try_from(MAX_LINE_LEN).unwrap_or(u64::MAX);
        if (&mut self.reader).take(limit).read_until(b'\n', &mut raw).await? == 0 {
            return Err(TerminalError::Eof);
        }
        if raw.len() >= MAX_LINE_LEN && raw.last() != Some(&b'\n') {
            self.discard_line().await?;
            return Err(TerminalError::LineTooLong {
                limit: MAX_LINE_LEN,
            });
        }
        let line = String::from_utf8_lossy(&raw);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn set_prompt(&mut self, prompt: &str) {
        self.prompt = prompt.to_string();
    }

    fn set_autocomplete(&mut self, completer: Completer) {
        self.completer = Some(completer);
    }
}
