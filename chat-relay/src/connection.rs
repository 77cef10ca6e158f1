use std::{
    fmt, io, mem,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
};
use tracing::debug;

const DELIMITER: u8 = b'\n';

/// Longest line, excluding the newline, a [`LineReader`] accepts by default.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a process-unique id. Ids increase in accept order.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Newline-framed reader over a buffered byte stream.
///
/// Partially read bytes stay in the internal buffer until a full line is
/// available, so `read_line` can be raced in `select!` without losing data.
/// A line longer than the configured maximum fails with `InvalidData`.
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
    max_length: usize,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_max_length(inner, MAX_LINE_LENGTH)
    }

    pub fn with_max_length(inner: R, max_length: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            max_length,
        }
    }

    /// Reads the next line and rejects bytes that are not valid UTF-8.
    ///
    /// Returns `Ok(None)` at end of stream. An unterminated trailing fragment
    /// is discarded.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.next_frame().await? {
            Some(frame) => String::from_utf8(frame)
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            None => Ok(None),
        }
    }

    /// Reads the next line, replacing invalid UTF-8 sequences instead of failing.
    pub async fn read_line_lossy(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .next_frame()
            .await?
            .map(|frame| String::from_utf8_lossy(&frame).into_owned()))
    }

    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        // One byte of headroom for the newline itself.
        let budget = (self.max_length + 1).saturating_sub(self.pending.len()) as u64;

        // read_until appends whatever it consumed even if this future is dropped.
        (&mut self.inner)
            .take(budget)
            .read_until(DELIMITER, &mut self.pending)
            .await?;

        if self.pending.last() == Some(&DELIMITER) {
            let mut frame = mem::take(&mut self.pending);
            frame.pop();
            return Ok(Some(frame));
        }

        if self.pending.len() > self.max_length {
            self.pending.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", self.max_length),
            ));
        }

        self.pending.clear();
        Ok(None)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one accepted client, shared between its own session and any
/// session that fans a message out to it.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    // One writer at a time; every send is a single whole-line write.
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new<W>(id: ConnectionId, peer: Option<SocketAddr>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            peer,
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes `text` followed by a newline and flushes it.
    ///
    /// Failures are never retried. The caller decides whether the connection
    /// should be torn down.
    ///
    /// A write stalled on a peer that stopped reading is abandoned as soon as
    /// [`close`](Connection::close) is called, so the writer lock is released.
    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(DELIMITER);

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(SendError::Closed)?;
        select! {
            biased;
            _ = self.closed() => Err(SendError::Closed),
            written = async {
                writer.write_all(&frame).await?;
                writer.flush().await?;
                Ok::<_, io::Error>(())
            } => written.map_err(SendError::Io),
        }
    }

    /// Shuts the write half down and wakes anything waiting in [`closed`].
    /// Safe to call any number of times.
    ///
    /// [`closed`]: Connection::closed
    pub async fn close(&self) {
        self.closed.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                debug!(connection = %self.id, ?error, "failed to shut down writer");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Connection::close) has been called.
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        loop {
            let closed = *receiver.borrow_and_update();
            if closed || receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
