//! Peer channel abstraction consumed by the installer and verifier.
//!
//! The network protocol itself lives elsewhere; this crate only needs to
//! pull the first message of a transfer and to push human-readable status
//! lines back to peers that understand them.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

/// Default chunk size used by [`FileChannel`].
pub const CHUNK_SIZE: usize = 100 * 1024;

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A piece of an environment tarball.
    FileChunk(Vec<u8>),
    /// The transfer is complete.
    End,
    /// Any other message kind, identified by name.
    Other(String),
}

impl Message {
    pub fn kind(&self) -> &str {
        match self {
            Self::FileChunk(_) => "file chunk",
            Self::End => "end",
            Self::Other(kind) => kind,
        }
    }
}

/// A bidirectional connection to a peer.
///
/// Implementations backed by a socket must open it close-on-exec so it does
/// not leak into jailed children.
pub trait Channel {
    /// Wait up to `timeout` for the next message.
    fn get_msg(&mut self, timeout: Duration) -> Option<Message>;

    /// Whether the peer's protocol version understands status text.
    fn supports_status(&self) -> bool;

    /// Send a status line. Only called when [`supports_status`](Self::supports_status) holds.
    fn send_status(&mut self, text: &str) -> io::Result<()>;
}

/// Report `text` to the peer if its protocol supports it.
pub fn report_status(channel: &mut dyn Channel, text: &str) {
    if !channel.supports_status() {
        return;
    }
    if let Err(e) = channel.send_status(text) {
        debug!(error = %e, "Failed to send status to peer");
    }
}

/// A [`Channel`] that replays a local tarball as a stream of file chunks.
///
/// Status lines are collected rather than sent anywhere.
pub struct FileChannel {
    file: File,
    chunk_size: usize,
    done: bool,
    statuses: Vec<String>,
}

impl FileChannel {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            chunk_size: CHUNK_SIZE,
            done: false,
            statuses: Vec::new(),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Status lines reported so far.
    pub fn statuses(&self) -> &[String] {
        &self.statuses
    }
}

impl Channel for FileChannel {
    fn get_msg(&mut self, _timeout: Duration) -> Option<Message> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "Reading local tarball failed");
                    self.done = true;
                    return None;
                }
            }
        }
        if filled == 0 {
            self.done = true;
            return Some(Message::End);
        }
        buf.truncate(filled);
        Some(Message::FileChunk(buf))
    }

    fn supports_status(&self) -> bool {
        true
    }

    fn send_status(&mut self, text: &str) -> io::Result<()> {
        self.statuses.push(text.to_string());
        Ok(())
    }
}
