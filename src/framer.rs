//! Newline-delimited JSON framing over tokio byte streams.
//!
//! Workers speak one JSON object per line on stdin/stdout. A line that does
//! not parse is logged and dropped; it never ends the stream.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::{error::MuxError, message::Message};

/// What a read produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    /// The writer closed its end. Terminal.
    EndOfStream,
}

pub struct LineReader<R> {
    inner: R,
    origin: String,
    line: String,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// `origin` names the stream in log lines, usually the worker name.
    pub fn new(inner: R, origin: impl Into<String>) -> Self {
        Self {
            inner,
            origin: origin.into(),
            line: String::new(),
            finished: false,
        }
    }

    /// Block until the next well-formed message or end of stream.
    ///
    /// Once [`Frame::EndOfStream`] has been returned the underlying stream
    /// is not read again.
    pub async fn read_message(&mut self) -> Result<Frame, MuxError> {
        while !self.finished {
            self.line.clear();
            if self.inner.read_line(&mut self.line).await? == 0 {
                self.finished = true;
                break;
            }
            let text = self.line.trim_end_matches(['\n', '\r']);
            if text.trim().is_empty() {
                continue;
            }
            match Message::parse(text) {
                Ok(msg) => return Ok(Frame::Message(msg)),
                Err(reason) => {
                    let err = MuxError::MalformedMessage {
                        origin: self.origin.clone(),
                        reason,
                    };
                    warn!(worker = %self.origin, error = %err, "dropping line");
                }
            }
        }
        Ok(Frame::EndOfStream)
    }

    /// Raw text lines, for streams that are logged instead of parsed.
    pub async fn read_text(&mut self) -> Result<Option<String>, MuxError> {
        if self.finished {
            return Ok(None);
        }
        self.line.clear();
        if self.inner.read_line(&mut self.line).await? == 0 {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(self.line.trim_end().to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize fully, write the line plus `\n`, then flush. A second write
    /// on the same writer needs `&mut self`, so lines never interleave.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), std::io::Error> {
        let mut line = msg.to_json().map_err(std::io::Error::other)?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await
    }
}
