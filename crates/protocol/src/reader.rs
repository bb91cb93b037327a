/*
 * Petrel mail delivery agent
 *
 * Copyright (C) 2003 - viridIT SAS
 * Licensed under the Elastic License 2.0
 *
 * You should have received a copy of the Elastic License 2.0 along with
 * this program. If not, see https://www.elastic.co/licensing/elastic-license.
 *
 */

use crate::{transcript::Transcript, types::reply::ReplyBuilder, Reply};
use tokio::io::AsyncReadExt;

/// Every client must accept reply lines of at least this size, RFC 5321
/// section 4.5.3.1.5. Used as the floor of the per-line budget so that a
/// tiny text cap can never clip the status prefix away.
const LINE_FLOOR: usize = 512;

/// Replace everything that is not printable ASCII before the line is
/// stored, logged or mailed to the postmaster.
fn sanitize(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| {
            if byte.is_ascii_graphic() || *byte == b' ' {
                char::from(*byte)
            } else {
                '?'
            }
        })
        .collect()
}

/// Reads server replies from the session stream.
///
/// The internal buffer survives between calls: under pipelining several
/// replies often arrive in one segment and the surplus must be kept for the
/// next read.
pub struct Reader<R: tokio::io::AsyncRead + Unpin + Send> {
    inner: R,
    buffer: bytes::BytesMut,
    reply_text_cap: usize,
    additional_reserve: usize,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> Reader<R> {
    /// Create a new reader. `reply_text_cap` bounds how many bytes of one
    /// reply are kept; everything past it is still read off the socket but
    /// dropped, so a hostile peer cannot grow our memory with an endless
    /// multi-line reply.
    #[must_use]
    #[inline]
    pub fn new(inner: R, reply_text_cap: usize) -> Self {
        Self {
            inner,
            buffer: bytes::BytesMut::with_capacity(80),
            reply_text_cap,
            additional_reserve: 100,
        }
    }

    /// Consume the instance and return the underlying reader, dropping any
    /// bytes buffered past the last consumed reply.
    #[inline]
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Produce a stream of reply lines, terminators stripped and content
    /// sanitized. A line longer than the per-line budget is clipped to it,
    /// the rest of the line being read and discarded.
    fn as_line_stream(&mut self) -> impl tokio_stream::Stream<Item = std::io::Result<String>> + '_ {
        let line_limit = self.reply_text_cap.max(LINE_FLOOR);

        async_stream::try_stream! {
            // holds the clipped head of an oversized line until its
            // terminator has been found and swallowed.
            let mut clipped: Option<String> = None;

            loop {
                if let Some(pos) = memchr::memchr(b'\n', &self.buffer) {
                    let raw = self.buffer.split_to(pos + 1);
                    let line = match clipped.take() {
                        Some(head) => head,
                        None => {
                            let end = raw.len()
                                - if pos > 0 && raw.get(pos - 1) == Some(&b'\r') { 2 } else { 1 };
                            sanitize(raw.get(..end).unwrap_or_default())
                        }
                    };
                    yield line;
                    continue;
                }

                if self.buffer.len() > line_limit {
                    if clipped.is_none() {
                        let head = self.buffer.split_to(line_limit);
                        clipped = Some(sanitize(&head));
                    }
                    self.buffer.clear();
                }

                self.buffer.reserve(self.additional_reserve);
                let read_size = self.inner.read_buf(&mut self.buffer).await?;
                if read_size == 0 {
                    ensure_clean_eof(!self.buffer.is_empty() || clipped.is_some())?;
                    return;
                }
            }
        }
    }

    /// Read one complete (possibly multi-line) reply.
    ///
    /// Every raw line is appended to `transcript`, whether or not it parses;
    /// a line that is not a valid status line only flags the reply, reading
    /// goes on until a well-formed terminating line arrives.
    ///
    /// # Errors
    ///
    /// * the peer closed the connection before the terminating line
    /// * [`std::io::Error`] produced by the underlying reader
    #[inline]
    pub async fn read_reply(&mut self, transcript: &mut Transcript) -> std::io::Result<Reply> {
        use tokio_stream::StreamExt;

        let mut builder = ReplyBuilder::new(self.reply_text_cap);
        {
            let line_stream = self.as_line_stream();
            tokio::pin!(line_stream);

            while let Some(line) = line_stream.next().await {
                let line = line?;
                tracing::trace!("<< {:?}", line);
                transcript.reply_line(&line);
                if builder.push_line(&line) {
                    break;
                }
            }
        }

        builder.finish().ok_or_else(lost_connection)
    }
}

fn lost_connection() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "lost connection with the peer",
    )
}

fn ensure_clean_eof(line_pending: bool) -> std::io::Result<()> {
    if line_pending {
        Err(lost_connection())
    } else {
        Ok(())
    }
}
