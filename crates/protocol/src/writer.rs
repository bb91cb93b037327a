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

use tokio::io::AsyncWriteExt;

/// Sink for sending commands and message content to the server.
pub struct Writer<W: tokio::io::AsyncWrite + Unpin + Send> {
    inner: W,
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> AsMut<W> for Writer<W> {
    #[inline]
    fn as_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> Writer<W> {
    /// Create a new instance
    #[inline]
    #[must_use]
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consume the instance and return the underlying writer.
    #[inline]
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Send one command line to the server.
    ///
    /// # Errors
    ///
    /// * [`std::io::Error`] produced by the underlying writer
    #[inline]
    pub async fn write_all(&mut self, buffer: &str) -> std::io::Result<()> {
        tracing::trace!(">> {:?}", buffer);
        self.write_all_bytes(buffer.as_bytes()).await
    }

    /// Send a raw buffer to the server, without tracing it. Used for message
    /// content, which is not worth a line in the logs.
    ///
    /// # Errors
    ///
    /// * [`std::io::Error`] produced by the underlying writer
    #[inline]
    pub async fn write_all_bytes(&mut self, buffer: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buffer).await
    }

    /// Push everything buffered by the transport down to the peer.
    ///
    /// # Errors
    ///
    /// * [`std::io::Error`] produced by the underlying writer
    #[inline]
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

/// Turns queue records into DATA-phase bytes.
///
/// Bridges the impedance mismatch between stored records (bounded by the
/// queue's own line length) and what the wire allows: output lines are
/// folded at `limit` bytes, each folded continuation starting with a single
/// space, and a `.` at the start of an output line is doubled so it cannot
/// terminate the transfer early (RFC 5321 section 4.5.2).
///
/// The encoder is plain state over bytes, no I/O, so the tricky cases are
/// testable without a socket.
#[derive(Debug)]
pub struct BodyEncoder {
    limit: usize,
    space_left: usize,
    at_line_start: bool,
}

impl BodyEncoder {
    /// `limit` is the longest output line to produce, `0` disables folding.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            space_left: limit,
            at_line_start: true,
        }
    }

    /// Encode one record into `out`.
    ///
    /// A record with `continues` set carries a partial line: its bytes are
    /// emitted without a terminator and the line goes on in the next record.
    /// Otherwise the record is a complete line and CRLF is appended.
    pub fn record(&mut self, continues: bool, record: &[u8], out: &mut Vec<u8>) {
        let mut rest = record;

        loop {
            if self.at_line_start && rest.first() == Some(&b'.') {
                out.push(b'.');
            }

            if self.limit > 0 && rest.len() >= self.space_left {
                // fold: the CRLF emitted here doubles as the record
                // terminator when the record ends exactly at the limit.
                let (chunk, tail) = rest.split_at(self.space_left);
                out.extend_from_slice(chunk);
                out.extend_from_slice(b"\r\n");
                rest = tail;
                self.space_left = self.limit;
                self.at_line_start = true;

                if !rest.is_empty() || continues {
                    out.push(b' ');
                    self.space_left -= 1;
                    self.at_line_start = false;
                }
                if rest.is_empty() {
                    return;
                }
            } else {
                out.extend_from_slice(rest);
                if continues {
                    self.space_left = self.space_left.saturating_sub(rest.len());
                    self.at_line_start = self.at_line_start && rest.is_empty();
                } else {
                    out.extend_from_slice(b"\r\n");
                    self.space_left = self.limit;
                    self.at_line_start = true;
                }
                return;
            }
        }
    }

    /// Terminate a line left open by a trailing continuation record, so the
    /// content always ends with CRLF before the final `.` goes out.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.at_line_start {
            out.extend_from_slice(b"\r\n");
            self.space_left = self.limit;
            self.at_line_start = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BodyEncoder;

    fn encode(limit: usize, records: &[(bool, &[u8])]) -> Vec<u8> {
        let mut encoder = BodyEncoder::new(limit);
        let mut out = Vec::new();
        for (continues, record) in records {
            encoder.record(*continues, record, &mut out);
        }
        encoder.finish(&mut out);
        out
    }

    #[test]
    fn plain_lines() {
        let out = encode(998, &[(false, b"hello"), (false, b"world")]);
        pretty_assertions::assert_eq!(out, b"hello\r\nworld\r\n");
    }

    #[test]
    fn leading_dot_is_doubled() {
        let out = encode(998, &[(false, b".hidden"), (false, b"..already")]);
        pretty_assertions::assert_eq!(out, b"..hidden\r\n...already\r\n");
    }

    #[test]
    fn dot_inside_a_line_is_left_alone() {
        let out = encode(998, &[(false, b"a.b.c")]);
        pretty_assertions::assert_eq!(out, b"a.b.c\r\n");
    }

    #[test]
    fn continuation_records_join_without_breaks() {
        let out = encode(998, &[(true, b"one "), (true, b"long "), (false, b"line")]);
        pretty_assertions::assert_eq!(out, b"one long line\r\n");
    }

    #[test]
    fn dot_at_start_of_joined_line() {
        // only the first fragment sits at the line start
        let out = encode(998, &[(true, b"."), (false, b".rest")]);
        pretty_assertions::assert_eq!(out, b"...rest\r\n");
    }

    #[test]
    fn folds_long_lines_with_leading_space() {
        let out = encode(10, &[(false, b"abcdefghijklmno")]);
        pretty_assertions::assert_eq!(out, b"abcdefghij\r\n klmno\r\n");
    }

    #[test]
    fn line_exactly_at_the_limit_is_not_split() {
        let out = encode(10, &[(false, b"abcdefghij")]);
        pretty_assertions::assert_eq!(out, b"abcdefghij\r\n");
    }

    #[test]
    fn folded_continuation_is_never_dot_stuffed() {
        // the dot lands right after the fold, but behind the marker space
        let out = encode(4, &[(false, b"abcd.efg")]);
        pretty_assertions::assert_eq!(out, b"abcd\r\n .ef\r\n g\r\n");
    }

    #[test]
    fn zero_limit_disables_folding() {
        let long = vec![b'x'; 5000];
        let mut records = vec![(false, long.as_slice())];
        records.push((false, b".dot"));
        let out = encode(0, &records);

        let mut expected = long.clone();
        expected.extend_from_slice(b"\r\n..dot\r\n");
        pretty_assertions::assert_eq!(out, expected);
    }

    #[test]
    fn trailing_continuation_is_closed() {
        let out = encode(998, &[(false, b"done"), (true, b"no terminator")]);
        pretty_assertions::assert_eq!(out, b"done\r\nno terminator\r\n");
    }

    #[test]
    fn empty_records() {
        let out = encode(998, &[(false, b""), (false, b"x")]);
        pretty_assertions::assert_eq!(out, b"\r\nx\r\n");
    }
}
