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

/// Bounded record of a session's dialogue, one entry per wire line, kept so
/// the postmaster can be shown what the remote server actually said.
///
/// Message content is never recorded, only commands and replies. Once the
/// line budget is spent further lines are counted but not stored.
#[derive(Debug, Default)]
pub struct Transcript {
    lines: Vec<String>,
    limit: usize,
    skipped: usize,
}

impl Transcript {
    /// Default number of stored lines when no limit is configured.
    pub const DEFAULT_LIMIT: usize = 200;

    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            limit,
            skipped: 0,
        }
    }

    /// Record one command we sent. The CRLF is stripped for readability.
    pub fn command(&mut self, line: &str) {
        self.push(format!("Out: {}", line.trim_end_matches("\r\n")));
    }

    /// Record one raw reply line received from the server.
    pub fn reply_line(&mut self, line: &str) {
        self.push(format!("In:  {line}"));
    }

    fn push(&mut self, entry: String) {
        if self.lines.len() < self.limit {
            self.lines.push(entry);
        } else {
            self.skipped += 1;
        }
    }

    /// Nothing was exchanged on this session.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.skipped == 0
    }

    /// Stored lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Render the whole dialogue, with a trailer when lines were dropped.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.skipped > 0 {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("({} lines omitted)", self.skipped));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::Transcript;

    #[test]
    fn records_both_directions() {
        let mut transcript = Transcript::new(Transcript::DEFAULT_LIMIT);
        assert!(transcript.is_empty());

        transcript.command("MAIL FROM:<a@b.tld>\r\n");
        transcript.reply_line("250 Ok");
        assert!(!transcript.is_empty());

        pretty_assertions::assert_eq!(
            transcript.render(),
            "Out: MAIL FROM:<a@b.tld>\nIn:  250 Ok"
        );
    }

    #[test]
    fn bounded() {
        let mut transcript = Transcript::new(2);
        for _ in 0..5 {
            transcript.reply_line("451 try again later");
        }
        pretty_assertions::assert_eq!(transcript.lines().count(), 2);
        assert!(transcript.render().ends_with("(3 lines omitted)"));
    }

    #[test]
    fn zero_limit_still_counts() {
        let mut transcript = Transcript::new(0);
        transcript.command("QUIT\r\n");
        assert!(!transcript.is_empty());
        pretty_assertions::assert_eq!(transcript.render(), "(1 lines omitted)");
    }
}
