//! Bounded line reader shared by the control FIFO and the interactive prompt.
//!
//! `\n` and `\r` both end a line. A line longer than the limit is dropped whole and
//! reading resumes after its terminator. A final unterminated line is still delivered.

use std::io::{self, BufRead, BufReader, Read};

use crate::lifecycle::ShutdownToken;

/// How much of a dropped line to show in the warning.
const DROPPED_PREFIX_LEN: usize = 32;

pub struct LineReader<R> {
    inner: BufReader<R>,
    /// Maximum line length including the terminator.
    max_len: usize,
    keep_blank: bool,
    cancel: Option<ShutdownToken>,
    line: Vec<u8>,
    dropped: Option<Vec<u8>>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_len: max_len.max(2),
            keep_blank: false,
            cancel: None,
            line: Vec::new(),
            dropped: None,
        }
    }

    /// Deliver blank lines as empty strings instead of skipping them.
    pub fn keep_blank(mut self) -> Self {
        self.keep_blank = true;
        self
    }

    /// Stop with `Ok(None)` once `token` is requested.
    pub fn with_cancel(mut self, token: ShutdownToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Next line without its terminator, or `None` at end of input.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.cancel.as_ref().is_some_and(ShutdownToken::is_requested) {
                return Ok(None);
            }
            let available = match self.inner.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                if self.line.is_empty() && self.dropped.is_none() {
                    return Ok(None);
                }
                return Ok(self.finish_line());
            }
            let (chunk, terminated) =
                match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
                    Some(i) => (&available[..i], true),
                    None => (available, false),
                };
            let consumed = chunk.len() + usize::from(terminated);
            append(&mut self.line, &mut self.dropped, self.max_len - 1, chunk);
            self.inner.consume(consumed);
            if terminated {
                if let Some(line) = self.finish_line() {
                    return Ok(Some(line));
                }
            }
        }
    }

    /// Close out the current line; `None` if it was dropped or skipped.
    fn finish_line(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.line);
        if let Some(prefix) = self.dropped.take() {
            tracing::warn!(
                max_len = self.max_len,
                prefix = %String::from_utf8_lossy(&prefix),
                "dropping over-length line"
            );
            return None;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        if text.trim().is_empty() && !self.keep_blank {
            return None;
        }
        Some(text)
    }
}

impl<R: Read> Iterator for LineReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

fn append(line: &mut Vec<u8>, dropped: &mut Option<Vec<u8>>, max_content: usize, chunk: &[u8]) {
    if dropped.is_some() {
        return;
    }
    if line.len() + chunk.len() > max_content {
        let mut prefix = std::mem::take(line);
        prefix.extend_from_slice(chunk);
        prefix.truncate(DROPPED_PREFIX_LEN);
        *dropped = Some(prefix);
        return;
    }
    line.extend_from_slice(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines(input: &[u8], max_len: usize) -> Vec<String> {
        LineReader::new(Cursor::new(input.to_vec()), max_len)
            .map(|l| l.unwrap())
            .collect()
    }

    #[test]
    fn splits_on_newline_and_carriage_return() {
        assert_eq!(lines(b"play a.wav\npause\r\nstop\rexit\n", 1024), [
            "play a.wav",
            "pause",
            "stop",
            "exit"
        ]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(lines(b"\n\n  \npause\n\n", 1024), ["pause"]);
    }

    #[test]
    fn final_unterminated_line_is_delivered() {
        assert_eq!(lines(b"pause\nstop", 1024), ["pause", "stop"]);
    }

    #[test]
    fn over_length_line_is_dropped_and_scanning_resumes() {
        let mut input = vec![b'x'; 40];
        input.extend_from_slice(b"\nstop\n");
        assert_eq!(lines(&input, 16), ["stop"]);
    }

    #[test]
    fn limit_includes_terminator() {
        // 15 content bytes fit in 16, 16 do not.
        let input = b"play 0123456789\nplay 01234567890\npause\n";
        assert_eq!(lines(input, 16), ["play 0123456789", "pause"]);
    }

    #[test]
    fn long_line_across_buffer_refills() {
        let mut input = vec![b'y'; 20_000];
        input.push(b'\n');
        input.extend_from_slice(b"resume\n");
        assert_eq!(lines(&input, 1024), ["resume"]);
    }

    #[test]
    fn keep_blank_delivers_empty_lines() {
        let got: Vec<String> = LineReader::new(Cursor::new(b"\nhelp\n".to_vec()), 64)
            .keep_blank()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(got, ["", "help"]);
    }

    #[test]
    fn keep_blank_ends_at_end_of_input() {
        let mut reader = LineReader::new(Cursor::new(b"pause\n".to_vec()), 64).keep_blank();
        assert_eq!(reader.next_line().unwrap().as_deref(), Some("pause"));
        assert!(reader.next_line().unwrap().is_none());
        assert!(reader.next_line().unwrap().is_none());

        let mut empty = LineReader::new(Cursor::new(Vec::new()), 64).keep_blank();
        assert!(empty.next_line().unwrap().is_none());
    }

    #[test]
    fn over_length_final_line_ends_input() {
        let mut reader = LineReader::new(Cursor::new(vec![b'z'; 100]), 16).keep_blank();
        assert!(reader.next_line().unwrap().is_none());
        assert!(reader.next_line().unwrap().is_none());
    }

    #[test]
    fn cancelled_reader_stops() {
        let token = ShutdownToken::new();
        token.request();
        let mut reader = LineReader::new(Cursor::new(b"pause\n".to_vec()), 64).with_cancel(token);
        assert!(reader.next_line().unwrap().is_none());
    }
}
