/// Most stderr a reject line may occupy.
const MAX_REJECT: usize = 256;

/// Fallback when the filter produced no diagnostic at all.
const REJECTED: &str = "Content Rejected";

/// Distills a filter's stderr into a single reply-worthy line.
///
/// Stderr arrives in arbitrary chunks; the buffer tracks the most recent
/// non-blank line across them, so partial lines concatenate and a newline
/// followed by fresh content starts over. Whitespace-only chunks are
/// ignored entirely.
#[derive(Debug, Default)]
pub struct RejectBuffer {
    buf: Vec<u8>,
}

impl RejectBuffer {
    pub fn new() -> Self {
        RejectBuffer::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        let mut end = chunk.len();
        let mut newline = false;
        while end > 0 && chunk[end - 1].is_ascii_whitespace() {
            end -= 1;
            if chunk[end] == b'\n' {
                newline = true;
            }
        }
        let chunk = &chunk[..end];
        if chunk.is_empty() {
            return;
        }

        let line = match memchr::memrchr(b'\n', chunk) {
            Some(pos) => {
                // A complete line ended inside this chunk; whatever came
                // before it no longer matters.
                self.buf.clear();
                &chunk[pos + 1..]
            }
            None => {
                // The previous chunk finished its line, so this is fresh
                // content, not a continuation.
                if self.buf.last() == Some(&b'\n') {
                    self.buf.clear();
                }
                chunk
            }
        };

        let line = trim_start(line);
        let room = MAX_REJECT.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&line[..line.len().min(room)]);

        if newline && self.buf.len() < MAX_REJECT {
            self.buf.push(b'\n');
        }
    }

    /// The distilled reject line, or the generic fallback when the filter
    /// never said anything meaningful.
    pub fn finalize(&self) -> String {
        if self.buf.is_empty() {
            REJECTED.to_string()
        } else {
            String::from_utf8_lossy(&self.buf).trim_end().to_string()
        }
    }
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&[u8]]) -> String {
        let mut buf = RejectBuffer::new();
        for chunk in chunks {
            buf.append(chunk);
        }
        buf.finalize()
    }

    #[test]
    fn single_line_round_trips() {
        assert_eq!(collect(&[b"550 blocked\n" as &[u8]]), "550 blocked");
    }

    #[test]
    fn partial_lines_concatenate() {
        assert_eq!(
            collect(&[b"550 blo" as &[u8], b"cked by policy\n"]),
            "550 blocked by policy"
        );
    }

    #[test]
    fn last_line_wins() {
        assert_eq!(collect(&[b"first\nsecond\n" as &[u8]]), "second");
        assert_eq!(collect(&[b"first\n" as &[u8], b"second\n"]), "second");
        assert_eq!(collect(&[b"a\n" as &[u8], b"b\nc"]), "c");
    }

    #[test]
    fn whitespace_only_input_is_ignored() {
        assert_eq!(collect(&[b"   \n \t " as &[u8]]), "Content Rejected");
        assert_eq!(collect(&[]), "Content Rejected");
    }

    #[test]
    fn trailing_whitespace_after_the_line_is_dropped() {
        assert_eq!(collect(&[b"550 nope" as &[u8], b"  \r\n  "]), "550 nope");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(
            collect(&[b"  550 spam detected  \r\n" as &[u8]]),
            "550 spam detected"
        );
    }

    #[test]
    fn fresh_content_after_newline_starts_over() {
        let mut buf = RejectBuffer::new();
        buf.append(b"old line\n");
        buf.append(b"new");
        assert_eq!(buf.finalize(), "new");
    }

    #[test]
    fn appending_to_empty_buffer_is_safe() {
        let mut buf = RejectBuffer::new();
        buf.append(b"x");
        assert_eq!(buf.finalize(), "x");
    }

    #[test]
    fn output_is_bounded() {
        let long = vec![b'a'; 4 * MAX_REJECT];
        let mut buf = RejectBuffer::new();
        buf.append(&long);
        assert_eq!(buf.finalize().len(), MAX_REJECT);
    }

    #[test]
    fn carriage_returns_count_as_whitespace_not_newlines() {
        // A bare CR ends no line, so the next chunk continues it.
        assert_eq!(
            collect(&[b"scanning 10%\r" as &[u8], b"550 done\n"]),
            "scanning 10%550 done"
        );
    }
}
