//! Sentinel framing for commands written to an unframed shell stream.
//!
//! Each command is followed by a line that prints a one-off token. The token is
//! emitted by `printf` from two quoted halves, so a terminal echoing the input
//! never shows the joined token; only the shell's own output does.
//!
//! ```text
//! <command>
//! __stepwise_rc=$?; printf '%s%s\n' '<a>' '<b>' >&2; printf '%s%s:%s\n' '<a>' '<b>' "$__stepwise_rc"
//! ```
//!
//! stdout ends with `<token>:<exit code>\n`, stderr with `<token>\n`.

use uuid::Uuid;

const TOKEN_PREFIX: &str = "__STEPWISE_";

/// Room left after a token for `:<exit code>\r\n`.
const MARKER_TAIL: usize = 16;

/// A unique completion marker for one command.
#[derive(Debug, Clone)]
pub struct Sentinel {
    token: String,
}

/// Location of a marker inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Index where the token starts (end of the command's own output).
    pub start: usize,
    /// Index just past the marker's trailing newline.
    pub end: usize,
    pub exit_code: Option<i32>,
}

impl Sentinel {
    pub fn new() -> Self {
        Self {
            token: format!("{}{}__", TOKEN_PREFIX, Uuid::new_v4().simple()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn halves(&self) -> (&str, &str) {
        self.token.split_at(self.token.len() / 2)
    }

    /// The bytes to write for `command`.
    pub fn frame(&self, command: &str) -> String {
        let (a, b) = self.halves();
        let command = command.trim_end_matches(['\n', '\r']);
        format!(
            "{command}\n__stepwise_rc=$?; printf '%s%s\\n' '{a}' '{b}' >&2; printf '%s%s:%s\\n' '{a}' '{b}' \"$__stepwise_rc\"\n"
        )
    }

    /// A no-op command whose completion proves the shell is reading input.
    pub fn ready_probe(&self) -> String {
        let (a, b) = self.halves();
        format!("printf '%s%s:0\\n' '{a}' '{b}'\n")
    }

    /// Find the `<token>:<code>\n` marker that ends stdout.
    pub fn find_exit_marker(&self, buf: &[u8]) -> Option<Marker> {
        self.find_exit_marker_from(buf, 0)
    }

    /// Like [`find_exit_marker`](Self::find_exit_marker), skipping `buf[..from]`.
    pub fn find_exit_marker_from(&self, buf: &[u8], mut from: usize) -> Option<Marker> {
        let token = self.token.as_bytes();
        from = from.min(buf.len());
        while let Some(pos) = find(&buf[from..], token) {
            let start = from + pos;
            let after = start + token.len();
            if buf.get(after) == Some(&b':') {
                let newline = find(&buf[after..], b"\n")? + after;
                let code = std::str::from_utf8(&buf[after + 1..newline])
                    .ok()
                    .and_then(|s| s.trim_end_matches('\r').parse().ok());
                return Some(Marker {
                    start,
                    end: newline + 1,
                    exit_code: code,
                });
            }
            from = after;
        }
        None
    }

    /// Find the bare `<token>\n` marker that ends stderr.
    pub fn find_plain_marker(&self, buf: &[u8]) -> Option<Marker> {
        self.find_plain_marker_from(buf, 0)
    }

    /// Like [`find_plain_marker`](Self::find_plain_marker), skipping `buf[..from]`.
    pub fn find_plain_marker_from(&self, buf: &[u8], mut from: usize) -> Option<Marker> {
        let token = self.token.as_bytes();
        from = from.min(buf.len());
        while let Some(pos) = find(&buf[from..], token) {
            let start = from + pos;
            let mut after = start + token.len();
            if buf.get(after) == Some(&b'\r') {
                after += 1;
            }
            if buf.get(after) == Some(&b'\n') {
                return Some(Marker {
                    start,
                    end: after + 1,
                    exit_code: None,
                });
            }
            from = start + token.len();
        }
        None
    }

    /// Where the next search of a `len`-byte buffer that held no complete
    /// marker can safely resume once more bytes arrive.
    pub fn resume_offset(&self, len: usize) -> usize {
        len.saturating_sub(self.token.len() + MARKER_TAIL)
    }

    /// Remove every bare marker from a merged stream.
    pub fn strip_plain_markers(&self, buf: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(buf.len());
        let mut rest = buf;
        while let Some(marker) = self.find_plain_marker(rest) {
            out.extend_from_slice(&rest[..marker.start]);
            rest = &rest[marker.end..];
        }
        out.extend_from_slice(rest);
        out
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Drop lines that are a terminal's echo of what we wrote, plus bare prompts.
pub fn strip_echo(text: &str, written: &str) -> String {
    let echoed: Vec<&str> = written
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    text.lines()
        .filter(|line| {
            let line = strip_prompt(line.trim_end_matches('\r'));
            !line.is_empty() && !echoed.contains(&line.trim())
        })
        .map(|line| strip_prompt(line.trim_end_matches('\r')))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_prompt(mut line: &str) -> &str {
    loop {
        let trimmed = line
            .strip_prefix("$ ")
            .or_else(|| line.strip_prefix("> "))
            .unwrap_or(line);
        if trimmed.len() == line.len() {
            return if line.trim() == "$" { "" } else { line };
        }
        line = trimmed;
    }
}

/// Sanitize command output to be safe for LLM consumption.
/// Removes binary garbage while preserving valid text.
pub fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% control bytes: treat as binary.
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable. \
            Use appropriate tools to process binary data.]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);

    // Keep: newlines, tabs, carriage returns
    text.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_never_contains_joined_token() {
        let sentinel = Sentinel::new();
        let framed = sentinel.frame("echo hello\n");
        assert!(framed.starts_with("echo hello\n__stepwise_rc=$?;"));
        assert!(!framed.contains(sentinel.token()));
        assert!(!sentinel.ready_probe().contains(sentinel.token()));
    }

    #[test]
    fn test_find_exit_marker() {
        let sentinel = Sentinel::new();
        let buf = format!("hello\n{}:0\n", sentinel.token());
        let marker = sentinel.find_exit_marker(buf.as_bytes()).unwrap();
        assert_eq!(&buf[..marker.start], "hello\n");
        assert_eq!(marker.end, buf.len());
        assert_eq!(marker.exit_code, Some(0));

        // Incomplete marker line is not a match yet.
        let partial = format!("hello\n{}:12", sentinel.token());
        assert!(sentinel.find_exit_marker(partial.as_bytes()).is_none());

        // The stderr marker alone doesn't count as completion.
        let plain = format!("oops\n{}\n", sentinel.token());
        assert!(sentinel.find_exit_marker(plain.as_bytes()).is_none());
        assert_eq!(
            sentinel.find_plain_marker(plain.as_bytes()).unwrap().start,
            5
        );
    }

    #[test]
    fn test_incremental_search() {
        let sentinel = Sentinel::new();
        let mut buf = b"x".repeat(4096);
        let resume = sentinel.resume_offset(buf.len());
        assert!(sentinel.find_exit_marker_from(&buf, 0).is_none());

        // Marker split across two reads.
        let marker = format!("{}:7\n", sentinel.token());
        let (head, tail) = marker.split_at(10);
        buf.extend_from_slice(head.as_bytes());
        assert!(sentinel.find_exit_marker_from(&buf, resume).is_none());
        let resume = sentinel.resume_offset(buf.len());
        buf.extend_from_slice(tail.as_bytes());

        let found = sentinel.find_exit_marker_from(&buf, resume).unwrap();
        assert_eq!(found.start, 4096);
        assert_eq!(found.exit_code, Some(7));
        assert!(sentinel.find_exit_marker_from(&buf, buf.len() + 5).is_none());
    }

    #[test]
    fn test_merged_stream_markers() {
        let sentinel = Sentinel::new();
        let t = sentinel.token();
        let merged = format!("out\nerr{t}\n{t}:2\n");
        let exit = sentinel.find_exit_marker(merged.as_bytes()).unwrap();
        assert_eq!(exit.exit_code, Some(2));
        let body = sentinel.strip_plain_markers(&merged.as_bytes()[..exit.start]);
        assert_eq!(String::from_utf8(body).unwrap(), "out\nerr");
    }

    #[test]
    fn test_strip_echo() {
        let written = "ls -a\n__stepwise_rc=$?; printf 'x' 'y'\n";
        let text = "$ ls -a\r\n.\r\n..\r\n> __stepwise_rc=$?; printf 'x' 'y'\r\n$ ";
        assert_eq!(strip_echo(text, written), ".\n..");
    }

    #[test]
    fn test_sanitize_output() {
        assert_eq!(sanitize_output(b"ok\x00\x07\n"), "ok\n");
        let binary = vec![0x01u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
    }
}
