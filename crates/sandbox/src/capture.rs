//! Bounded stdout/stderr capture.
//!
//! Both pipes are drained concurrently against one shared byte budget. Once
//! the budget is spent further bytes are read and discarded, so a chatty
//! program never blocks on a full pipe and keeps running until it exits or
//! hits its timeout.

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

/// Captured output of one child, bounded by `limit` bytes in total.
#[derive(Debug)]
pub struct OutputCapture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl OutputCapture {
    /// Create an empty capture with a combined budget.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        }
    }

    /// Bytes still accepted.
    pub fn remaining(&self) -> usize {
        self.limit
            .saturating_sub(self.stdout.len() + self.stderr.len())
    }

    /// Whether any bytes were discarded.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Record a chunk, keeping at most `remaining()` bytes of it.
    pub fn push(&mut self, stream: Stream, chunk: &[u8]) {
        let keep = chunk.len().min(self.remaining());
        if keep < chunk.len() {
            self.truncated = true;
        }
        let target = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        target.extend_from_slice(&chunk[..keep]);
    }

    /// Read both pipes to EOF.
    pub async fn drain<O, E>(&mut self, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let (mut out_open, mut err_open) = (stdout.is_some(), stderr.is_some());
        let (mut stdout, mut stderr) = (stdout, stderr);

        while out_open || err_open {
            tokio::select! {
                read = read_some(&mut stdout, &mut out_buf), if out_open => match read {
                    Some(n) => self.push(Stream::Stdout, &out_buf[..n]),
                    None => out_open = false,
                },
                read = read_some(&mut stderr, &mut err_buf), if err_open => match read {
                    Some(n) => self.push(Stream::Stderr, &err_buf[..n]),
                    None => err_open = false,
                },
            }
        }
    }

    /// Decode into `(stdout, stderr)`.
    pub fn into_text(self) -> (String, String) {
        let truncated = self.truncated;
        (
            decode(self.stdout, truncated),
            decode(self.stderr, truncated),
        )
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    let reader = reader.as_mut()?;
    match reader.read(buf).await {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

/// Lossy UTF-8 decode. A multi-byte character cut in half by truncation is
/// dropped instead of being replaced, so ASCII output stays byte-exact.
fn decode(mut bytes: Vec<u8>, truncated: bool) -> String {
    if truncated {
        if let Err(e) = std::str::from_utf8(&bytes) {
            if e.error_len().is_none() {
                bytes.truncate(e.valid_up_to());
            }
        }
    }
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_both_streams() {
        let mut capture = OutputCapture::new(1024);
        capture
            .drain(Some(&b"hello\n"[..]), Some(&b"warning\n"[..]))
            .await;
        assert!(!capture.truncated());
        let (out, err) = capture.into_text();
        assert_eq!(out, "hello\n");
        assert_eq!(err, "warning\n");
    }

    #[tokio::test]
    async fn test_budget_is_shared_and_exact() {
        let big = vec![b'x'; 100_000];
        let mut capture = OutputCapture::new(4096);
        capture.drain(Some(&big[..]), None::<&[u8]>).await;
        assert!(capture.truncated());
        assert_eq!(capture.remaining(), 0);
        let (out, err) = capture.into_text();
        assert_eq!(out.len(), 4096);
        assert!(err.is_empty());
    }

    #[test]
    fn test_push_across_streams() {
        let mut capture = OutputCapture::new(6);
        capture.push(Stream::Stdout, b"abcd");
        capture.push(Stream::Stderr, b"efgh");
        assert!(capture.truncated());
        let (out, err) = capture.into_text();
        assert_eq!(out, "abcd");
        assert_eq!(err, "ef");
    }

    #[test]
    fn test_split_multibyte_char_is_dropped() {
        let mut capture = OutputCapture::new(4);
        capture.push(Stream::Stdout, "ab\u{00e9}\u{00e9}".as_bytes());
        let (out, _) = capture.into_text();
        assert_eq!(out, "ab\u{00e9}");
    }

    #[test]
    fn test_exact_fit_is_not_truncated() {
        let mut capture = OutputCapture::new(3);
        capture.push(Stream::Stdout, b"abc");
        assert!(!capture.truncated());
    }
}
