//! Diagnostic Line Scanner
//!
//! Alternative inbound-to-outbound copy that reads newline-terminated chunks,
//! logs the client address when a chunk matches the inspection pattern, and
//! forwards every chunk unmodified. Much slower than the pooled frame copy.

use regex::bytes::Regex;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

use super::RelaySession;

/// Largest chunk tested at once; longer lines are split
pub const MAX_SCAN_CHUNK: u64 = 64 * 1024;

/// Compiled inspection pattern
#[derive(Debug, Clone)]
pub struct LineScanner {
    pattern: Regex,
}

impl LineScanner {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn is_match(&self, chunk: &[u8]) -> bool {
        self.pattern.is_match(chunk)
    }

    /// Copy `reader` to `writer` chunk by chunk until EOF or error.
    ///
    /// Returns the number of bytes forwarded.
    pub async fn scan<R, W>(
        &self,
        reader: R,
        writer: &mut W,
        session: &RelaySession,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = BufReader::new(reader);
        let mut chunk = Vec::with_capacity(1024);
        let mut total = 0u64;

        loop {
            chunk.clear();
            let n = (&mut reader)
                .take(MAX_SCAN_CHUNK)
                .read_until(b'\n', &mut chunk)
                .await?;
            if n == 0 {
                return Ok(total);
            }

            if self.is_match(&chunk) {
                info!(
                    session_id = %session.session_id,
                    client_addr = %session.client_addr,
                    "Inbound line matched inspection pattern"
                );
            }

            writer.write_all(&chunk).await?;
            writer.flush().await?;
            session.add_bytes_up(n as u64);
            total += n as u64;
        }
    }
}
