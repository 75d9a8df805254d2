//! Relay Engine
//!
//! Runs one session: dial the upstream, then pump bytes both ways until the
//! first direction finishes. The losing direction is cancelled and both legs
//! are shut down and dropped, which returns the session's pooled frames.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::dialer::Dialer;
use super::scanner::LineScanner;
use super::session::{EndReason, RelaySession, SessionOutcome, SessionStats, Side};
use crate::connection::BoxedConnection;
use crate::error::RelayError;
use crate::protocol::{ForwardTarget, ProtocolKind};
use crate::resource::BufferPool;

/// Bound on writing the failure response and on closing each leg
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size for the unpooled copy used alongside the line scanner
const RAW_COPY_BUFFER: usize = 8 * 1024;

/// Handles data relay between inbound and outbound connections
pub struct RelayEngine {
    dialer: Dialer,
    pool: Arc<BufferPool>,
    scanner: Option<LineScanner>,
}

impl RelayEngine {
    pub fn new(dialer: Dialer, pool: Arc<BufferPool>) -> Self {
        Self {
            dialer,
            pool,
            scanner: None,
        }
    }

    /// Switch sessions to the line-scanning relay
    pub fn with_scanner(mut self, scanner: LineScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn target(&self) -> &ForwardTarget {
        self.dialer.target()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn scanner(&self) -> Option<&LineScanner> {
        self.scanner.as_ref()
    }

    /// Run a complete session for one inbound connection.
    ///
    /// Exactly one dial is attempted. Both legs are closed before this
    /// returns, whatever the path.
    pub async fn handle(&self, mut inbound: BoxedConnection, client_addr: SocketAddr) -> SessionStats {
        let session = RelaySession::new(client_addr, self.target().address());

        let dialed = match self.dialer.dial().await {
            Ok(dialed) => dialed,
            Err(e) => {
                let outcome = self.fail_dial(&session, &mut inbound, &e).await;
                close(inbound).await;
                let stats = session.finish(None, outcome);
                stats.log();
                return stats;
            }
        };

        debug!(
            session_id = %session.session_id,
            "Copying from {} to {}", client_addr, dialed.peer_addr
        );

        let outcome = self.relay(&session, inbound, dialed.stream).await;
        let stats = session.finish(Some(dialed.peer_addr), outcome);
        stats.log();
        stats
    }

    /// Tell the inbound peer the upstream is unreachable, where the protocol allows it
    async fn fail_dial(
        &self,
        session: &RelaySession,
        inbound: &mut BoxedConnection,
        error: &RelayError,
    ) -> SessionOutcome {
        let protocol = self.target().protocol();
        debug!(
            session_id = %session.session_id,
            protocol = %protocol,
            kind = error.kind(),
            "Unable to dial forwarding address: {}", error
        );

        let response_sent = match protocol.bad_gateway_response() {
            Some(response) => match timeout(CLOSE_TIMEOUT, write_response(inbound, &response)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!(session_id = %session.session_id, "Failed to respond with bad gateway: {}", e);
                    false
                }
                Err(_) => {
                    debug!(session_id = %session.session_id, "Timed out responding with bad gateway");
                    false
                }
            },
            None => {
                if let ProtocolKind::Unknown(name) = protocol {
                    debug!(
                        session_id = %session.session_id,
                        "No bad gateway convention for unknown protocol '{}'", name
                    );
                }
                false
            }
        };

        SessionOutcome::DialFailed {
            error: error.to_string(),
            response_sent,
        }
    }

    /// Pump both directions until the first one finishes
    async fn relay(
        &self,
        session: &RelaySession,
        inbound: BoxedConnection,
        outbound: BoxedConnection,
    ) -> SessionOutcome {
        let (mut in_read, mut in_write) = tokio::io::split(inbound);
        let (mut out_read, mut out_write) = tokio::io::split(outbound);

        let (ended_by, reason) = match &self.scanner {
            Some(scanner) => {
                let mut raw = vec![0u8; RAW_COPY_BUFFER];
                tokio::select! {
                    result = scanner.scan(&mut in_read, &mut out_write, session) => {
                        (Side::Inbound, EndReason::from_result(&result))
                    }
                    result = pump(&mut out_read, &mut in_write, &mut raw, &session.bytes_down) => {
                        (Side::Outbound, EndReason::from_result(&result))
                    }
                }
            }
            None => {
                let (mut up_buf, mut down_buf) = self.pool.acquire_pair().await;
                tokio::select! {
                    result = pump(&mut in_read, &mut out_write, &mut up_buf, &session.bytes_up) => {
                        (Side::Inbound, EndReason::from_result(&result))
                    }
                    result = pump(&mut out_read, &mut in_write, &mut down_buf, &session.bytes_down) => {
                        (Side::Outbound, EndReason::from_result(&result))
                    }
                }
            }
        };

        debug!(
            session_id = %session.session_id,
            ?ended_by,
            ?reason,
            "First direction finished, closing both legs"
        );

        close(in_read.unsplit(in_write)).await;
        close(out_read.unsplit(out_write)).await;

        SessionOutcome::Relayed { ended_by, reason }
    }
}

/// Copy `reader` into `writer` through `buf` until EOF or error
async fn pump<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8], counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
}

async fn write_response(conn: &mut BoxedConnection, response: &[u8]) -> io::Result<()> {
    conn.write_all(response).await?;
    conn.flush().await
}

/// Shut down and drop a leg; errors only mean the peer is already gone
async fn close(mut conn: BoxedConnection) {
    match timeout(CLOSE_TIMEOUT, conn.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error shutting down connection: {}", e),
        Err(_) => warn!("Timed out shutting down connection after {:?}", CLOSE_TIMEOUT),
    }
}
