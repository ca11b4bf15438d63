use anyhow::bail;
use std::time::Duration;

/// Files travel in fixed 1024-byte chunks; payload offsets count these
///  chunks, not bytes.
pub const CHUNK_LEN: usize = 1024;

/// Datagrams larger than the receive buffer are truncated and presumed
///  invalid, so this bounds the payload size on the wire.
pub const RECV_BUFFER_LEN: usize = 2048;

/// What to do when a peer that already has a live session sends another
///  ClientRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateRequestPolicy {
    /// Drop the duplicate silently.
    Ignore,
    /// Reply with CloseConnection(unknownRequest), leaving the live session
    ///  untouched.
    CloseUnknownRequest,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A session that sees no scheduler activity for this long is torn down.
    ///  Refreshed on every scheduler iteration.
    pub idle_timeout: Duration,

    /// Starting point for the per-session AIMD governor, in packets per
    ///  second. The controller converges from here regardless of the value,
    ///  but a starting point near the expected path capacity shortens the
    ///  search.
    pub initial_rate: u32,

    pub duplicate_request_policy: DuplicateRequestPolicy,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            idle_timeout: Duration::from_secs(5),
            initial_rate: 1000,
            duplicate_request_policy: DuplicateRequestPolicy::Ignore,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.idle_timeout < Duration::from_millis(10) {
            bail!("idle timeout {:?} is too short to survive scheduling jitter", self.idle_timeout);
        }
        if self.initial_rate == 0 {
            bail!("initial rate must be at least 1 packet per second");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Advertised to the server in the request; 0 leaves the server's rate
    ///  uncapped.
    pub max_transmission_rate: u32,

    /// How often outstanding gaps are acknowledged back to the server.
    pub ack_interval: Duration,

    /// A download that receives nothing for this long is abandoned with
    ///  CloseConnection(timeout).
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_transmission_rate: 0,
            ack_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_interval.is_zero() {
            bail!("ack interval must not be zero");
        }
        if self.idle_timeout <= self.ack_interval {
            bail!("idle timeout must exceed the ack interval");
        }
        Ok(())
    }
}
