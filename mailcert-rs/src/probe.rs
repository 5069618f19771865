//! Port occupancy checks

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Answers whether something is listening on a local port
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_in_use(&self, port: u16) -> bool;
}

/// Probe by connecting to the loopback address
pub struct TcpPortProbe {
    timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}
