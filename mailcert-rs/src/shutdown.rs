//! SIGINT/SIGTERM listener
//!
//! Handlers are registered when the listener is installed, not when it is
//! first awaited, so a signal arriving during the first renewal pass is
//! still observed and the mail daemon can be recovered.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

use crate::error::Result;

pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    /// Register both handlers now; must run inside a tokio runtime
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolve on the first SIGINT or SIGTERM received since `install`
    pub async fn wait(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("Received SIGINT"),
            _ = self.terminate.recv() => info!("Received SIGTERM"),
        }
    }
}
