//! Stream relay: WebSocket source -> active device connection.
//!
//! One-way forwarding loop. Each message received from the external source is
//! written unmodified into the currently active connection, tagged with the
//! fixed relay channel. A transient absence of a connected device drops the
//! message and keeps the loop alive; a source failure ends the loop only,
//! never the process. The relay does not reconnect to its source.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};
use url::Url;

use crate::domain::lifecycle::{ConnectionLifecycle, ForwardError};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket endpoint to subscribe to.
    pub endpoint: Url,
    /// Channel tag stamped on every forwarded message.
    pub channel: u32,
    /// Bounded setup timeout for the dial.
    pub dial_timeout: Duration,
}

pub struct StreamRelay {
    lifecycle: ConnectionLifecycle,
    config: RelayConfig,
    cancel: CancellationToken,
}

impl StreamRelay {
    pub fn new(
        lifecycle: ConnectionLifecycle,
        config: RelayConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lifecycle,
            config,
            cancel,
        }
    }

    /// Run the relay loop to completion.
    pub async fn run(self) {
        let dial = connect_async(self.config.endpoint.as_str());
        let stream = match tokio::time::timeout(self.config.dial_timeout, dial).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!("Relay source dial failed: {}", e);
                return;
            }
            Err(_) => {
                error!(
                    "Relay source dial timed out after {:?}",
                    self.config.dial_timeout
                );
                return;
            }
        };
        info!("Relay source connected: {}", self.config.endpoint);

        let (_write, mut read) = stream.split();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Relay loop cancelled");
                    return;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Binary(payload))) => self.forward(payload),
                    Some(Ok(Message::Text(text))) => self.forward(text.into_bytes()),
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite replies with pong automatically
                        trace!("Relay source ping");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Relay source closed the stream");
                        return;
                    }
                    Some(Ok(_)) => {} // Pong, raw frames
                    Some(Err(e)) => {
                        error!("Relay source receive failed: {}", e);
                        return;
                    }
                    None => {
                        info!("Relay source stream ended");
                        return;
                    }
                },
            }
        }
    }

    fn forward(&self, payload: Vec<u8>) {
        match self.lifecycle.forward(&payload, self.config.channel) {
            Ok(()) => trace!(
                "Relayed {} bytes on channel {}",
                payload.len(),
                self.config.channel
            ),
            Err(ForwardError::NoActiveTarget) => warn!(
                "No active target, dropped {} byte relay message",
                payload.len()
            ),
            Err(ForwardError::Mux(e)) => warn!("Relay forward failed: {}", e),
        }
    }
}
