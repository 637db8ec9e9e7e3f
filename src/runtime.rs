//! Top-level lifecycle owner.
//!
//! Wires the collaborators together, starts discovery and the stream relay,
//! blocks until a termination request arrives, then releases every open
//! resource in order. Each release is best-effort: a failure releasing one
//! resource never prevents releasing the others.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::domain::lifecycle::{ActiveTarget, ConnectionLifecycle, LifecycleConfig};
use crate::domain::settings::Settings;
use crate::infrastructure::mux::{DeviceMux, DiscoveryHandle, MuxClient, PresenceSink};
use crate::infrastructure::relay::{RelayConfig, StreamRelay};

pub struct BridgeRuntime {
    settings: Settings,
}

impl BridgeRuntime {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub async fn run(self) -> Result<()> {
        let endpoint = Url::parse(&self.settings.relay_endpoint).with_context(|| {
            format!("invalid relay endpoint: {}", self.settings.relay_endpoint)
        })?;

        let mux = Arc::new(
            MuxClient::connect(&self.settings.mux_addr)
                .await
                .with_context(|| {
                    format!("could not reach the mux daemon at {}", self.settings.mux_addr)
                })?,
        );

        let lifecycle = ConnectionLifecycle::new(
            mux.clone() as Arc<dyn DeviceMux>,
            LifecycleConfig {
                device_port: self.settings.device_port,
                probe_channel: self.settings.probe_channel,
                rescan_backoff: Duration::from_millis(self.settings.rescan_backoff_ms),
            },
        );

        let sink: Arc<dyn PresenceSink> = Arc::new(lifecycle.clone());
        let discovery = mux
            .start_discovery(sink)
            .context("could not start device discovery")?;

        let relay_cancel = CancellationToken::new();
        let relay = StreamRelay::new(
            lifecycle.clone(),
            RelayConfig {
                endpoint,
                channel: self.settings.relay_channel,
                dial_timeout: Duration::from_secs(self.settings.relay_dial_timeout_secs),
            },
            relay_cancel.clone(),
        );
        let relay_task = tokio::spawn(async move {
            relay.run().await;
            info!("Relay loop terminated");
        });

        wait_for_termination().await;
        info!("Termination requested, shutting down");
        if let ActiveTarget::Connected { device, port } = lifecycle.target() {
            info!("Dropping connection to device {} on port {}", device, port);
        }

        release_resources(discovery.as_ref(), mux.as_ref(), &lifecycle);

        relay_cancel.cancel();
        if let Err(e) = relay_task.await {
            warn!("Relay task did not shut down cleanly: {}", e);
        }
        Ok(())
    }
}

/// Release every open resource in order: discovery, the daemon connection,
/// any outstanding scan. The handles are idempotent and log their own
/// failures, so one faulty release cannot block the rest.
fn release_resources(
    discovery: &dyn DiscoveryHandle,
    mux: &dyn DeviceMux,
    lifecycle: &ConnectionLifecycle,
) {
    discovery.stop();
    mux.close();
    lifecycle.stop_scan();
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Could not register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
