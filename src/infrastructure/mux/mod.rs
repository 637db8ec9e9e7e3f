//! Device-multiplexer collaborator.
//!
//! The bridge reaches physically attached devices through a local mux daemon.
//! This module is the seam between the lifecycle logic and that daemon:
//!
//! - [`DeviceMux`] - what the bridge asks of the daemon (discovery, scans,
//!   tagged sends)
//! - [`PresenceSink`] / [`OutcomeSink`] - what the daemon reports back
//! - [`protocol`] - wire framing for the daemon socket
//! - [`client`] - the TCP client implementing [`DeviceMux`]

pub mod client;
pub mod protocol;

pub use client::MuxClient;

use std::sync::Arc;

use thiserror::Error;

use crate::domain::models::{Device, DeviceId};

/// Errors surfaced by the mux collaborator.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("i/o failure on the mux daemon socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported mux protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("unrecognized mux message kind {0}")]
    UnknownMessage(u32),

    #[error("mux frame payload of {0} bytes exceeds the frame limit")]
    OversizedFrame(u32),

    #[error("malformed mux control payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("mux daemon connection is closed")]
    Closed,

    #[error("device refused the connection: {0}")]
    Refused(String),
}

/// Receives device presence events produced by discovery.
pub trait PresenceSink: Send + Sync {
    fn device_attached(&self, device: Device);
    fn device_detached(&self, id: DeviceId);

    /// Discovery produced a malformed or unrecognized event.
    fn discovery_error(&self, cause: MuxError);
}

/// Receives the outcome of connection attempts and the loss of established
/// connections.
pub trait OutcomeSink: Send + Sync {
    fn connect_succeeded(&self, id: DeviceId, port: u16);
    fn connect_failed(&self, id: DeviceId, port: u16, cause: MuxError);
    fn connection_lost(&self, id: DeviceId, port: u16);
}

/// Ends discovery. `stop` is safe to call multiple times.
pub trait DiscoveryHandle: Send + Sync {
    fn stop(&self);
}

/// Cancels an outstanding scan. `stop` is safe to call multiple times.
pub trait ScanHandle: Send + Sync {
    fn stop(&self);
}

/// The discovery/connection collaborator.
pub trait DeviceMux: Send + Sync {
    /// Begin producing presence events into `sink`.
    fn start_discovery(
        &self,
        sink: Arc<dyn PresenceSink>,
    ) -> Result<Box<dyn DiscoveryHandle>, MuxError>;

    /// Begin scanning for `device`, attempting to reach `port`. Unless the
    /// scan is stopped first, exactly one outcome event resolves the attempt.
    fn start_scan(
        &self,
        sink: Arc<dyn OutcomeSink>,
        device: DeviceId,
        port: u16,
    ) -> Result<Box<dyn ScanHandle>, MuxError>;

    /// Write a tagged payload to the established connection.
    fn send(&self, payload: &[u8], channel: u32) -> Result<(), MuxError>;

    /// Tear down the daemon connection. Safe to call multiple times.
    fn close(&self);
}
