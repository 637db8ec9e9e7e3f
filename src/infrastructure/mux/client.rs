//! Async client for the device-multiplexer daemon.
//!
//! One TCP connection, two background tasks: a writer draining the outbound
//! frame queue and a reader dispatching decoded frames to the registered
//! sinks. The [`CancellationToken`] ties their lifetimes together; either
//! side failing tears the whole client down.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    self, ConnectResultBody, DetachedBody, DisconnectedBody, Frame, MessageKind, ScanTargetBody,
};
use super::{DeviceMux, DiscoveryHandle, MuxError, OutcomeSink, PresenceSink, ScanHandle};
use crate::domain::models::{Device, DeviceId};

const DAEMON_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MuxClient {
    tx: mpsc::UnboundedSender<Frame>,
    sinks: Arc<Sinks>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Sinks {
    presence: Mutex<Option<Arc<dyn PresenceSink>>>,
    outcome: Mutex<Option<Arc<dyn OutcomeSink>>>,
}

impl Sinks {
    fn presence(&self) -> Option<Arc<dyn PresenceSink>> {
        match self.presence.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_presence(&self, sink: Option<Arc<dyn PresenceSink>>) {
        match self.presence.lock() {
            Ok(mut guard) => *guard = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    fn outcome(&self) -> Option<Arc<dyn OutcomeSink>> {
        match self.outcome.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_outcome(&self, sink: Option<Arc<dyn OutcomeSink>>) {
        match self.outcome.lock() {
            Ok(mut guard) => *guard = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }
}

impl MuxClient {
    /// Dial the mux daemon and spawn the reader/writer tasks.
    pub async fn connect(addr: &str) -> Result<Self, MuxError> {
        let stream = tokio::time::timeout(DAEMON_DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                MuxError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dialing {addr} timed out"),
                ))
            })??;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let sinks = Arc::new(Sinks::default());
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(write_half, rx, cancel.clone()));
        tokio::spawn(read_loop(read_half, sinks.clone(), cancel.clone()));

        info!("Connected to mux daemon at {}", addr);
        Ok(Self { tx, sinks, cancel })
    }

    fn enqueue(&self, frame: Frame) -> Result<(), MuxError> {
        if self.cancel.is_cancelled() {
            return Err(MuxError::Closed);
        }
        self.tx.send(frame).map_err(|_| MuxError::Closed)
    }
}

impl DeviceMux for MuxClient {
    fn start_discovery(
        &self,
        sink: Arc<dyn PresenceSink>,
    ) -> Result<Box<dyn DiscoveryHandle>, MuxError> {
        self.sinks.set_presence(Some(sink));
        self.enqueue(Frame::bare(MessageKind::Listen))?;
        debug!("Subscribed to presence events");
        Ok(Box::new(MuxDiscovery {
            sinks: self.sinks.clone(),
            stopped: AtomicBool::new(false),
        }))
    }

    fn start_scan(
        &self,
        sink: Arc<dyn OutcomeSink>,
        device: DeviceId,
        port: u16,
    ) -> Result<Box<dyn ScanHandle>, MuxError> {
        self.sinks.set_outcome(Some(sink));
        self.enqueue(Frame::control(
            MessageKind::ConnectRequest,
            &ScanTargetBody {
                device_id: device,
                port,
            },
        )?)?;
        debug!("Scan submitted for device {} port {}", device, port);
        Ok(Box::new(MuxScan {
            tx: self.tx.clone(),
            device,
            port,
            stopped: AtomicBool::new(false),
        }))
    }

    fn send(&self, payload: &[u8], channel: u32) -> Result<(), MuxError> {
        self.enqueue(Frame::data(channel, payload.to_vec()))
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Closing mux daemon connection");
            self.cancel.cancel();
        }
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct MuxDiscovery {
    sinks: Arc<Sinks>,
    stopped: AtomicBool,
}

impl DiscoveryHandle for MuxDiscovery {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sinks.set_presence(None);
        debug!("Presence subscription stopped");
    }
}

struct MuxScan {
    tx: mpsc::UnboundedSender<Frame>,
    device: DeviceId,
    port: u16,
    stopped: AtomicBool,
}

impl ScanHandle for MuxScan {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = match Frame::control(
            MessageKind::StopScan,
            &ScanTargetBody {
                device_id: self.device,
                port: self.port,
            },
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not encode scan cancellation: {}", e);
                return;
            }
        };
        if self.tx.send(frame).is_err() {
            // Daemon connection already gone; nothing left to cancel.
            debug!("Scan cancellation skipped, mux connection closed");
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = protocol::write_frame(&mut write_half, &frame).await {
                        error!("Write to mux daemon failed: {}", e);
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("Mux writer task exiting");
}

async fn read_loop(mut read_half: OwnedReadHalf, sinks: Arc<Sinks>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = protocol::read_frame(&mut read_half) => match frame {
                Ok(frame) => dispatch(&sinks, frame),
                // Frame boundary intact: report and keep reading.
                Err(cause @ MuxError::UnknownMessage(_)) => {
                    if let Some(sink) = sinks.presence() {
                        sink.discovery_error(cause);
                    } else {
                        warn!("Unrecognized mux frame before discovery started: {}", cause);
                    }
                }
                Err(MuxError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("Mux daemon closed the connection");
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    error!("Mux stream failed: {}", e);
                    cancel.cancel();
                    break;
                }
            },
        }
    }
    debug!("Mux reader task exiting");
}

fn dispatch(sinks: &Sinks, frame: Frame) {
    match frame.kind {
        MessageKind::Attached => match frame.body::<Device>() {
            Ok(device) => {
                if let Some(sink) = sinks.presence() {
                    sink.device_attached(device);
                }
            }
            Err(e) => report_discovery_error(sinks, e),
        },
        MessageKind::Detached => match frame.body::<DetachedBody>() {
            Ok(body) => {
                if let Some(sink) = sinks.presence() {
                    sink.device_detached(body.device_id);
                }
            }
            Err(e) => report_discovery_error(sinks, e),
        },
        MessageKind::ConnectResult => match frame.body::<ConnectResultBody>() {
            Ok(body) => {
                if let Some(sink) = sinks.outcome() {
                    if body.success {
                        sink.connect_succeeded(body.device_id, body.port);
                    } else {
                        let cause = body
                            .cause
                            .unwrap_or_else(|| "connection attempt failed".to_string());
                        sink.connect_failed(body.device_id, body.port, MuxError::Refused(cause));
                    }
                }
            }
            Err(e) => report_discovery_error(sinks, e),
        },
        MessageKind::Disconnected => match frame.body::<DisconnectedBody>() {
            Ok(body) => {
                if let Some(sink) = sinks.outcome() {
                    sink.connection_lost(body.device_id, body.port);
                }
            }
            Err(e) => report_discovery_error(sinks, e),
        },
        MessageKind::Data => {
            // Device-bound channels are one-way from our side; inbound data
            // is logged and dropped.
            debug!(
                "Received {} bytes from device on channel {}",
                frame.payload.len(),
                frame.tag
            );
        }
        MessageKind::Listen | MessageKind::ConnectRequest | MessageKind::StopScan => {
            report_discovery_error(sinks, MuxError::UnknownMessage(frame.kind as u32));
        }
    }
}

fn report_discovery_error(sinks: &Sinks, cause: MuxError) {
    if let Some(sink) = sinks.presence() {
        sink.discovery_error(cause);
    } else {
        warn!("Discovery fault with no sink registered: {}", cause);
    }
}
