//! Proxy core / orchestrator
//!
//! Owns the tun read loop: one sequential reader task parses each datagram
//! and dispatches it to the connection tracker, a single writer task
//! serializes response packets back onto the device, and the intercept
//! listener receives the flows the tracker redirects. Strict packet order
//! on the read side is what makes flow demultiplexing correct.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::common::Result;
use crate::config::Config;
use crate::intercept::{InterceptProxy, MitmContext, RedirectMap};
use crate::nat::{ConnectionTracker, TrackerConfig};
use crate::packet;
use crate::pcap::{CapturedFrame, FrameSender};

/// Depth of the queue feeding the tun writer task
const TUN_WRITE_QUEUE: usize = 1024;

/// The assembled proxy: configuration, interception context, and redirect
/// table, ready to be attached to a device.
pub struct Engine {
    config: Arc<Config>,
    ctx: Arc<MitmContext>,
    redirects: Arc<RedirectMap>,
    frame_tap: Option<FrameSender>,
}

/// Running engine handle
pub struct EngineHandle {
    tracker: ConnectionTracker,
    intercept_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    intercept_task: Option<JoinHandle<Result<()>>>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        ctx: Arc<MitmContext>,
        redirects: Arc<RedirectMap>,
    ) -> Self {
        Self {
            config,
            ctx,
            redirects,
            frame_tap: None,
        }
    }

    /// Attach an optional raw-frame tap (pcap-style capture). The engine
    /// only exposes bytes; writing them anywhere is the caller's concern.
    pub fn with_frame_tap(mut self, tap: FrameSender) -> Self {
        self.frame_tap = Some(tap);
        self
    }

    /// Start the proxy on an externally-created tun device.
    ///
    /// The device is any full-duplex byte stream yielding one raw IPv4
    /// datagram (at most MTU bytes) per read. CA bootstrap failure disables
    /// interception but leaves plain forwarding running.
    pub async fn start<D>(self, device: D) -> Result<EngineHandle>
    where
        D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Interception requires a ready root CA; plain forwarding does not
        let intercept = match self.ctx.ca.ensure_root().await {
            Ok(_) => {
                let proxy = InterceptProxy::bind(
                    self.config.listen,
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.redirects),
                )
                .await?;
                let addr = proxy.local_addr()?;
                Some((addr, tokio::spawn(proxy.run())))
            }
            Err(e) => {
                warn!("root CA unavailable ({}); TLS interception disabled", e);
                None
            }
        };
        let (intercept_addr, intercept_task) = match intercept {
            Some((addr, task)) => (Some(addr), Some(task)),
            None => (None, None),
        };

        let (tun_tx, mut tun_rx) = mpsc::channel::<Vec<u8>>(TUN_WRITE_QUEUE);
        let (mut read_half, mut write_half) = tokio::io::split(device);

        let tracker = ConnectionTracker::new(
            TrackerConfig {
                udp_idle_timeout: self.config.udp_idle_timeout(),
                connect_timeout: self.config.connect_timeout(),
                intercept_ports: self.config.intercept_ports.clone(),
            },
            Arc::clone(&self.ctx.protector),
            Arc::clone(&self.redirects),
            intercept_addr,
            tun_tx,
        );

        // Single writer: response packets from all flows serialize here
        let writer_tap = self.frame_tap.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(datagram) = tun_rx.recv().await {
                if let Some(tap) = &writer_tap {
                    let _ = tap.send(CapturedFrame {
                        timestamp: SystemTime::now(),
                        data: datagram.clone(),
                    });
                }
                if let Err(e) = write_half.write_all(&datagram).await {
                    debug!("tun write failed, writer stopping: {}", e);
                    break;
                }
            }
        });

        // Single sequential reader owns the device's read half
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let reader_tracker = tracker.clone();
        let reader_tap = self.frame_tap.clone();
        let mtu = self.config.mtu;
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; mtu];
            info!("tun read loop started (mtu {})", mtu);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = read_half.read(&mut buf) => {
                        let n = match result {
                            Ok(0) => {
                                info!("tun device closed");
                                break;
                            }
                            Ok(n) => n,
                            Err(e) => {
                                error!("tun read failed: {}", e);
                                break;
                            }
                        };

                        if let Some(tap) = &reader_tap {
                            let _ = tap.send(CapturedFrame {
                                timestamp: SystemTime::now(),
                                data: buf[..n].to_vec(),
                            });
                        }

                        match packet::parse(&buf[..n]) {
                            Some(parsed) => reader_tracker.handle_packet(&parsed),
                            // Malformed packets are dropped, never surfaced
                            None => trace!("unparseable datagram ({} bytes) dropped", n),
                        }
                    }
                }
            }
        });

        Ok(EngineHandle {
            tracker,
            intercept_addr,
            shutdown,
            reader_task,
            writer_task,
            intercept_task,
        })
    }
}

impl EngineHandle {
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Bound address of the intercept listener, when interception is up
    pub fn intercept_addr(&self) -> Option<SocketAddr> {
        self.intercept_addr
    }

    /// Wait for the read loop to end on its own (device closed).
    pub async fn wait(&mut self) {
        let _ = (&mut self.reader_task).await;
    }

    /// Stop the proxy: close the listener and release the device. In-flight
    /// relay tasks observe their sockets failing and unwind on their own.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if !self.reader_task.is_finished() {
            let _ = self.reader_task.await;
        }
        self.writer_task.abort();
        if let Some(task) = self.intercept_task {
            task.abort();
        }
    }
}
