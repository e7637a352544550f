//! Multiplexed tunnel connection driver
//!
//! One task owns the WebSocket and both sides of the primary stream. Inbound
//! frames, primary reads, queued secondary sends and the keepalive tick are
//! all handled from a single `select!` loop, so no stage of a connection ever
//! runs concurrently with another.

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::multiplexer::{FrameMultiplexer, Inbound};
use crate::secondary::{SecondarySender, SecondarySlot};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const SECONDARY_QUEUE: usize = 256;

type ControlHandler = Box<dyn FnMut(String) + Send>;
type PrimaryFilter = Box<dyn FnMut(Bytes) -> Bytes + Send>;

/// Cloneable view of a running tunnel, handed to the code that owns it
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    conn_id: String,
    multiplexing: bool,
    secondary: SecondarySender,
    secondary_slot: SecondarySlot,
}

impl TunnelHandle {
    pub fn connection_id(&self) -> &str {
        &self.conn_id
    }

    /// Whether both ends agreed on stream tagging
    pub fn multiplexing(&self) -> bool {
        self.multiplexing
    }

    /// Outbound secondary stream
    pub fn secondary_sender(&self) -> &SecondarySender {
        &self.secondary
    }

    /// Inbound secondary stream registration
    pub fn secondary_slot(&self) -> &SecondarySlot {
        &self.secondary_slot
    }
}

/// Counters reported when the tunnel ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_discarded: u64,
}

pub struct Tunnel<S> {
    conn_id: String,
    ws: WebSocketStream<S>,
    mux: FrameMultiplexer,
    secondary_rx: Option<mpsc::Receiver<Bytes>>,
    keepalive: Option<Duration>,
    control: Option<ControlHandler>,
    inbound_filter: Option<PrimaryFilter>,
    stats: TunnelStats,
}

impl<S> std::fmt::Debug for Tunnel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("conn_id", &self.conn_id)
            .field("multiplexing", &self.mux.multiplexing())
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl<S> Tunnel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an upgraded WebSocket.
    ///
    /// `keepalive` enables periodic pings at `config.keepalive_interval`.
    pub fn new(
        conn_id: impl Into<String>,
        ws: WebSocketStream<S>,
        multiplexing: bool,
        config: &TunnelConfig,
        keepalive: bool,
    ) -> (Self, TunnelHandle) {
        let conn_id = conn_id.into();
        let secondary_slot = SecondarySlot::new();
        let mux = FrameMultiplexer::new(conn_id.clone(), multiplexing, secondary_slot.clone())
            .with_dump_bytes(config.dump_bytes);

        let (secondary_tx, secondary_rx) = if multiplexing {
            let (tx, rx) = mpsc::channel(SECONDARY_QUEUE);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handle = TunnelHandle {
            conn_id: conn_id.clone(),
            multiplexing,
            secondary: SecondarySender::new(conn_id.clone(), secondary_tx),
            secondary_slot,
        };

        let tunnel = Self {
            conn_id,
            ws,
            mux,
            secondary_rx,
            keepalive: keepalive.then_some(config.keepalive_interval),
            control: None,
            inbound_filter: None,
            stats: TunnelStats::default(),
        };

        (tunnel, handle)
    }

    /// Receive text messages instead of logging and dropping them
    pub fn with_control_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        self.control = Some(Box::new(handler));
        self
    }

    /// Transform primary payloads from the peer before they reach the writer
    pub fn with_inbound_filter<F>(mut self, filter: F) -> Self
    where
        F: FnMut(Bytes) -> Bytes + Send + 'static,
    {
        self.inbound_filter = Some(Box::new(filter));
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.conn_id
    }

    /// Send primary-stream bytes ahead of [`Tunnel::run`]
    pub async fn send_primary(&mut self, payload: Bytes) -> TunnelResult<()> {
        self.stats.bytes_sent += payload.len() as u64;
        let message = self.mux.encode_primary(payload);
        self.ws.send(message).await?;
        Ok(())
    }

    /// Relay until either side closes.
    ///
    /// Bytes read from `reader` become primary frames; primary payloads from
    /// the peer are written to `writer`. EOF on `reader` starts the WebSocket
    /// closing handshake.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> TunnelResult<TunnelStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Tunnel {
            conn_id,
            mut ws,
            mux,
            mut secondary_rx,
            keepalive,
            mut control,
            mut inbound_filter,
            mut stats,
        } = self;

        let mut ticker = keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut closing = false;

        debug!(
            "[{}] Tunnel running (multiplexing={})",
            conn_id,
            mux.multiplexing()
        );

        let result: TunnelResult<()> = loop {
            if buf.capacity() < READ_BUFFER_SIZE / 4 {
                buf.reserve(READ_BUFFER_SIZE);
            }

            tokio::select! {
                inbound = ws.next() => match inbound {
                    Some(Ok(message)) => match mux.decode(message) {
                        Inbound::Primary(data) => {
                            stats.bytes_received += data.len() as u64;
                            let data = match inbound_filter.as_mut() {
                                Some(filter) => filter(data),
                                None => data,
                            };
                            if let Err(e) = write_primary(&mut writer, &data).await {
                                break Err(e.into());
                            }
                        }
                        Inbound::Control(text) => match control.as_mut() {
                            Some(handler) => handler(text),
                            None => debug!("[{}] Ignoring control message: {}", conn_id, text),
                        },
                        Inbound::Discarded(_) => stats.frames_discarded += 1,
                        Inbound::Close => closing = true,
                        Inbound::Secondary { .. } | Inbound::Keepalive => {}
                    },
                    Some(Err(e)) => {
                        let e = TunnelError::from(e);
                        if e.is_disconnect() {
                            debug!("[{}] WebSocket ended: {}", conn_id, e);
                            break Ok(());
                        }
                        break Err(e);
                    }
                    None => break Ok(()),
                },

                read = reader.read_buf(&mut buf), if !closing => match read {
                    Ok(0) => {
                        debug!("[{}] Primary stream ended, closing WebSocket", conn_id);
                        closing = true;
                        if let Err(e) = ws.close(None).await {
                            debug!("[{}] Close failed: {}", conn_id, e);
                            break Ok(());
                        }
                    }
                    Ok(n) => {
                        stats.bytes_sent += n as u64;
                        let message = mux.encode_primary(buf.split().freeze());
                        if let Err(e) = ws.send(message).await {
                            break Err(e.into());
                        }
                    }
                    Err(e) => break Err(e.into()),
                },

                payload = next_secondary(&mut secondary_rx), if !closing => match payload {
                    Some(payload) => {
                        if let Some(message) = mux.encode_secondary(payload) {
                            if let Err(e) = ws.send(message).await {
                                break Err(e.into());
                            }
                        }
                    }
                    // every sender is gone
                    None => secondary_rx = None,
                },

                _ = next_tick(&mut ticker), if !closing => {
                    trace!("[{}] Sending keepalive ping", conn_id);
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        if let Err(e) = writer.shutdown().await {
            trace!("[{}] Primary sink shutdown: {}", conn_id, e);
        }

        match result {
            Ok(()) => {
                debug!(
                    "[{}] Tunnel closed (sent={} received={} discarded={})",
                    conn_id, stats.bytes_sent, stats.bytes_received, stats.frames_discarded
                );
                Ok(stats)
            }
            Err(e) => {
                warn!("[{}] Tunnel failed: {}", conn_id, e);
                Err(e)
            }
        }
    }
}

async fn write_primary<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

async fn next_secondary(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
