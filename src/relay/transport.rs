//! Transports underneath the relay.
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels carrying whole text
//! frames. The relay never sees the socket itself; when the inbound channel
//! ends the link is considered closed, and dropping the outbound sender
//! closes it from our side.
//!
//! - [`WebSocketConnector`] talks to the real relay server.
//! - [`MemoryConnector`] hands the other end to the caller as a
//!   [`MemoryHost`], for tests and embedding.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// An open, frame-oriented link to the relay.
#[derive(Debug)]
pub struct Link {
    /// Frames to send. Dropping this closes the link.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received. Ends when the link closes.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to a relay URL.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new link to `url`.
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, io::Result<Link>>;
}

/// Connects to the relay over WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, io::Result<Link>> {
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(io::Error::other)?;
            let (mut sink, mut source) = stream.split();

            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
            let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    trace!(bytes = frame.len(), "Writing frame");
                    if let Err(e) = sink.send(Message::text(frame)).await {
                        warn!(error = %e, "WebSocket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
                debug!("WebSocket writer finished");
            });

            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let frame = match message {
                        Ok(Message::Text(text)) => text.to_string(),
                        Ok(Message::Binary(bytes)) => {
                            String::from_utf8_lossy(bytes.as_ref()).into_owned()
                        }
                        Ok(Message::Close(reason)) => {
                            debug!(?reason, "WebSocket closed by relay");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "WebSocket read failed");
                            break;
                        }
                    };
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                debug!("WebSocket reader finished");
            });

            Ok(Link { outbound, inbound })
        })
    }
}

/// An in-process connector whose far end is driven by the caller.
///
/// Every successful [`open`](Connector::open) delivers a [`MemoryHost`] on
/// the receiver returned from [`MemoryConnector::new`].
#[derive(Debug)]
pub struct MemoryConnector {
    hosts: mpsc::UnboundedSender<MemoryHost>,
    attempts: AtomicUsize,
    refusals: AtomicUsize,
}

impl MemoryConnector {
    /// Creates a connector and the receiver of its host ends.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryHost>) {
        let (hosts, rx) = mpsc::unbounded_channel();
        let connector = Self {
            hosts,
            attempts: AtomicUsize::new(0),
            refusals: AtomicUsize::new(0),
        };
        (connector, rx)
    }

    /// Makes the next `count` attempts fail with `ConnectionRefused`.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Number of times `open` has been called.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn open_now(&self) -> io::Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.hosts
            .send(MemoryHost {
                from_client,
                to_client,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "host side dropped"))?;

        Ok(Link { outbound, inbound })
    }
}

impl Connector for MemoryConnector {
    fn open<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, io::Result<Link>> {
        Box::pin(std::future::ready(self.open_now()))
    }
}

/// The host end of a [`MemoryConnector`] link.
#[derive(Debug)]
pub struct MemoryHost {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MemoryHost {
    /// Waits for the next frame sent by the relay client.
    ///
    /// Returns `None` once the client closed the link. Frames that are not
    /// JSON are returned as JSON strings.
    pub async fn recv(&mut self) -> Option<Value> {
        let raw = self.from_client.recv().await?;
        Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }

    /// Returns the next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        let raw = self.from_client.try_recv().ok()?;
        Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }

    /// Sends a JSON frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: &Value) -> bool {
        self.send_raw(frame.to_string())
    }

    /// Sends raw text to the client. Returns `false` if the client is gone.
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }

    /// Closes the link from the host side.
    pub fn close(self) {
        drop(self);
    }
}
