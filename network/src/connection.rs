// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! One authorized-or-authorizing socket.
//!
//! Each connection owns a read task and a write task over a
//! length-delimited frame codec. Outbound requests register a waiter under
//! a fresh correlation id; inbound frames whose type is a response are
//! routed to the matching waiter (out-of-order responses are therefore
//! buffered by construction), and everything else flows to the service's
//! inbound queue.

use crate::envelope::{MessageType, NetworkEnvelope, ENVELOPE_VERSION};
use crate::NetworkError;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Notify},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("connection closed")]
    Closed,
}

/// An inbound request frame, tagged with the connection it arrived on.
#[derive(Debug)]
pub struct InboundMessage {
    pub connection_id: u64,
    pub envelope: NetworkEnvelope,
}

#[derive(Clone)]
pub struct Connection {
    id: u64,
    outbound: mpsc::Sender<NetworkEnvelope>,
    pending: Arc<DashMap<u64, oneshot::Sender<NetworkEnvelope>>>,
    next_correlation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Connection {
    /// Takes ownership of the socket, spawning its io tasks. `inbound`
    /// receives request frames; `disconnects` is told when the read side
    /// ends.
    pub fn spawn(
        stream: TcpStream,
        id: u64,
        inbound: mpsc::Sender<InboundMessage>,
        disconnects: mpsc::Sender<u64>,
    ) -> Self {
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (mut sink, mut frames) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<NetworkEnvelope>(64);
        let pending: Arc<DashMap<u64, oneshot::Sender<NetworkEnvelope>>> =
            Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match envelope.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(error = %err, "dropping unencodable envelope");
                        continue;
                    }
                };
                if sink.send(Bytes::from(bytes)).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_shutdown.notified() => break,
                    frame = frames.next() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(connection = id, error = %err, "read failed");
                        break;
                    }
                };
                let envelope = match NetworkEnvelope::from_bytes(&frame) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(connection = id, error = %err, "dropping undecodable frame");
                        break;
                    }
                };
                if envelope.version != ENVELOPE_VERSION {
                    warn!(
                        connection = id,
                        version = envelope.version,
                        "peer speaks an unsupported envelope version"
                    );
                    break;
                }
                if envelope.message_type.is_response() {
                    match reader_pending.remove(&envelope.correlation_id) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(envelope);
                        }
                        None => {
                            debug!(
                                connection = id,
                                correlation = envelope.correlation_id,
                                "response with no waiter"
                            );
                        }
                    }
                    continue;
                }
                if inbound
                    .send(InboundMessage {
                        connection_id: id,
                        envelope,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            let _ = disconnects.send(id).await;
        });

        Self {
            id,
            outbound: outbound_tx,
            pending,
            next_correlation: Arc::new(AtomicU64::new(1)),
            closed,
            shutdown,
        }
    }

    /// Tears the connection down: the read task exits and the socket is
    /// released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fire-and-forget message (correlation id 0).
    pub async fn send(
        &self,
        message_type: MessageType,
        content: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.send_envelope(NetworkEnvelope::new(message_type, 0, content))
            .await
    }

    /// A reply to an inbound request, echoing its correlation id.
    pub async fn reply(
        &self,
        message_type: MessageType,
        correlation_id: u64,
        content: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.send_envelope(NetworkEnvelope::new(message_type, correlation_id, content))
            .await
    }

    async fn send_envelope(&self, envelope: NetworkEnvelope) -> Result<(), ConnectionError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Sends a request and waits for the response carrying the same
    /// correlation id. Frames for other ids arriving meanwhile go to their
    /// own waiters.
    pub async fn request(
        &self,
        message_type: MessageType,
        content: Vec<u8>,
        timeout: Duration,
    ) -> Result<NetworkEnvelope, ConnectionError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(correlation_id, waiter_tx);

        let envelope = NetworkEnvelope::new(message_type, correlation_id, content);
        if let Err(err) = self.send_envelope(envelope).await {
            self.pending.remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, waiter_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(ConnectionError::Network(NetworkError::Timeout))
            }
        }
    }
}
