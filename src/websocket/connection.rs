//! Connection Agent
//!
//! Each admitted socket gets two tasks:
//!
//! - **reader**: decodes one frame at a time into an [`Envelope`] and turns
//!   subscribe/unsubscribe/domain events into hub requests.
//! - **writer**: the only task that writes to the socket. It drains the
//!   connection's outbound queues in order and, once the hub closes the
//!   mailbox, sends a close frame and exits.
//!
//! The hub keeps the sending halves in a [`ConnectionHandle`]. Channel
//! fan-out goes through the mailbox; broadcasts to every connection use the
//! direct path. Both queues are bounded, both end up in the same writer, and
//! frames never interleave.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::hub::{HubError, HubHandle};
use super::messages::{Envelope, MessageKind};
use crate::auth::Identity;

/// Serialized JSON frame, shared between all recipients of a fan-out
pub type Frame = Arc<str>;

/// Unique per socket; distinguishes a reconnect from the connection it replaced
pub type ConnectionId = Uuid;

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    Full,
    Closed,
}

/// Hub-side half of a connection
#[derive(Debug)]
pub struct ConnectionHandle {
    identity: Identity,
    id: ConnectionId,
    mailbox: Option<mpsc::Sender<Frame>>,
    direct: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn try_enqueue(&self, frame: Frame) -> Enqueue {
        match &self.mailbox {
            Some(mailbox) => enqueue(mailbox, frame),
            None => Enqueue::Closed,
        }
    }

    /// Non-blocking send on the direct path, which bypasses the mailbox
    pub fn send_direct(&self, frame: Frame) -> Enqueue {
        enqueue(&self.direct, frame)
    }

    /// Close the mailbox, which tells the writer to drain and terminate.
    /// Returns false if it was already closed.
    pub fn close_mailbox(&mut self) -> bool {
        self.mailbox.take().is_some()
    }

    pub fn is_mailbox_closed(&self) -> bool {
        self.mailbox.is_none()
    }
}

fn enqueue(queue: &mpsc::Sender<Frame>, frame: Frame) -> Enqueue {
    match queue.try_send(frame) {
        Ok(()) => Enqueue::Queued,
        Err(TrySendError::Full(_)) => Enqueue::Full,
        Err(TrySendError::Closed(_)) => Enqueue::Closed,
    }
}

/// Writer-side half of a connection
#[derive(Debug)]
pub struct Outbox {
    mailbox: mpsc::Receiver<Frame>,
    direct: mpsc::Receiver<Frame>,
}

impl Outbox {
    /// Next frame to write, direct path first. `None` once the mailbox is
    /// closed and drained.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            Some(frame) = self.direct.recv() => Some(frame),
            frame = self.mailbox.recv() => frame,
        }
    }
}

#[cfg(test)]
impl Outbox {
    pub(crate) fn try_next_frame(&mut self) -> Option<Frame> {
        self.direct.try_recv().ok().or_else(|| self.mailbox.try_recv().ok())
    }
}

/// Create both halves for a new connection. The mailbox and the direct path
/// each hold up to `capacity` frames.
pub fn channel(identity: Identity, capacity: usize) -> (ConnectionHandle, Outbox) {
    let (mailbox_tx, mailbox_rx) = mpsc::channel(capacity.max(1));
    let (direct_tx, direct_rx) = mpsc::channel(capacity.max(1));
    let handle = ConnectionHandle {
        identity,
        id: Uuid::new_v4(),
        mailbox: Some(mailbox_tx),
        direct: direct_tx,
    };
    let outbox = Outbox {
        mailbox: mailbox_rx,
        direct: direct_rx,
    };
    (handle, outbox)
}

/// Why a connection loop stopped
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Writer loop: drain `outbox` into `sink`, then send a close frame
pub async fn run_writer<S>(
    mut sink: S,
    mut outbox: Outbox,
    identity: Identity,
) -> Result<(), ConnectionError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(frame) = outbox.next_frame().await {
        sink.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    }

    tracing::debug!(identity = %identity, "Mailbox closed, sending close frame");
    sink.send(Message::Close(None))
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    Ok(())
}

/// Reader loop: decode frames and dispatch them to the hub
pub async fn run_reader<S, E>(
    mut stream: S,
    identity: Identity,
    id: ConnectionId,
    hub: HubHandle,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(result) = stream.next().await {
        let message = result.map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let envelope: Envelope = match message {
            Message::Text(text) => serde_json::from_str(&text)?,
            Message::Binary(bytes) => serde_json::from_slice(&bytes)?,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                tracing::debug!(identity = %identity, "Client requested close");
                return Ok(());
            }
        };
        dispatch(&hub, &identity, id, envelope).await?;
    }
    Ok(())
}

async fn dispatch(
    hub: &HubHandle,
    identity: &Identity,
    id: ConnectionId,
    envelope: Envelope,
) -> Result<(), HubError> {
    match envelope.kind.clone() {
        MessageKind::Subscribe => {
            let channel = envelope.channel_ref().name().to_string();
            hub.subscribe(identity.clone(), id, channel).await
        }
        MessageKind::Unsubscribe => {
            let channel = envelope.channel_ref().name().to_string();
            hub.unsubscribe(identity.clone(), id, channel).await
        }
        MessageKind::Domain(event) => {
            tracing::debug!(identity = %identity, event = event.as_str(), "Forwarding domain event");
            hub.broadcast_all(envelope).await
        }
        MessageKind::Stats | MessageKind::Chat => {
            tracing::debug!(identity = %identity, kind = %envelope.kind, "Server-originated kind from client dropped");
            Ok(())
        }
        MessageKind::Other(kind) => {
            tracing::info!(identity = %identity, kind = %kind, "Unrecognized event dropped");
            Ok(())
        }
    }
}

/// Run an admitted socket until either loop ends, then unregister it
pub async fn serve(socket: WebSocket, identity: Identity, hub: HubHandle) {
    let (handle, outbox) = channel(identity.clone(), hub.config().mailbox_capacity);
    let id = handle.id();

    if let Err(e) = hub.register(handle).await {
        tracing::error!(identity = %identity, error = %e, "Failed to register connection");
        return;
    }

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(sink, outbox, identity.clone()));
    let mut reader = tokio::spawn(run_reader(stream, identity.clone(), id, hub.clone()));

    let (side, outcome) = tokio::select! {
        res = &mut writer => {
            reader.abort();
            ("writer", res)
        }
        res = &mut reader => {
            writer.abort();
            ("reader", res)
        }
    };

    match outcome {
        Ok(Ok(())) => {
            tracing::debug!(identity = %identity, side, "Connection loop finished");
        }
        Ok(Err(ConnectionError::Decode(e))) => {
            tracing::warn!(identity = %identity, error = %e, "Malformed frame, closing connection");
        }
        Ok(Err(e)) => {
            tracing::debug!(identity = %identity, side, error = %e, "Connection loop failed");
        }
        Err(e) => {
            tracing::warn!(identity = %identity, side, error = %e, "Connection task aborted");
        }
    }

    if let Err(e) = hub.unregister(identity.clone(), id).await {
        tracing::debug!(identity = %identity, error = %e, "Hub gone before unregister");
    }
}
