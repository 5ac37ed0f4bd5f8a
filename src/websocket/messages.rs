//! WebSocket Message Types
//!
//! Every frame in either direction is one JSON [`Envelope`]:
//!
//! ```json
//! {"type": "subscribe", "data": null, "channel": "estadisticas:42", "negocioId": "42", "timestamp": "2024-05-01T10:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::connection::Frame;
use crate::snapshot::Snapshot;

/// Channel prefix the trigger endpoint publishes statistics updates on
pub const STATS_CHANNEL_PREFIX: &str = "estadisticas:";

/// Channel carrying statistics updates for `subject_id`
pub fn stats_channel(subject_id: &str) -> String {
    format!("{}{}", STATS_CHANNEL_PREFIX, subject_id)
}

/// Domain events clients may publish to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEvent {
    NuevaCita,
    AvanceFila,
    CerrarFila,
    UsuarioEnFila,
}

impl DomainEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEvent::NuevaCita => "nueva_cita",
            DomainEvent::AvanceFila => "avance_fila",
            DomainEvent::CerrarFila => "cerrar_fila",
            DomainEvent::UsuarioEnFila => "usuario_en_fila",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "nueva_cita" => Some(DomainEvent::NuevaCita),
            "avance_fila" => Some(DomainEvent::AvanceFila),
            "cerrar_fila" => Some(DomainEvent::CerrarFila),
            "usuario_en_fila" => Some(DomainEvent::UsuarioEnFila),
            _ => None,
        }
    }
}

/// Value of the `type` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    Stats,
    Chat,
    Domain(DomainEvent),
    /// Anything else, kept verbatim so it can be logged
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::Stats => "stats",
            MessageKind::Chat => "chat",
            MessageKind::Domain(event) => event.as_str(),
            MessageKind::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "subscribe" => MessageKind::Subscribe,
            "unsubscribe" => MessageKind::Unsubscribe,
            "stats" => MessageKind::Stats,
            "chat" => MessageKind::Chat,
            other => match DomainEvent::parse(other) {
                Some(event) => MessageKind::Domain(event),
                None => MessageKind::Other(kind),
            },
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(MessageKind::from)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a subscribe/unsubscribe request named its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRef<'a> {
    /// Top-level `channel` field
    Field(&'a str),
    /// `data.channel`, sent by older clients
    Nested(&'a str),
    Missing,
}

impl<'a> ChannelRef<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            ChannelRef::Field(name) | ChannelRef::Nested(name) => name,
            ChannelRef::Missing => "",
        }
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, rename = "negocioId", skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            data,
            channel: None,
            subject_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A `stats` message carrying `snapshot` for `subject_id`
    pub fn stats(channel: &str, subject_id: &str, snapshot: Snapshot) -> Self {
        let mut envelope =
            Self::new(MessageKind::Stats, Value::Object(snapshot)).with_channel(channel);
        envelope.subject_id = Some(subject_id.to_string());
        envelope
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Resolve the channel name, top-level field first, then `data.channel`
    pub fn channel_ref(&self) -> ChannelRef<'_> {
        if let Some(channel) = self.channel.as_deref().filter(|c| !c.is_empty()) {
            return ChannelRef::Field(channel);
        }
        match self.data.get("channel").and_then(Value::as_str) {
            Some(channel) if !channel.is_empty() => ChannelRef::Nested(channel),
            _ => ChannelRef::Missing,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}
