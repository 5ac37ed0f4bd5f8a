//! WebSocket Real-Time Fan-Out
//!
//! ## Architecture
//!
//! - **Hub**: one task owning the connection registry and subscription index
//! - **Connection**: per-socket reader and writer loops plus the mailbox
//! - **Handler**: authenticated upgrade endpoint
//! - **Messages**: the JSON envelope used in both directions
//!
//! ## Usage
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8080/ws?token=' + jwt);
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'subscribe', channel: 'estadisticas:42'}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   if (msg.type === 'stats') render(msg.data);
//! };
//! ```

mod connection;
mod handler;
mod hub;
mod messages;
mod subscriptions;

pub use connection::{
    channel, run_reader, run_writer, ConnectionError, ConnectionHandle, ConnectionId, Enqueue,
    Frame, Outbox,
};
pub use handler::{websocket_handler, ConnectParams};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use messages::{
    stats_channel, ChannelRef, DomainEvent, Envelope, MessageKind, STATS_CHANNEL_PREFIX,
};
pub use subscriptions::SubscriptionIndex;
