use async_trait::async_trait;
use futures::channel::mpsc;

use crate::error::FsError;

/// A message on a data channel. Channels are message-oriented and carry
/// either text (JSON control traffic) or binary frames (bulk payloads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Events emitted by one bound data channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    Closed,
}

/// One logical, named channel: an outbound send handle plus the inbound
/// event stream. Handler wiring happens by composition; the connection
/// engine merges `events` into its select set and hands `tx` to whichever
/// delegate owns the label.
#[derive(Debug)]
pub struct DataChannel {
    pub label: String,
    pub tx: mpsc::UnboundedSender<Payload>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Session-level events produced by the signaling collaborator.
#[derive(Debug)]
pub enum SessionEvent {
    /// Signaling established; data channels may now be created.
    Open,
    /// The peer link is established end-to-end.
    Connect,
    /// The remote side announced a channel.
    DataChannel(DataChannel),
    /// The link was lost, with the transport's reason if it gave one.
    Disconnect(Option<String>),
}

/// One negotiated peer session. The signaling layer that produces these is
/// external to this crate; everything here treats it as a black box that
/// emits events and opens named channels.
#[async_trait]
pub trait PeerSession: Send {
    async fn create_data_channel(&mut self, label: &str) -> Result<DataChannel, FsError>;

    /// Stable digest of the local session description, if the transport can
    /// derive one. Used as the handshake nonce.
    fn fingerprint(&self) -> Option<String>;

    /// Next session event, or `None` once the session is finished.
    async fn next_event(&mut self) -> Option<SessionEvent>;

    async fn close(&mut self);
}

/// Entry point into the signaling layer: negotiates a session for a room.
#[async_trait]
pub trait Signaler: Send + Sync {
    async fn connect(
        &self,
        room_id: &str,
        signaling_key: Option<&str>,
    ) -> Result<Box<dyn PeerSession>, FsError>;
}
