use bytes::BytesMut;
use thiserror::Error;

use crate::messaging::peer_id::PeerId;

#[derive(Debug, Error)]
pub enum TransportError {
    /// No single network interface qualifies for multicast communication.
    /// Fatal at startup.
    #[error("no suitable network interface: {0}")]
    NoSuitableInterface(String),
    /// Socket-level failure. Fatal at startup (bind / group join), per-datagram
    /// afterwards.
    #[error("network error: {0}")]
    Network(String),
}

/// The seam between the chat engine and datagram I/O.
///
/// An implementation owns a single best-effort broadcast channel: [Transport::send]
/// hands one datagram to every other peer (unreliably), [Transport::recv] yields
/// datagrams from other peers together with the sender's [PeerId]. Reliability,
/// deduplication and dispatch live above this trait.
///
/// It is deliberately narrow so that tests can drive the engine with an
/// in-memory implementation.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The id under which other peers see datagrams sent through this transport.
    fn own_id(&self) -> PeerId;

    /// Sends one datagram to the channel. A partial write is an error.
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next datagram from another peer. Datagrams this transport
    /// sent itself are never returned.
    async fn recv(&self) -> Result<(BytesMut, PeerId), TransportError>;
}
