pub mod codec;
pub mod multicast;
pub mod peer_id;
pub mod transport;
