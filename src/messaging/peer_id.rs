use std::fmt::{Debug, Display, Formatter};

/// Identifies a peer on the chat channel.
///
/// Concretely this is the peer's IPv4 address in dotted form, as reported by the
/// transport: for inbound datagrams it is the observed source address, for the
/// local process it is the address of the chosen interface. It is assigned once
/// at startup and never changes for the lifetime of the process.
///
/// Peer ids are deliberately opaque to the protocol logic - they are only ever
/// compared, hashed and echoed back in `ack` messages.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> PeerId {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}
