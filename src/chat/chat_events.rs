use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::peer_id::PeerId;

/// Events the engine surfaces to the presentation layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChatEvent {
    /// A text from another peer was received for the first time.
    TextReceived { text: String, sender_nick: String },
    /// Sending a text finished: all recipients acknowledged (empty list) or the
    /// attempts were exhausted (the peers that never acknowledged). Listed
    /// peers may meanwhile have vanished from the contact list.
    TextSent { failed_peer_ids: Vec<PeerId> },
    UserJoined { peer_id: PeerId, nick: String },
    /// A user left the chat, explicitly or by expiry.
    UserLeft { peer_id: PeerId, nick: String },
    /// A text transmission attempt failed at the socket. The retry schedule
    /// keeps running regardless.
    NetworkError { message: String },
}

/// Fan-out of [ChatEvent]s to any number of subscribers.
///
/// Sending without subscribers is fine - such events are simply discarded, so
/// components can emit unconditionally.
#[derive(Debug, Clone)]
pub struct ChatEventNotifier {
    sender: broadcast::Sender<ChatEvent>,
}

impl ChatEventNotifier {
    pub fn new() -> ChatEventNotifier {
        let (sender, _) = broadcast::channel(64);
        ChatEventNotifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: ChatEvent) {
        trace!(?event, "chat event");
        let _ = self.sender.send(event);
    }
}
