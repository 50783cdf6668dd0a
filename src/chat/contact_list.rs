use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::debug;

use crate::chat::chat_config::ChatConfig;
use crate::chat::chat_events::{ChatEvent, ChatEventNotifier};
use crate::messaging::peer_id::PeerId;

struct Contact {
    nick: String,
    last_seen: Instant,
}

/// The engine's view of currently-live peers.
///
/// Entries are created and refreshed by `user` advertisements and removed on
/// `leave` or when a peer stays silent for longer than the configured expiry
/// period. Join / leave events are emitted synchronously from within the
/// operations.
pub struct ContactList {
    config: Arc<ChatConfig>,
    events: ChatEventNotifier,
    contacts: FxHashMap<PeerId, Contact>,
}

impl ContactList {
    pub fn new(config: Arc<ChatConfig>, events: ChatEventNotifier) -> ContactList {
        ContactList {
            config,
            events,
            contacts: FxHashMap::default(),
        }
    }

    /// A `user` advertisement arrived: the peer is present. Inserts new peers
    /// (emitting [ChatEvent::UserJoined]) and refreshes known ones. A known
    /// peer advertising a different nick has restarted under a new identity:
    /// that is a leave of the old nick followed by a join of the new one.
    pub fn confirm(&mut self, peer_id: &PeerId, nick: &str) {
        match self.contacts.entry(peer_id.clone()) {
            Entry::Occupied(mut e) => {
                let contact = e.get_mut();
                if contact.nick != nick {
                    let old_nick = std::mem::replace(&mut contact.nick, nick.to_owned());
                    self.events.send(ChatEvent::UserLeft {
                        peer_id: peer_id.clone(),
                        nick: old_nick,
                    });
                    self.events.send(ChatEvent::UserJoined {
                        peer_id: peer_id.clone(),
                        nick: nick.to_owned(),
                    });
                }
                contact.last_seen = Instant::now();
            }
            Entry::Vacant(e) => {
                e.insert(Contact {
                    nick: nick.to_owned(),
                    last_seen: Instant::now(),
                });
                self.events.send(ChatEvent::UserJoined {
                    peer_id: peer_id.clone(),
                    nick: nick.to_owned(),
                });
            }
        }
    }

    /// A `leave` message arrived. The [ChatEvent::UserLeft] carries the nick
    /// from the message, not the stored one, and is emitted even for peers that
    /// were never on the list.
    pub fn remove(&mut self, peer_id: &PeerId, nick: &str) {
        self.contacts.remove(peer_id);
        self.events.send(ChatEvent::UserLeft {
            peer_id: peer_id.clone(),
            nick: nick.to_owned(),
        });
    }

    /// Pushes back the expiry of a known peer without touching its nick. Texts
    /// refresh a contact just like advertisements, but never create one.
    pub fn refresh(&mut self, peer_id: &PeerId) {
        if let Some(contact) = self.contacts.get_mut(peer_id) {
            contact.last_seen = Instant::now();
        }
    }

    /// Sweeps peers that have been silent for longer than the expiry period,
    /// emitting [ChatEvent::UserLeft] with the stored nick for each.
    pub fn remove_expired(&mut self) {
        let now = Instant::now();
        let expired = self
            .contacts
            .iter()
            .filter(|(_, contact)| {
                now.duration_since(contact.last_seen) > self.config.contact_expiry_period
            })
            .map(|(peer_id, contact)| (peer_id.clone(), contact.nick.clone()))
            .collect::<Vec<_>>();

        for (peer_id, nick) in expired {
            debug!(peer = ?peer_id, nick, "contact expired");
            self.contacts.remove(&peer_id);
            self.events.send(ChatEvent::UserLeft { peer_id, nick });
        }
    }

    /// Snapshot of the currently known peers, e.g. as the recipient set of an
    /// outgoing text.
    pub fn peer_ids(&self) -> FxHashSet<PeerId> {
        self.contacts.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::broadcast;
    use tokio::time;

    use super::*;

    fn new_contact_list() -> (ContactList, broadcast::Receiver<ChatEvent>) {
        let events = ChatEventNotifier::new();
        let receiver = events.subscribe();
        (
            ContactList::new(Arc::new(ChatConfig::default()), events),
            receiver,
        )
    }

    fn drain(receiver: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn joined(peer: &str, nick: &str) -> ChatEvent {
        ChatEvent::UserJoined {
            peer_id: PeerId::from(peer),
            nick: nick.to_owned(),
        }
    }

    fn left(peer: &str, nick: &str) -> ChatEvent {
        ChatEvent::UserLeft {
            peer_id: PeerId::from(peer),
            nick: nick.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_join_rename_leave() {
        let (mut contacts, mut receiver) = new_contact_list();
        let peer = PeerId::from("10.0.0.5");

        contacts.confirm(&peer, "a");
        assert_eq!(drain(&mut receiver), vec![joined("10.0.0.5", "a")]);

        // same nick again: just a refresh, no events
        contacts.confirm(&peer, "a");
        assert_eq!(drain(&mut receiver), vec![]);

        // new nick: the peer was restarted
        contacts.confirm(&peer, "b");
        assert_eq!(
            drain(&mut receiver),
            vec![left("10.0.0.5", "a"), joined("10.0.0.5", "b")]
        );

        contacts.remove(&peer, "b");
        assert_eq!(drain(&mut receiver), vec![left("10.0.0.5", "b")]);
        assert!(contacts.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_peer_still_emits() {
        let (mut contacts, mut receiver) = new_contact_list();

        contacts.remove(&PeerId::from("10.0.0.9"), "ghost");
        assert_eq!(drain(&mut receiver), vec![left("10.0.0.9", "ghost")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let (mut contacts, mut receiver) = new_contact_list();
        let peer = PeerId::from("10.0.0.5");

        contacts.confirm(&peer, "a");
        drain(&mut receiver);

        time::sleep(Duration::from_secs(10)).await;
        contacts.remove_expired();
        assert_eq!(drain(&mut receiver), vec![]);

        time::sleep(Duration::from_secs(2)).await;
        contacts.remove_expired();
        assert_eq!(drain(&mut receiver), vec![left("10.0.0.5", "a")]);
        assert!(contacts.peer_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_and_refresh_postpone_expiry() {
        let (mut contacts, mut receiver) = new_contact_list();
        let advertising = PeerId::from("10.0.0.5");
        let texting = PeerId::from("10.0.0.6");

        contacts.confirm(&advertising, "a");
        contacts.confirm(&texting, "b");
        drain(&mut receiver);

        time::sleep(Duration::from_secs(10)).await;
        contacts.confirm(&advertising, "a");
        contacts.refresh(&texting);

        time::sleep(Duration::from_secs(10)).await;
        contacts.remove_expired();
        assert_eq!(drain(&mut receiver), vec![]);

        time::sleep(Duration::from_secs(2)).await;
        contacts.remove_expired();
        let mut events = drain(&mut receiver);
        events.sort_by_key(|e| format!("{:?}", e));
        assert_eq!(events, vec![left("10.0.0.5", "a"), left("10.0.0.6", "b")]);
    }

    #[tokio::test]
    async fn test_refresh_does_not_create_contacts() {
        let (mut contacts, mut receiver) = new_contact_list();

        contacts.refresh(&PeerId::from("10.0.0.5"));
        assert_eq!(drain(&mut receiver), vec![]);
        assert!(contacts.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_peer_ids_snapshot() {
        let (mut contacts, _receiver) = new_contact_list();

        contacts.confirm(&PeerId::from("10.0.0.5"), "a");
        contacts.confirm(&PeerId::from("10.0.0.6"), "b");

        assert_eq!(
            contacts.peer_ids(),
            [PeerId::from("10.0.0.5"), PeerId::from("10.0.0.6")].into_iter().collect()
        );
    }
}
