use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::messaging::peer_id::PeerId;

/// What the engine must do in response to feeding the state machine.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SendEffect {
    /// Transmit the text with this id on the wire. Unless the send finished,
    /// the next attempt is due one attempt period later.
    Transmit { text: String, text_id: i64 },
    /// The send is over: everyone acknowledged (empty set) or the attempts are
    /// exhausted (the peers that never acknowledged).
    Finished { failed_peer_ids: FxHashSet<PeerId> },
}

/// State machine for reliably sending one text over an unreliable channel: the
/// text is transmitted up to `max_attempts` times until all recipients have
/// acknowledged it.
///
/// The machine performs no I/O and owns no timers - each input returns the
/// [SendEffect]s to perform, and the engine drives the attempt clock. A new
/// instance is created per text and dropped once it emitted
/// [SendEffect::Finished].
pub struct TextSender {
    max_attempts: u32,
    own_sender_id: PeerId,
    text: String,
    waiting_for_ack: FxHashSet<PeerId>,
    attempt: u32,
    /// Assigned at [TextSender::start]: the first attempt carries this value,
    /// retries its negation.
    sent_text_id: i64,
    terminal: bool,
}

impl TextSender {
    pub fn new(
        own_sender_id: PeerId,
        text: String,
        recipients: FxHashSet<PeerId>,
        max_attempts: u32,
    ) -> TextSender {
        TextSender {
            max_attempts,
            own_sender_id,
            text,
            waiting_for_ack: recipients,
            attempt: 0,
            sent_text_id: 0,
            terminal: false,
        }
    }

    /// To be called once. Assigns the text id and begins the first attempt.
    /// With no recipients to wait for, the text still goes out once and the
    /// send finishes immediately.
    pub fn start(&mut self) -> Vec<SendEffect> {
        self.sent_text_id = text_id_from_timestamp();

        if self.waiting_for_ack.is_empty() {
            self.terminal = true;
            return vec![
                SendEffect::Transmit {
                    text: self.text.clone(),
                    text_id: self.sent_text_id,
                },
                SendEffect::Finished { failed_peer_ids: FxHashSet::default() },
            ];
        }

        self.attempt_to_send()
    }

    /// The attempt timer fired. A timer firing after the last ack already
    /// finished the send is a no-op.
    pub fn attempt_to_send(&mut self) -> Vec<SendEffect> {
        if self.terminal || self.waiting_for_ack.is_empty() {
            return Vec::new();
        }

        self.attempt += 1;
        if self.attempt > self.max_attempts {
            debug!(text_id = self.sent_text_id, failed = ?self.waiting_for_ack, "giving up delivery");
            self.terminal = true;
            return vec![SendEffect::Finished {
                failed_peer_ids: self.waiting_for_ack.clone(),
            }];
        }

        // first attempt with the positive id, retries negated
        let text_id = if self.attempt == 1 {
            self.sent_text_id
        } else {
            -self.sent_text_id
        };
        debug!(text_id, attempt = self.attempt, waiting = ?self.waiting_for_ack, "transmitting text");
        vec![SendEffect::Transmit {
            text: self.text.clone(),
            text_id,
        }]
    }

    /// An ack arrived from `ack_origin`. Acks for other senders' texts, for a
    /// different text id or after finish are irrelevant and ignored, as are
    /// acks from peers that were never waited for.
    pub fn handle_ack(
        &mut self,
        text_sender_id: &PeerId,
        wire_text_id: i64,
        ack_origin: &PeerId,
    ) -> Vec<SendEffect> {
        if self.terminal
            || text_sender_id != &self.own_sender_id
            || wire_text_id.unsigned_abs() != self.sent_text_id.unsigned_abs()
        {
            return Vec::new();
        }

        self.waiting_for_ack.remove(ack_origin);

        if self.waiting_for_ack.is_empty() {
            self.terminal = true;
            return vec![SendEffect::Finished {
                failed_peer_ids: FxHashSet::default(),
            }];
        }
        Vec::new()
    }
}

/// Millisecond timestamp serving as text id: unique per sender within the dedup
/// window. Must stay positive (the sign marks retries on the wire), hence the
/// clamp.
fn text_id_from_timestamp() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_millis() as i64)
        .unwrap_or(1);
    millis.max(1)
}

#[cfg(test)]
mod test {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    fn peers(ids: &[&str]) -> FxHashSet<PeerId> {
        ids.iter().map(|id| PeerId::from(*id)).collect()
    }

    fn new_sender(recipients: &[&str]) -> TextSender {
        TextSender::new(peer("10.0.0.1"), "hello".to_owned(), peers(recipients), 3)
    }

    fn transmitted_id(effects: &[SendEffect]) -> i64 {
        match effects {
            [SendEffect::Transmit { text, text_id }] => {
                assert_eq!(text, "hello");
                *text_id
            }
            other => panic!("expected a single transmit effect, got {:?}", other),
        }
    }

    #[test]
    fn test_no_recipients_sends_once_and_finishes() {
        let mut sender = new_sender(&[]);

        let effects = sender.start();
        assert_eq!(effects.len(), 2);
        match &effects[0] {
            SendEffect::Transmit { text_id, .. } => assert!(*text_id > 0),
            other => panic!("expected transmit, got {:?}", other),
        }
        assert_eq!(
            effects[1],
            SendEffect::Finished { failed_peer_ids: FxHashSet::default() }
        );

        // the machine is terminal: timers and acks are no-ops now
        assert_eq!(sender.attempt_to_send(), vec![]);
    }

    #[test]
    fn test_all_acked_on_first_attempt() {
        let mut sender = new_sender(&["p1", "p2"]);

        let text_id = transmitted_id(&sender.start());
        assert!(text_id > 0);

        assert_eq!(sender.handle_ack(&peer("10.0.0.1"), text_id, &peer("p1")), vec![]);
        assert_eq!(
            sender.handle_ack(&peer("10.0.0.1"), text_id, &peer("p2")),
            vec![SendEffect::Finished { failed_peer_ids: FxHashSet::default() }]
        );

        // the scheduled timer for the next attempt becomes a no-op
        assert_eq!(sender.attempt_to_send(), vec![]);
    }

    #[test]
    fn test_retries_negated_until_attempts_exhausted() {
        let mut sender = new_sender(&["p1", "p2"]);

        let first_id = transmitted_id(&sender.start());
        assert!(first_id > 0);

        // p1 acks the first attempt, p2 stays silent
        sender.handle_ack(&peer("10.0.0.1"), first_id, &peer("p1"));

        assert_eq!(transmitted_id(&sender.attempt_to_send()), -first_id);
        assert_eq!(transmitted_id(&sender.attempt_to_send()), -first_id);

        // attempt 4 exceeds max_attempts = 3
        assert_eq!(
            sender.attempt_to_send(),
            vec![SendEffect::Finished { failed_peer_ids: peers(&["p2"]) }]
        );

        // finished is emitted only once
        assert_eq!(sender.attempt_to_send(), vec![]);
    }

    #[test]
    fn test_ack_with_negated_id_counts() {
        let mut sender = new_sender(&["p1"]);

        let text_id = transmitted_id(&sender.start());
        assert_eq!(
            sender.handle_ack(&peer("10.0.0.1"), -text_id, &peer("p1")),
            vec![SendEffect::Finished { failed_peer_ids: FxHashSet::default() }]
        );
    }

    #[test]
    fn test_irrelevant_acks_are_ignored() {
        let mut sender = new_sender(&["p1"]);
        let text_id = transmitted_id(&sender.start());

        // ack for some other sender's text
        assert_eq!(sender.handle_ack(&peer("10.9.9.9"), text_id, &peer("p1")), vec![]);
        // ack for a different text of ours
        assert_eq!(sender.handle_ack(&peer("10.0.0.1"), text_id + 1, &peer("p1")), vec![]);
        // ack from a peer we never waited for leaves the pending set alone
        assert_eq!(sender.handle_ack(&peer("10.0.0.1"), text_id, &peer("p3")), vec![]);

        // p1 is still pending, so the retry goes out
        assert_eq!(transmitted_id(&sender.attempt_to_send()), -text_id);
    }

    #[test]
    fn test_ack_after_finish_is_ignored() {
        let mut sender = new_sender(&["p1"]);
        let text_id = transmitted_id(&sender.start());

        sender.attempt_to_send();
        sender.attempt_to_send();
        assert_eq!(
            sender.attempt_to_send(),
            vec![SendEffect::Finished { failed_peer_ids: peers(&["p1"]) }]
        );

        assert_eq!(sender.handle_ack(&peer("10.0.0.1"), text_id, &peer("p1")), vec![]);
    }
}
