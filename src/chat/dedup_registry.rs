use std::collections::VecDeque;

use crate::messaging::peer_id::PeerId;

/// Receiver-side duplicate suppression.
///
/// Senders retransmit a text until every recipient acknowledges it, so a text
/// whose ack was lost arrives again. Retries carry the negated text id, and the
/// registry keeps a bounded FIFO of recently delivered `(sender, |text id|)`
/// pairs to decide whether an incoming text should reach the user.
///
/// The registry is bounded: a duplicate arriving only after its original's
/// entry was evicted is delivered again. That is the accepted price for
/// constant memory.
pub struct DedupRegistry {
    max_stored_records: usize,
    registry: VecDeque<(PeerId, u64)>,
}

impl DedupRegistry {
    pub fn new(max_stored_records: usize) -> DedupRegistry {
        DedupRegistry {
            max_stored_records,
            registry: VecDeque::new(),
        }
    }

    /// Decides whether a received text is seen for the first time (true:
    /// deliver to the user) or is a duplicate (false: suppress).
    ///
    /// A positive id on the wire marks a first attempt and is always delivered.
    /// An id <= 0 marks a retry (0 never appears on the wire from our senders
    /// but falls into the retry branch): it is delivered only if the original
    /// is absent from the registry, i.e. was lost.
    pub fn observe(&mut self, sender_id: &PeerId, text_id_on_wire: i64) -> bool {
        if text_id_on_wire > 0 {
            self.add(sender_id, text_id_on_wire as u64);
            return true;
        }

        let magnitude = text_id_on_wire.unsigned_abs();
        if self.contains(sender_id, magnitude) {
            false
        } else {
            // a retry whose original never arrived counts as first delivery
            self.add(sender_id, magnitude);
            true
        }
    }

    fn contains(&self, sender_id: &PeerId, magnitude: u64) -> bool {
        // newest to oldest: duplicates are usually recent
        self.registry
            .iter()
            .rev()
            .any(|(stored_sender, stored_magnitude)| {
                *stored_magnitude == magnitude && stored_sender == sender_id
            })
    }

    fn add(&mut self, sender_id: &PeerId, magnitude: u64) {
        self.registry.push_back((sender_id.clone(), magnitude));
        if self.registry.len() > self.max_stored_records {
            self.registry.pop_front();
        }
    }
}
