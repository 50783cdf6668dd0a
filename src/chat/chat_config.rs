use std::time::Duration;

use crate::messaging::multicast::MulticastConfig;

/// Settings of the chat engine. [Default] yields the values the application
/// ships with.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub multicast: MulticastConfig,

    /// how often a text is (re)transmitted before delivery to the remaining
    /// recipients is given up
    pub text_max_attempts: u32,
    pub text_attempt_period: Duration,

    /// capacity of the receiver-side duplicate suppression window
    pub text_max_stored_records: usize,

    pub advertising_period: Duration,
    /// Contacts silent for longer than this are swept. Kept above twice the
    /// advertising period so a single lost advertisement does not evict a peer.
    pub contact_expiry_period: Duration,
}

impl Default for ChatConfig {
    fn default() -> ChatConfig {
        ChatConfig {
            multicast: MulticastConfig::default(),
            text_max_attempts: 3,
            text_attempt_period: Duration::from_millis(1000),
            text_max_stored_records: 10,
            advertising_period: Duration::from_millis(5000),
            contact_expiry_period: Duration::from_millis(11000),
        }
    }
}
