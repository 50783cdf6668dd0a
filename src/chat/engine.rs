use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tokio::select;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use crate::chat::chat_config::ChatConfig;
use crate::chat::chat_events::{ChatEvent, ChatEventNotifier};
use crate::chat::contact_list::ContactList;
use crate::chat::dedup_registry::DedupRegistry;
use crate::chat::text_sender::{SendEffect, TextSender};
use crate::messaging::codec::{Envelope, Message};
use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::Transport;

const MAX_NICK_UTF8_BYTES: usize = 64;
const MAX_TEXT_UTF8_BYTES: usize = 255;

#[derive(Debug, Error)]
pub enum ChatError {
    /// A caller-supplied value was rejected at the API boundary. No state was
    /// mutated.
    #[error("bad value: {0}")]
    BadValue(String),
    /// The operation is not allowed in the engine's current state, e.g.
    /// sending a text while the previous one is still in flight.
    #[error("invalid call: {0}")]
    InvalidCall(String),
}

enum Command {
    SendText(String),
}

/// The chat engine: the business logic of a serverless LAN chat.
///
/// A number of identical peers runs on a LAN segment that supports multicast;
/// there is no server. All peers configured with the same group address and
/// port form a single channel. Each peer periodically advertises its presence
/// and builds its contact list from the advertisements of the others. A text
/// is delivered to all peers on the contact list at the moment of sending,
/// guaranteed by acknowledgements and retransmissions up to a configured
/// attempt count.
///
/// Limitations: a nick must fit 64 UTF-8 bytes, a text 255; nicks need not be
/// unique. There is no encryption and no ordering across senders.
///
/// The engine is driven by [ChatEngine::run], a single cooperative loop over
/// inbound datagrams, timers and user commands; everything it owns - contact
/// list, dedup registry, the reliable sender of the text currently in flight -
/// lives inside that loop. The presentation layer consumes
/// [ChatEngine::subscribe] and calls [ChatEngine::send_text] /
/// [ChatEngine::leave_chat].
pub struct ChatEngine<T: Transport> {
    config: Arc<ChatConfig>,
    own_nick: String,
    transport: Arc<T>,
    events: ChatEventNotifier,
    command_tx: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    text_in_flight: AtomicBool,
}

/// The mutable protocol state, owned exclusively by the run loop.
struct EngineState {
    contacts: ContactList,
    dedup: DedupRegistry,
    /// the reliable sender of the text currently in flight, if any
    active_send: Option<TextSender>,
    /// when the active send's next transmission attempt is due
    next_attempt: Option<Instant>,
}

impl<T: Transport> ChatEngine<T> {
    /// Fails with [ChatError::BadValue] if the nick is empty, contains `|` or
    /// exceeds 64 UTF-8 bytes. (By policy nicks should not contain ASCII
    /// control characters either; that is not enforced.)
    pub fn new(
        config: Arc<ChatConfig>,
        own_nick: impl Into<String>,
        transport: Arc<T>,
    ) -> Result<ChatEngine<T>, ChatError> {
        let own_nick = validate_nick(own_nick.into())?;
        let (command_tx, command_rx) = mpsc::channel(16);

        Ok(ChatEngine {
            config,
            own_nick,
            transport,
            events: ChatEventNotifier::new(),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            text_in_flight: AtomicBool::new(false),
        })
    }

    pub fn own_nick(&self) -> &str {
        &self.own_nick
    }

    /// The event stream consumed by the presentation layer.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Drives the engine: advertises presence (first immediately, then
    /// periodically), sweeps expired contacts, dispatches inbound datagrams
    /// and runs the retry schedule of the text in flight. Runs until the
    /// transport fails fatally. May be called once.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut command_rx = self
            .command_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("the chat engine is already running"))?;

        let mut state = EngineState {
            contacts: ContactList::new(self.config.clone(), self.events.clone()),
            dedup: DedupRegistry::new(self.config.text_max_stored_records),
            active_send: None,
            next_attempt: None,
        };

        let mut advertising_ticks = time::interval(self.config.advertising_period);

        loop {
            // the deadline is only armed while a send is in flight; the dummy
            // value is never awaited thanks to the branch precondition
            let attempt_deadline = state
                .next_attempt
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));

            select! {
                received = self.transport.recv() => {
                    match received {
                        Ok((datagram, sender_id)) => {
                            self.on_datagram(&mut state, &datagram, sender_id).await;
                        }
                        Err(e) => {
                            error!("receiving from the transport failed: {}", e);
                            return Err(e.into());
                        }
                    }
                }
                _ = advertising_ticks.tick() => {
                    self.on_advertising_tick(&mut state).await;
                }
                _ = time::sleep_until(attempt_deadline), if state.next_attempt.is_some() => {
                    state.next_attempt = None;
                    let effects = match &mut state.active_send {
                        Some(sender) => sender.attempt_to_send(),
                        None => Vec::new(),
                    };
                    self.apply_send_effects(&mut state, effects).await;
                }
                command = command_rx.recv() => {
                    // we hold a sender ourselves, so the channel never closes
                    if let Some(Command::SendText(text)) = command {
                        self.on_send_text(&mut state, text).await;
                    }
                }
            }
        }
    }

    /// Asynchronously sends the text to all peers currently on the contact
    /// list. Delivery finishing - successfully or after exhausting the
    /// attempts - is reported with a [ChatEvent::TextSent]; until then further
    /// calls fail with [ChatError::InvalidCall]. Texts above 255 UTF-8 bytes
    /// fail with [ChatError::BadValue].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ChatError> {
        let text = text.into();
        if text.len() > MAX_TEXT_UTF8_BYTES {
            return Err(ChatError::BadValue("text is too long".to_owned()));
        }

        if self
            .text_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChatError::InvalidCall(
                "sending the previous text has not finished yet".to_owned(),
            ));
        }

        if self.command_tx.send(Command::SendText(text)).await.is_err() {
            self.text_in_flight.store(false, Ordering::Release);
            return Err(ChatError::InvalidCall("the engine is not running".to_owned()));
        }
        Ok(())
    }

    /// Announces the departure to the channel, best effort: network errors are
    /// logged and swallowed. To be called before the process exits.
    pub async fn leave_chat(&self) {
        self.send_ignoring_error(&Message::Leave {
            sender_nick: self.own_nick.clone(),
        })
        .await;
    }

    async fn on_datagram(&self, state: &mut EngineState, datagram: &[u8], sender_id: PeerId) {
        let envelope = match Message::decode(datagram, sender_id) {
            Ok(envelope) => envelope,
            Err(e) => {
                // corrupted or foreign traffic never propagates
                debug!("dropping unparsable datagram: {}", e);
                return;
            }
        };
        let Envelope { sender_id, message } = envelope;

        match message {
            Message::User { sender_nick } => {
                state.contacts.confirm(&sender_id, &sender_nick);
            }
            Message::Leave { sender_nick } => {
                state.contacts.remove(&sender_id, &sender_nick);
            }
            Message::Text { sender_nick, text_id, text } => {
                debug!(from = ?sender_id, text_id, "<=== text");
                self.send_ignoring_error(&Message::Ack {
                    text_sender_id: sender_id.clone(),
                    text_id,
                })
                .await;

                state.contacts.refresh(&sender_id);
                if state.dedup.observe(&sender_id, text_id) {
                    self.events.send(ChatEvent::TextReceived { text, sender_nick });
                }
            }
            Message::Ack { text_sender_id, text_id } => {
                debug!(from = ?sender_id, text_id, "<=== ack");
                let effects = match &mut state.active_send {
                    // a late ack arriving after finish finds no sender and is dropped
                    Some(sender) => sender.handle_ack(&text_sender_id, text_id, &sender_id),
                    None => Vec::new(),
                };
                self.apply_send_effects(state, effects).await;
            }
        }
    }

    async fn on_advertising_tick(&self, state: &mut EngineState) {
        self.send_ignoring_error(&Message::User {
            sender_nick: self.own_nick.clone(),
        })
        .await;

        // expiry shares the advertising cadence, so it runs at least as often
        // as advertisements go out
        state.contacts.remove_expired();
    }

    async fn on_send_text(&self, state: &mut EngineState, text: String) {
        let recipients = state.contacts.peer_ids();
        let mut sender = TextSender::new(
            self.transport.own_id(),
            text,
            recipients,
            self.config.text_max_attempts,
        );
        let effects = sender.start();
        state.active_send = Some(sender);
        self.apply_send_effects(state, effects).await;
    }

    async fn apply_send_effects(&self, state: &mut EngineState, effects: Vec<SendEffect>) {
        for effect in effects {
            match effect {
                SendEffect::Transmit { text, text_id } => {
                    debug!(text_id, "===> text");
                    let message = Message::Text {
                        sender_nick: self.own_nick.clone(),
                        text_id,
                        text,
                    };
                    if let Err(e) = self.transport.send(message.encode().as_bytes()).await {
                        // the retry schedule keeps running regardless
                        warn!("error sending text attempt: {}", e);
                        self.events.send(ChatEvent::NetworkError {
                            message: e.to_string(),
                        });
                    }
                    if state.active_send.is_some() {
                        state.next_attempt =
                            Some(Instant::now() + self.config.text_attempt_period);
                    }
                }
                SendEffect::Finished { failed_peer_ids } => {
                    state.active_send = None;
                    state.next_attempt = None;
                    self.text_in_flight.store(false, Ordering::Release);

                    let mut failed_peer_ids = failed_peer_ids.into_iter().collect::<Vec<_>>();
                    failed_peer_ids.sort();
                    self.events.send(ChatEvent::TextSent { failed_peer_ids });
                }
            }
        }
    }

    /// Advertisements, leaves and acks are best effort: a send failure must
    /// not disturb the protocol.
    async fn send_ignoring_error(&self, message: &Message) {
        if let Err(e) = self.transport.send(message.encode().as_bytes()).await {
            debug!("error sending datagram: {}", e);
        }
    }
}

fn validate_nick(nick: String) -> Result<String, ChatError> {
    if nick.is_empty() {
        return Err(ChatError::BadValue("nick must not be empty".to_owned()));
    }
    if nick.contains('|') {
        return Err(ChatError::BadValue("nick must not contain '|'".to_owned()));
    }
    if nick.len() > MAX_NICK_UTF8_BYTES {
        return Err(ChatError::BadValue("nick is too long".to_owned()));
    }
    Ok(nick)
}
