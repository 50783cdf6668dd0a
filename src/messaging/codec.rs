use thiserror::Error;

use crate::messaging::peer_id::PeerId;

/// Error parsing a datagram payload into a [Message].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("unable to parse message: {0}")]
pub struct ParseError(pub String);

/// The messages peers exchange on the channel.
///
/// Each message travels as a single UDP datagram whose payload is the message
/// serialized as a UTF-8 string, fields separated by `|`:
///
/// ```text
/// user|<sender.nick>                    periodic presence advertisement
/// leave|<sender.nick>                   graceful exit
/// text|<sender.nick>|<text.id>|<text>   chat text, answered with an ack
/// ack|<text.sender.id>|<text.id>        confirms reception of a text
/// ```
///
/// Only the last field of a message may contain `|`, so for `text` the body may
/// carry the delimiter (and newlines, and may be empty) while nicks may not.
/// `<text.id>` is a signed 64-bit integer whose semantics the codec does not
/// interpret; it is unique per sender among that sender's texts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    User { sender_nick: String },
    Leave { sender_nick: String },
    Text { sender_nick: String, text_id: i64, text: String },
    Ack { text_sender_id: PeerId, text_id: i64 },
}

/// A decoded message together with the id of the peer it came from.
///
/// The sender id is supplied out-of-band by the transport (the datagram's
/// source address) and is never part of the serialized form.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub sender_id: PeerId,
    pub message: Message,
}

const TYPE_USER: &str = "user";
const TYPE_LEAVE: &str = "leave";
const TYPE_TEXT: &str = "text";
const TYPE_ACK: &str = "ack";

impl Message {
    /// Serializes the message to its wire form. This is the inverse of
    /// [Message::decode] and round-trips every value the decoder can produce.
    pub fn encode(&self) -> String {
        match self {
            Message::User { sender_nick } => format!("{TYPE_USER}|{sender_nick}"),
            Message::Leave { sender_nick } => format!("{TYPE_LEAVE}|{sender_nick}"),
            Message::Text { sender_nick, text_id, text } => {
                format!("{TYPE_TEXT}|{sender_nick}|{text_id}|{text}")
            }
            Message::Ack { text_sender_id, text_id } => {
                format!("{TYPE_ACK}|{text_sender_id}|{text_id}")
            }
        }
    }

    /// Parses a received datagram payload, attaching the observed sender id.
    ///
    /// Rejected with a descriptive [ParseError]: payloads that are not UTF-8,
    /// have no `|` at all, name an unknown message type, contain an empty
    /// non-terminal field, carry trailing fields beyond what the variant
    /// defines (even empty ones), or whose `<text.id>` does not parse as i64.
    pub fn decode(datagram: &[u8], sender_id: PeerId) -> Result<Envelope, ParseError> {
        let payload = std::str::from_utf8(datagram)
            .map_err(|e| ParseError(format!("datagram is not valid UTF-8: {}", e)))?;

        let mut rest = payload;
        let message_type = next_field(&mut rest, "message.type")?;

        let message = match message_type {
            TYPE_USER => Message::User {
                sender_nick: last_field(rest, "sender.nick")?.to_owned(),
            },
            TYPE_LEAVE => Message::Leave {
                sender_nick: last_field(rest, "sender.nick")?.to_owned(),
            },
            TYPE_TEXT => {
                let sender_nick = next_field(&mut rest, "sender.nick")?.to_owned();
                let text_id = parse_text_id(next_field(&mut rest, "text.id")?)?;
                // the body is the terminal field: it may be empty and may contain '|'
                Message::Text {
                    sender_nick,
                    text_id,
                    text: rest.to_owned(),
                }
            }
            TYPE_ACK => {
                let text_sender_id = next_field(&mut rest, "text.sender.id")?;
                let text_id = parse_text_id(last_field(rest, "text.id")?)?;
                Message::Ack {
                    text_sender_id: PeerId::from(text_sender_id),
                    text_id,
                }
            }
            unknown => {
                return Err(ParseError(format!("unknown message type {:?}", unknown)));
            }
        };

        Ok(Envelope { sender_id, message })
    }
}

/// Parses the next (non-terminal) field of a `|`-separated string, advancing
/// `rest` past the delimiter. Non-terminal fields must not be empty.
fn next_field<'a>(rest: &mut &'a str, field_name: &str) -> Result<&'a str, ParseError> {
    let Some(pos) = rest.find('|') else {
        return Err(ParseError(format!("<{}> must not be the last field", field_name)));
    };

    let value = &rest[..pos];
    *rest = &rest[pos + 1..];

    if value.is_empty() {
        return Err(ParseError(format!("<{}> must not be empty", field_name)));
    }
    Ok(value)
}

/// Parses the terminal field of a `|`-separated string: nothing may follow it,
/// and it must not be empty.
fn last_field<'a>(rest: &'a str, field_name: &str) -> Result<&'a str, ParseError> {
    if rest.contains('|') {
        return Err(ParseError(format!(
            "unexpected trailing fields after <{}>: {:?}",
            field_name, rest
        )));
    }
    if rest.is_empty() {
        return Err(ParseError(format!("<{}> must not be empty", field_name)));
    }
    Ok(rest)
}

fn parse_text_id(raw: &str) -> Result<i64, ParseError> {
    raw.parse()
        .map_err(|_| ParseError(format!("{:?} is not a valid text id, int64 expected", raw)))
}
