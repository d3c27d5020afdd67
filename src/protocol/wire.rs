//! # Wire Layout
//!
//! Command discriminators and the payload encodings shared by every protocol
//! version. Version variants differ only in the parameters passed in here
//! (timestamp width, which commands exist), never in the framing.
//!
//! ## Payload shapes
//! ```text
//! request:   [Command(1)] [RequestId(4)] [Body]
//! response:  [Command(1)] [RequestId(4)] [Body]
//! event:     [Command(1)] [Body]
//! ```
//! Lists are a `u32` count followed by the items. Optional strings are a bool
//! presence marker followed by the string when present.

use super::message::{ChatMessage, Chunk, Conversation, Event, Modifier, ModifierKind, Request, Response};
use crate::core::packer::{Packer, Unpacker};
use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;

// Client to relay
pub const HELLO: u8 = 0x01;
pub const AUTHENTICATE: u8 = 0x02;
pub const PING: u8 = 0x03;
pub const SEND_MESSAGE: u8 = 0x10;
pub const FETCH_CONVERSATIONS: u8 = 0x11;
pub const FETCH_MESSAGES: u8 = 0x12;
pub const MARK_READ: u8 = 0x13;
pub const SEND_MODIFIER: u8 = 0x14;
pub const UPLOAD_CHUNK: u8 = 0x15;

// Relay to client
pub const HELLO_ACK: u8 = 0x81;
pub const VERSION_REJECTED: u8 = 0x82;
pub const PONG: u8 = 0x83;
pub const RESPONSE_OK: u8 = 0x90;
pub const RESPONSE_ERROR: u8 = 0x91;
pub const AUTH_RESULT: u8 = 0x92;
pub const MESSAGE_SENT: u8 = 0x93;
pub const CONVERSATIONS: u8 = 0x94;
pub const MESSAGES: u8 = 0x95;
pub const UPLOAD_PROGRESS: u8 = 0x96;
pub const UPLOAD_COMPLETE: u8 = 0x97;
pub const EVENT_MESSAGES: u8 = 0xA0;
pub const EVENT_MODIFIERS: u8 = 0xA1;
pub const EVENT_ATTACHMENT_CHUNK: u8 = 0xA2;

const MODIFIER_REACTION: u8 = 0;
const MODIFIER_EDIT: u8 = 1;
const MODIFIER_RETRACT: u8 = 2;

/// Name of a command for logging.
#[inline]
pub fn command_name(command: u8) -> &'static str {
    match command {
        HELLO => "HELLO",
        AUTHENTICATE => "AUTHENTICATE",
        PING => "PING",
        SEND_MESSAGE => "SEND_MESSAGE",
        FETCH_CONVERSATIONS => "FETCH_CONVERSATIONS",
        FETCH_MESSAGES => "FETCH_MESSAGES",
        MARK_READ => "MARK_READ",
        SEND_MODIFIER => "SEND_MODIFIER",
        UPLOAD_CHUNK => "UPLOAD_CHUNK",
        HELLO_ACK => "HELLO_ACK",
        VERSION_REJECTED => "VERSION_REJECTED",
        PONG => "PONG",
        RESPONSE_OK => "RESPONSE_OK",
        RESPONSE_ERROR => "RESPONSE_ERROR",
        AUTH_RESULT => "AUTH_RESULT",
        MESSAGE_SENT => "MESSAGE_SENT",
        CONVERSATIONS => "CONVERSATIONS",
        MESSAGES => "MESSAGES",
        UPLOAD_PROGRESS => "UPLOAD_PROGRESS",
        UPLOAD_COMPLETE => "UPLOAD_COMPLETE",
        EVENT_MESSAGES => "EVENT_MESSAGES",
        EVENT_MODIFIERS => "EVENT_MODIFIERS",
        EVENT_ATTACHMENT_CHUNK => "EVENT_ATTACHMENT_CHUNK",
        _ => "UNKNOWN",
    }
}

/// How a timestamp is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// `int32` unix seconds
    Seconds32,
    /// `int64` unix milliseconds
    Millis64,
}

impl TimestampFormat {
    pub fn write(self, packer: &mut Packer, millis: i64) {
        match self {
            TimestampFormat::Seconds32 => {
                let secs = (millis / 1000).clamp(i64::from(i32::MIN), i64::from(i32::MAX));
                packer.write_i32(secs as i32);
            }
            TimestampFormat::Millis64 => {
                packer.write_i64(millis);
            }
        }
    }

    pub fn read(self, unpacker: &mut Unpacker) -> Result<i64> {
        match self {
            TimestampFormat::Seconds32 => Ok(i64::from(unpacker.read_i32()?) * 1000),
            TimestampFormat::Millis64 => unpacker.read_i64(),
        }
    }
}

/// A frame decoded after version negotiation.
#[derive(Debug)]
pub enum Inbound {
    /// Correlated reply. `result` is an error for relay-side failures and for
    /// bodies that could not be parsed; neither is fatal for the connection.
    Response {
        request_id: u32,
        result: Result<Response>,
    },
    Event(Event),
    Chunk(Chunk),
    Pong { sent_at: i64 },
}

pub fn write_opt_string(packer: &mut Packer, value: Option<&str>) {
    match value {
        Some(value) => {
            packer.write_bool(true).write_string(value);
        }
        None => {
            packer.write_bool(false);
        }
    }
}

pub fn read_opt_string(unpacker: &mut Unpacker) -> Result<Option<String>> {
    if unpacker.read_bool()? {
        Ok(Some(unpacker.read_string()?))
    } else {
        Ok(None)
    }
}

/// Read a list count, refusing counts the remaining bytes can not possibly hold.
fn read_count(unpacker: &mut Unpacker, min_item_len: usize) -> Result<usize> {
    let count = unpacker.read_u32()? as usize;
    let needed = count.saturating_mul(min_item_len.max(1));
    if needed > unpacker.remaining() {
        return Err(ProtocolError::Underrun {
            needed,
            remaining: unpacker.remaining(),
        });
    }
    Ok(count)
}

fn read_list<T>(
    unpacker: &mut Unpacker,
    min_item_len: usize,
    mut read_item: impl FnMut(&mut Unpacker) -> Result<T>,
) -> Result<Vec<T>> {
    let count = read_count(unpacker, min_item_len)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_item(unpacker)?);
    }
    Ok(items)
}

pub fn write_chunk(packer: &mut Packer, chunk: &Chunk) {
    packer
        .write_u32(chunk.transfer_id)
        .write_u32(chunk.sequence_index)
        .write_bool(chunk.is_final)
        .write_blob(&chunk.data);
}

pub fn read_chunk(unpacker: &mut Unpacker) -> Result<Chunk> {
    Ok(Chunk {
        transfer_id: unpacker.read_u32()?,
        sequence_index: unpacker.read_u32()?,
        is_final: unpacker.read_bool()?,
        data: unpacker.read_blob()?,
    })
}

pub fn write_modifier(packer: &mut Packer, modifier: &Modifier) {
    packer
        .write_string(&modifier.conversation_id)
        .write_string(&modifier.message_id)
        .write_string(&modifier.sender);
    match &modifier.kind {
        ModifierKind::Reaction { emoji } => {
            packer.write_u8(MODIFIER_REACTION).write_string(emoji);
        }
        ModifierKind::Edit { text } => {
            packer.write_u8(MODIFIER_EDIT).write_string(text);
        }
        ModifierKind::Retract => {
            packer.write_u8(MODIFIER_RETRACT);
        }
    }
}

pub fn read_modifier(unpacker: &mut Unpacker) -> Result<Modifier> {
    let conversation_id = unpacker.read_string()?;
    let message_id = unpacker.read_string()?;
    let sender = unpacker.read_string()?;
    let kind = match unpacker.read_u8()? {
        MODIFIER_REACTION => ModifierKind::Reaction {
            emoji: unpacker.read_string()?,
        },
        MODIFIER_EDIT => ModifierKind::Edit {
            text: unpacker.read_string()?,
        },
        MODIFIER_RETRACT => ModifierKind::Retract,
        other => {
            return Err(ProtocolError::MalformedFrame(format!(
                "unknown modifier kind {other}"
            )))
        }
    };
    Ok(Modifier {
        conversation_id,
        message_id,
        sender,
        kind,
    })
}

pub fn write_conversation(packer: &mut Packer, conversation: &Conversation, ts: TimestampFormat) {
    packer
        .write_string(&conversation.id)
        .write_string(&conversation.title)
        .write_i32(conversation.unread_count);
    ts.write(packer, conversation.last_activity);
}

pub fn read_conversation(unpacker: &mut Unpacker, ts: TimestampFormat) -> Result<Conversation> {
    Ok(Conversation {
        id: unpacker.read_string()?,
        title: unpacker.read_string()?,
        unread_count: unpacker.read_i32()?,
        last_activity: ts.read(unpacker)?,
    })
}

pub fn write_message(packer: &mut Packer, message: &ChatMessage, ts: TimestampFormat) {
    packer
        .write_string(&message.id)
        .write_string(&message.conversation_id)
        .write_string(&message.sender)
        .write_string(&message.text);
    ts.write(packer, message.timestamp);
    packer.write_bool(message.from_me);
    write_opt_string(packer, message.attachment_id.as_deref());
}

pub fn read_message(unpacker: &mut Unpacker, ts: TimestampFormat) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: unpacker.read_string()?,
        conversation_id: unpacker.read_string()?,
        sender: unpacker.read_string()?,
        text: unpacker.read_string()?,
        timestamp: ts.read(unpacker)?,
        from_me: unpacker.read_bool()?,
        attachment_id: read_opt_string(unpacker)?,
    })
}

/// Command plus request id; the caller appends the body.
pub fn request_header(command: u8, request_id: u32) -> Packer {
    let mut packer = Packer::new();
    packer.write_u8(command).write_u32(request_id);
    packer
}

pub fn ping(sent_at: i64, ts: TimestampFormat) -> Bytes {
    let mut packer = Packer::with_capacity(9);
    packer.write_u8(PING);
    ts.write(&mut packer, sent_at);
    packer.finish()
}

/// Encode any request. Callers have already checked the request is
/// supported by their version.
pub fn encode_request(request_id: u32, request: &Request, ts: TimestampFormat) -> Bytes {
    match request {
        Request::SendMessage {
            conversation_id,
            text,
            reply_to,
            attachment_id,
        } => {
            let mut p = request_header(SEND_MESSAGE, request_id);
            p.write_string(conversation_id).write_string(text);
            write_opt_string(&mut p, reply_to.as_deref());
            write_opt_string(&mut p, attachment_id.as_deref());
            p.finish()
        }
        Request::FetchConversations { limit, offset } => {
            let mut p = request_header(FETCH_CONVERSATIONS, request_id);
            p.write_i32(*limit).write_i32(*offset);
            p.finish()
        }
        Request::FetchMessages {
            conversation_id,
            limit,
            before,
        } => {
            let mut p = request_header(FETCH_MESSAGES, request_id);
            p.write_string(conversation_id).write_i32(*limit);
            match before {
                Some(before) => {
                    p.write_bool(true);
                    ts.write(&mut p, *before);
                }
                None => {
                    p.write_bool(false);
                }
            }
            p.finish()
        }
        Request::MarkRead {
            conversation_id,
            message_id,
        } => {
            let mut p = request_header(MARK_READ, request_id);
            p.write_string(conversation_id).write_string(message_id);
            p.finish()
        }
        Request::SendModifier(modifier) => {
            let mut p = request_header(SEND_MODIFIER, request_id);
            write_modifier(&mut p, modifier);
            p.finish()
        }
        Request::UploadChunk(chunk) => {
            let mut p = request_header(UPLOAD_CHUNK, request_id);
            write_chunk(&mut p, chunk);
            p.finish()
        }
    }
}

/// Parse a response body. The outer `Result` is a parse failure, the inner
/// one is what the relay reported.
fn decode_response(
    command: u8,
    unpacker: &mut Unpacker,
    ts: TimestampFormat,
) -> Result<Result<Response>> {
    let result = match command {
        RESPONSE_OK => Ok(Response::Ack),
        RESPONSE_ERROR => Err(ProtocolError::Relay {
            code: unpacker.read_i32()?,
            message: unpacker.read_string()?,
        }),
        AUTH_RESULT => {
            let accepted = unpacker.read_bool()?;
            let detail = unpacker.read_string()?;
            if accepted {
                Ok(Response::Authenticated { detail })
            } else {
                Err(ProtocolError::AuthenticationFailed(detail))
            }
        }
        MESSAGE_SENT => Ok(Response::MessageSent {
            message_id: unpacker.read_string()?,
            timestamp: ts.read(unpacker)?,
        }),
        CONVERSATIONS => Ok(Response::Conversations(read_list(unpacker, 16, |u| {
            read_conversation(u, ts)
        })?)),
        MESSAGES => Ok(Response::Messages(read_list(unpacker, 22, |u| {
            read_message(u, ts)
        })?)),
        UPLOAD_PROGRESS => Ok(Response::UploadProgress {
            upload_id: unpacker.read_u32()?,
            sequence_index: unpacker.read_u32()?,
        }),
        UPLOAD_COMPLETE => Ok(Response::UploadComplete {
            upload_id: unpacker.read_u32()?,
            attachment_id: unpacker.read_string()?,
        }),
        other => return Err(ProtocolError::UnknownCommand(other)),
    };
    unpacker.finish()?;
    Ok(result)
}

/// Decode a post-handshake frame.
///
/// Header problems, unknown commands and malformed events are errors (fatal
/// for the connection). A malformed response body only fails its request.
pub fn decode_frame(payload: Bytes, ts: TimestampFormat, modifiers: bool) -> Result<Inbound> {
    if payload.is_empty() {
        return Err(ProtocolError::MalformedFrame(
            constants::ERR_EMPTY_PAYLOAD.into(),
        ));
    }
    let mut unpacker = Unpacker::new(payload);
    let command = unpacker.read_u8()?;

    let inbound = match command {
        RESPONSE_OK | RESPONSE_ERROR | AUTH_RESULT | MESSAGE_SENT | CONVERSATIONS | MESSAGES
        | UPLOAD_PROGRESS | UPLOAD_COMPLETE => {
            let request_id = unpacker.read_u32()?;
            let result = decode_response(command, &mut unpacker, ts).unwrap_or_else(|e| {
                Err(ProtocolError::MalformedResponse(format!(
                    "{}: {e}",
                    command_name(command)
                )))
            });
            return Ok(Inbound::Response { request_id, result });
        }
        PONG => Inbound::Pong {
            sent_at: ts.read(&mut unpacker)?,
        },
        EVENT_MESSAGES => Inbound::Event(Event::Messages(read_list(&mut unpacker, 22, |u| {
            read_message(u, ts)
        })?)),
        EVENT_MODIFIERS if modifiers => {
            Inbound::Event(Event::Modifiers(read_list(&mut unpacker, 13, read_modifier)?))
        }
        EVENT_ATTACHMENT_CHUNK => Inbound::Chunk(read_chunk(&mut unpacker)?),
        HELLO_ACK | VERSION_REJECTED => {
            return Err(ProtocolError::MalformedFrame(
                constants::ERR_UNEXPECTED_HANDSHAKE.into(),
            ))
        }
        other => return Err(ProtocolError::UnknownCommand(other)),
    };
    unpacker.finish()?;
    Ok(inbound)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_message() -> ChatMessage {
        ChatMessage {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender: "alice".into(),
            text: "hi".into(),
            timestamp: 1_700_000_000_123,
            from_me: false,
            attachment_id: Some("att-9".into()),
        }
    }

    #[test]
    fn test_request_header_layout() {
        let bytes = encode_request(
            0x0102_0304,
            &Request::MarkRead {
                conversation_id: "c".into(),
                message_id: "m".into(),
            },
            TimestampFormat::Millis64,
        );
        assert_eq!(&bytes[..5], &[MARK_READ, 1, 2, 3, 4]);
    }

    #[test]
    fn test_seconds_format_truncates_to_whole_seconds() {
        let mut packer = Packer::new();
        TimestampFormat::Seconds32.write(&mut packer, 1_700_000_000_999);
        let bytes = packer.finish();
        assert_eq!(bytes.len(), 4);
        let mut unpacker = Unpacker::new(bytes);
        assert_eq!(
            TimestampFormat::Seconds32.read(&mut unpacker).unwrap(),
            1_700_000_000_000
        );
    }

    #[test]
    fn test_event_messages_decode() {
        let mut p = Packer::new();
        p.write_u8(EVENT_MESSAGES).write_u32(1);
        write_message(&mut p, &sample_message(), TimestampFormat::Millis64);
        let inbound = decode_frame(p.finish(), TimestampFormat::Millis64, true).unwrap();
        match inbound {
            Inbound::Event(Event::Messages(messages)) => {
                assert_eq!(messages, vec![sample_message()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_relay_error_is_request_failure() {
        let mut p = request_header(RESPONSE_ERROR, 7);
        p.write_i32(404).write_string("no such conversation");
        match decode_frame(p.finish(), TimestampFormat::Millis64, true).unwrap() {
            Inbound::Response { request_id, result } => {
                assert_eq!(request_id, 7);
                assert!(matches!(result, Err(ProtocolError::Relay { code: 404, .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_body_fails_only_the_request() {
        let mut p = request_header(MESSAGE_SENT, 9);
        p.write_u8(0xFF);
        match decode_frame(p.finish(), TimestampFormat::Millis64, true).unwrap() {
            Inbound::Response { request_id: 9, result } => {
                assert!(matches!(result, Err(ProtocolError::MalformedResponse(_))));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncated_response_header_is_fatal() {
        let bytes = Bytes::from_static(&[RESPONSE_OK, 0, 0]);
        assert!(matches!(
            decode_frame(bytes, TimestampFormat::Millis64, true),
            Err(ProtocolError::Underrun { .. })
        ));
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let bytes = Bytes::from_static(&[0x7F, 0, 0, 0, 1]);
        assert!(matches!(
            decode_frame(bytes, TimestampFormat::Millis64, true),
            Err(ProtocolError::UnknownCommand(0x7F))
        ));
    }

    #[test]
    fn test_modifier_events_gated() {
        let mut p = Packer::new();
        p.write_u8(EVENT_MODIFIERS).write_u32(0);
        let bytes = p.finish();
        assert!(decode_frame(bytes.clone(), TimestampFormat::Millis64, true).is_ok());
        assert!(matches!(
            decode_frame(bytes, TimestampFormat::Seconds32, false),
            Err(ProtocolError::UnknownCommand(EVENT_MODIFIERS))
        ));
    }

    #[test]
    fn test_absurd_list_count_rejected_before_allocating() {
        let mut p = Packer::new();
        p.write_u8(EVENT_MESSAGES).write_u32(u32::MAX);
        assert!(matches!(
            decode_frame(p.finish(), TimestampFormat::Millis64, true),
            Err(ProtocolError::Underrun { .. })
        ));
    }
}
