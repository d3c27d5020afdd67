//! Application-level values carried by the protocol.
//!
//! Every request kind is its own variant carrying only the fields it needs.
//! Timestamps are unix milliseconds in memory regardless of how the negotiated
//! protocol version puts them on the wire.

use bytes::Bytes;

/// A conversation summary as listed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub unread_count: i32,
    /// Unix milliseconds of the latest message
    pub last_activity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub text: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub from_me: bool,
    pub attachment_id: Option<String>,
}

/// Change applied to an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifierKind {
    Reaction { emoji: String },
    Edit { text: String },
    Retract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modifier {
    pub conversation_id: String,
    pub message_id: String,
    pub sender: String,
    pub kind: ModifierKind,
}

/// One piece of a chunked transfer, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Shared identity of every chunk in the transfer
    pub transfer_id: u32,
    /// Starts at 0, increases by one per chunk
    pub sequence_index: u32,
    pub is_final: bool,
    pub data: Bytes,
}

/// Correlated requests a caller can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SendMessage {
        conversation_id: String,
        text: String,
        reply_to: Option<String>,
        attachment_id: Option<String>,
    },
    FetchConversations {
        limit: i32,
        offset: i32,
    },
    FetchMessages {
        conversation_id: String,
        limit: i32,
        /// Only messages strictly older than this unix-millisecond timestamp
        before: Option<i64>,
    },
    MarkRead {
        conversation_id: String,
        message_id: String,
    },
    SendModifier(Modifier),
    UploadChunk(Chunk),
}

impl Request {
    /// Stable name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Request::SendMessage { .. } => "send_message",
            Request::FetchConversations { .. } => "fetch_conversations",
            Request::FetchMessages { .. } => "fetch_messages",
            Request::MarkRead { .. } => "mark_read",
            Request::SendModifier(_) => "send_modifier",
            Request::UploadChunk(_) => "upload_chunk",
        }
    }
}

/// Successful results of correlated requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    Authenticated { detail: String },
    MessageSent { message_id: String, timestamp: i64 },
    Conversations(Vec<Conversation>),
    Messages(Vec<ChatMessage>),
    UploadProgress { upload_id: u32, sequence_index: u32 },
    UploadComplete { upload_id: u32, attachment_id: String },
}

/// Unsolicited data pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Messages(Vec<ChatMessage>),
    Modifiers(Vec<Modifier>),
    /// A relay-pushed transfer, surfaced only once every chunk arrived.
    Attachment { transfer_id: u32, data: Bytes },
}

/// Result of a completed chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub upload_id: u32,
    pub attachment_id: String,
    pub chunks: u32,
    pub bytes: u64,
}
