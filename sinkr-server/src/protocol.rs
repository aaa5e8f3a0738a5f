//! Wire protocol types.
//!
//! Three JSON surfaces share these definitions:
//! - source → server envelopes (WebSocket text frames or HTTP POST bodies)
//! - server → source replies, correlated by envelope id
//! - server → sink frames (metadata events and message events)
//!
//! Field names on the wire are camelCase; discriminators are `route`,
//! `source`, `event`, and `type` depending on the surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel authorization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAuthMode {
    Public,
    Private,
    Presence,
}

impl ChannelAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelAuthMode::Public => "public",
            ChannelAuthMode::Private => "private",
            ChannelAuthMode::Presence => "presence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(ChannelAuthMode::Public),
            "private" => Some(ChannelAuthMode::Private),
            "presence" => Some(ChannelAuthMode::Presence),
            _ => None,
        }
    }

    /// Whether subscribing requires an authenticated user id.
    pub fn requires_auth(&self) -> bool {
        matches!(self, ChannelAuthMode::Private | ChannelAuthMode::Presence)
    }
}

// ── Errors surfaced on the wire ────────────────────────────────────────

/// Route-level error strings. `Display` and the serialized form are the
/// exact strings clients match on — do not reword them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RouteError {
    #[serde(rename = "Invalid connection")]
    #[error("Invalid connection")]
    InvalidConnection,
    #[serde(rename = "Invalid request")]
    #[error("Invalid request")]
    InvalidRequest,
    #[serde(rename = "Unknown error")]
    #[error("Unknown error")]
    Unknown,
    #[serde(rename = "Peer not found")]
    #[error("Peer not found")]
    PeerNotFound,
    #[serde(rename = "Peer not authenticated")]
    #[error("Peer not authenticated")]
    PeerNotAuthenticated,
    #[serde(rename = "Peer is not subscribed to channel")]
    #[error("Peer is not subscribed to channel")]
    NotSubscribed,
    #[serde(rename = "Channel not found")]
    #[error("Channel not found")]
    ChannelNotFound,
    #[serde(rename = "Recipient not found")]
    #[error("Recipient not found")]
    RecipientNotFound,
}

// ── Source → server ────────────────────────────────────────────────────

/// The outer envelope a source sends: `{id, data: {route, request}}`.
/// The id is source-assigned and echoed in the reply; for
/// `channel.messages.send` on a stored channel it also becomes the
/// stored message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEnvelope {
    pub id: String,
    pub data: SourceRequest,
}

/// The route union. Internally tagged by `route` with the body in
/// `request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "route", content = "request")]
pub enum SourceRequest {
    #[serde(rename = "user.authenticate")]
    UserAuthenticate(AuthenticateBody),
    #[serde(rename = "channel.create")]
    ChannelCreate(ChannelCreateBody),
    #[serde(rename = "channel.delete")]
    ChannelDelete(ChannelDeleteBody),
    #[serde(rename = "channel.messages.delete")]
    ChannelMessagesDelete(MessagesDeleteBody),
    #[serde(rename = "channel.subscribers.add")]
    ChannelSubscribersAdd(SubscriberBody),
    #[serde(rename = "channel.subscribers.remove")]
    ChannelSubscribersRemove(SubscriberBody),
    #[serde(rename = "channel.messages.send")]
    ChannelMessagesSend(ChannelSendBody),
    #[serde(rename = "user.messages.send")]
    UserMessagesSend(DirectSendBody),
    #[serde(rename = "global.messages.send")]
    GlobalMessagesSend(BroadcastSendBody),
}

impl SourceRequest {
    /// The wire route name, echoed back in the reply.
    pub fn route(&self) -> &'static str {
        match self {
            SourceRequest::UserAuthenticate(_) => "user.authenticate",
            SourceRequest::ChannelCreate(_) => "channel.create",
            SourceRequest::ChannelDelete(_) => "channel.delete",
            SourceRequest::ChannelMessagesDelete(_) => "channel.messages.delete",
            SourceRequest::ChannelSubscribersAdd(_) => "channel.subscribers.add",
            SourceRequest::ChannelSubscribersRemove(_) => "channel.subscribers.remove",
            SourceRequest::ChannelMessagesSend(_) => "channel.messages.send",
            SourceRequest::UserMessagesSend(_) => "user.messages.send",
            SourceRequest::GlobalMessagesSend(_) => "global.messages.send",
        }
    }
}

/// `user.authenticate`: bind a user identity to a live peer. The `id`
/// field is the user id the application assigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateBody {
    pub peer_id: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreateBody {
    pub name: String,
    pub auth_mode: ChannelAuthMode,
    #[serde(default)]
    pub store_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDeleteBody {
    pub channel_id: String,
}

/// Absent or empty `messageIds` deletes every stored message of the
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesDeleteBody {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<String>>,
}

/// `channel.subscribers.add` / `channel.subscribers.remove`. The
/// subscriber id matches a peer id first, then an authenticated user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberBody {
    pub subscriber_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSendBody {
    pub channel_id: String,
    pub event: String,
    pub message: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSendBody {
    pub recipient_id: String,
    pub event: String,
    pub message: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSendBody {
    pub event: String,
    pub message: MessagePayload,
}

/// Message payload. Chunked payloads are carried verbatim — the server
/// never re-assembles chunks, it just preserves the tag and index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    Plain { message: Value },
    Chunk { index: u64, message: Value },
}

// ── Server → source ────────────────────────────────────────────────────

/// Reply to one envelope: `{id, route, response}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReply {
    pub id: String,
    pub route: String,
    pub response: RouteOutcome,
}

/// Per-route response union. Failure is declared first so untagged
/// deserialization picks it whenever an `error` field is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteOutcome {
    Failure {
        success: bool,
        error: RouteError,
    },
    Success {
        success: bool,
        #[serde(rename = "channelId", default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
    },
}

impl RouteOutcome {
    pub fn ok() -> Self {
        RouteOutcome::Success { success: true, channel_id: None }
    }

    pub fn ok_channel(channel_id: String) -> Self {
        RouteOutcome::Success { success: true, channel_id: Some(channel_id) }
    }

    pub fn err(error: RouteError) -> Self {
        RouteOutcome::Failure { success: false, error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RouteOutcome::Success { .. })
    }
}

// ── Server → sink ──────────────────────────────────────────────────────

/// One frame pushed to a sink, discriminated by `source`.
///
/// Metadata frame ids are server-generated; message frame ids echo the
/// originating envelope id (which for stored channels is also the stored
/// message id).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SinkFrame {
    Metadata { id: String, data: MetadataEvent },
    Message { id: String, data: MessageEvent },
}

impl SinkFrame {
    pub fn metadata(data: MetadataEvent) -> Self {
        SinkFrame::Metadata { id: uuid::Uuid::new_v4().to_string(), data }
    }

    pub fn message(id: String, data: MessageEvent) -> Self {
        SinkFrame::Message { id, data }
    }
}

/// Metadata events, discriminated by `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MetadataEvent {
    Init {
        peer_id: String,
    },
    JoinChannel {
        channel_id: String,
        channel_name: String,
        channel_auth_mode: ChannelAuthMode,
        channel_stored_messages: Vec<StoredMessageRef>,
        members: Vec<MemberInfo>,
    },
    LeaveChannel {
        channel_id: String,
    },
    MemberJoin {
        channel_id: String,
        member: MemberInfo,
    },
    MemberLeave {
        channel_id: String,
        member: MemberInfo,
    },
}

/// Reference to a stored message, enough for a sink to decide what to
/// request for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessageRef {
    pub id: String,
    pub date: DateTime<Utc>,
}

/// A channel member as seen by other subscribers. `userInfo` is present
/// only on presence channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

/// A delivered message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub event: String,
    pub from: MessageOrigin,
    pub message: MessagePayload,
}

/// Where a message came from, discriminated by `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum MessageOrigin {
    Broadcast,
    Direct,
    Channel { channel_id: String },
}

// ── Sink → server ──────────────────────────────────────────────────────

/// Commands a sink may send. Anything else on a sink socket (other than a
/// literal `ping` text frame) is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SinkCommand {
    RequestStoredMessages {
        channel_id: String,
        #[serde(default)]
        message_ids: Vec<String>,
    },
}
