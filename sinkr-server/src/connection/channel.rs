//! Channel engine: authorization, membership transitions, presence
//! notifications, stored-message policy, and the three delivery modes.
//!
//! The engine is stateless — durable state lives in the store, live
//! handles in the registries. Every membership mutation runs inside a
//! single store lock (the `with_db` closure), so the member snapshot a
//! notification is built from is the state as of that commit. Fan-out
//! after the commit is best-effort: a dead peer's failed send is
//! swallowed and its disconnect handler converges state.

use serde::Deserialize;
use serde_json::json;

use crate::db::{PeerRow, SubscriptionInsert};
use crate::protocol::{
    AuthenticateBody, BroadcastSendBody, ChannelAuthMode, ChannelCreateBody, ChannelDeleteBody,
    ChannelSendBody, DirectSendBody, MemberInfo, MessageEvent, MessageOrigin, MessagesDeleteBody,
    MetadataEvent, RouteError, RouteOutcome, SinkFrame, StoredMessageRef, SubscriberBody,
};
use crate::registry::PeerRegistry;
use crate::server::SharedState;

fn member_info(peer: &PeerRow, auth: ChannelAuthMode) -> MemberInfo {
    MemberInfo {
        id: peer.member_id().to_string(),
        user_info: if auth == ChannelAuthMode::Presence { peer.user_info.clone() } else { None },
    }
}

/// `user.authenticate`: bind a user identity (and optional user info) to
/// a live peer.
pub fn authenticate_user(
    state: &SharedState,
    app_id: &str,
    body: &AuthenticateBody,
) -> Result<RouteOutcome, RouteError> {
    let updated = state.with_db(|db| {
        db.authenticate_peer(app_id, &body.peer_id, &body.id, body.user_info.as_ref())
    })?;
    if !updated {
        return Err(RouteError::PeerNotFound);
    }
    Ok(RouteOutcome::ok())
}

/// `channel.create`: upsert by `(app, name)`; an existing channel keeps
/// its id and gets its auth mode and store flag updated.
pub fn create_channel(
    state: &SharedState,
    app_id: &str,
    body: &ChannelCreateBody,
) -> Result<RouteOutcome, RouteError> {
    let channel = state.with_db(|db| {
        db.upsert_channel(app_id, &body.name, body.auth_mode, body.store_messages)
    })?;
    Ok(RouteOutcome::ok_channel(channel.id))
}

/// `channel.delete`: cascade-deletes subscriptions and stored messages.
pub fn delete_channel(
    state: &SharedState,
    app_id: &str,
    body: &ChannelDeleteBody,
) -> Result<RouteOutcome, RouteError> {
    let existed = state.with_db(|db| db.delete_channel(app_id, &body.channel_id))?;
    if !existed {
        return Err(RouteError::ChannelNotFound);
    }
    Ok(RouteOutcome::ok())
}

/// `channel.messages.delete`: absent or empty id set deletes everything.
pub fn delete_messages(
    state: &SharedState,
    app_id: &str,
    body: &MessagesDeleteBody,
) -> Result<RouteOutcome, RouteError> {
    let deleted = state.with_db(|db| {
        let Some(channel) = db.get_channel(app_id, &body.channel_id)? else {
            return Ok(None);
        };
        let deleted = db.delete_stored_messages(&channel.id, body.message_ids.as_deref())?;
        Ok(Some(deleted))
    })?;
    match deleted {
        Some(n) => {
            tracing::debug!(channel = %body.channel_id, deleted = n, "deleted stored messages");
            Ok(RouteOutcome::ok())
        }
        None => Err(RouteError::ChannelNotFound),
    }
}

struct SubscribeSnapshot {
    channel_id: String,
    channel_name: String,
    auth: ChannelAuthMode,
    peer: PeerRow,
    others: Vec<PeerRow>,
    stored: Vec<StoredMessageRef>,
    duplicate: bool,
}

/// `channel.subscribers.add`: validate, insert the membership row, then
/// notify — `join-channel` to the subscriber, `member-join` to everyone
/// already there. A duplicate subscribe succeeds without re-notifying.
pub fn subscribe(
    state: &SharedState,
    app_id: &str,
    body: &SubscriberBody,
) -> Result<RouteOutcome, RouteError> {
    let snapshot = state.with_db(|db| {
        let Some(channel) = db.get_channel(app_id, &body.channel_id)? else {
            return Ok(Err(RouteError::ChannelNotFound));
        };
        let Some(peer) = db.resolve_peers(app_id, &body.subscriber_id)?.into_iter().next() else {
            return Ok(Err(RouteError::PeerNotFound));
        };
        if channel.auth.requires_auth() && peer.user_id.is_none() {
            return Ok(Err(RouteError::PeerNotAuthenticated));
        }
        let inserted = db.insert_subscription(app_id, &peer.id, &channel.id)?;
        let duplicate = inserted == SubscriptionInsert::Duplicate;
        let others = if duplicate { Vec::new() } else { db.channel_members(&channel.id, Some(&peer.id))? };
        let stored = if channel.store && !duplicate {
            db.stored_message_refs(&channel.id)?
                .into_iter()
                .map(|(id, date)| StoredMessageRef { id, date })
                .collect()
        } else {
            Vec::new()
        };
        Ok(Ok(SubscribeSnapshot {
            channel_id: channel.id,
            channel_name: channel.name,
            auth: channel.auth,
            peer,
            others,
            stored,
            duplicate,
        }))
    })??;

    if snapshot.duplicate {
        return Ok(RouteOutcome::ok());
    }

    let join = SinkFrame::metadata(MetadataEvent::JoinChannel {
        channel_id: snapshot.channel_id.clone(),
        channel_name: snapshot.channel_name,
        channel_auth_mode: snapshot.auth,
        channel_stored_messages: snapshot.stored,
        members: snapshot.others.iter().map(|p| member_info(p, snapshot.auth)).collect(),
    });
    let mut success = state
        .coordinator
        .fan_out_to_peers(std::slice::from_ref(&snapshot.peer.id), &join)
        .success;

    if !snapshot.others.is_empty() {
        let joined = SinkFrame::metadata(MetadataEvent::MemberJoin {
            channel_id: snapshot.channel_id,
            member: member_info(&snapshot.peer, snapshot.auth),
        });
        let other_ids: Vec<String> = snapshot.others.iter().map(|p| p.id.clone()).collect();
        success &= state.coordinator.fan_out_to_peers(&other_ids, &joined).success;
    }

    if success { Ok(RouteOutcome::ok()) } else { Err(RouteError::Unknown) }
}

struct UnsubscribeSnapshot {
    channel_id: String,
    auth: ChannelAuthMode,
    peer: PeerRow,
    remaining: Vec<PeerRow>,
}

/// `channel.subscribers.remove`: delete the membership row, then notify —
/// `leave-channel` to the leaving peer, `member-leave` to the rest.
pub fn unsubscribe(
    state: &SharedState,
    app_id: &str,
    body: &SubscriberBody,
) -> Result<RouteOutcome, RouteError> {
    let snapshot = state.with_db(|db| {
        let Some(channel) = db.get_channel(app_id, &body.channel_id)? else {
            return Ok(Err(RouteError::ChannelNotFound));
        };
        let Some(peer) = db.resolve_peers(app_id, &body.subscriber_id)?.into_iter().next() else {
            return Ok(Err(RouteError::PeerNotFound));
        };
        if !db.delete_subscription(app_id, &peer.id, &channel.id)? {
            return Ok(Err(RouteError::NotSubscribed));
        }
        let remaining = db.channel_members(&channel.id, None)?;
        Ok(Ok(UnsubscribeSnapshot { channel_id: channel.id, auth: channel.auth, peer, remaining }))
    })??;

    let left = SinkFrame::metadata(MetadataEvent::LeaveChannel {
        channel_id: snapshot.channel_id.clone(),
    });
    let mut success = state
        .coordinator
        .fan_out_to_peers(std::slice::from_ref(&snapshot.peer.id), &left)
        .success;

    if !snapshot.remaining.is_empty() {
        let member_left = SinkFrame::metadata(MetadataEvent::MemberLeave {
            channel_id: snapshot.channel_id,
            member: member_info(&snapshot.peer, snapshot.auth),
        });
        let ids: Vec<String> = snapshot.remaining.iter().map(|p| p.id.clone()).collect();
        success &= state.coordinator.fan_out_to_peers(&ids, &member_left).success;
    }

    if success { Ok(RouteOutcome::ok()) } else { Err(RouteError::Unknown) }
}

/// `channel.messages.send`: persist if the channel stores, snapshot the
/// subscriber set once, and push to every subscriber. Late subscribers
/// do not retroactively receive it.
pub fn send_to_channel(
    state: &SharedState,
    app_id: &str,
    envelope_id: &str,
    body: &ChannelSendBody,
) -> Result<RouteOutcome, RouteError> {
    let subscribers = state.with_db(|db| {
        let Some(channel) = db.get_channel(app_id, &body.channel_id)? else {
            return Ok(Err(RouteError::ChannelNotFound));
        };
        if channel.store {
            let data = json!({"event": body.event, "message": body.message});
            db.insert_stored_message(envelope_id, app_id, &channel.id, chrono::Utc::now(), &data)?;
        }
        Ok(Ok(db.subscriber_ids(&channel.id)?))
    })??;

    let frame = SinkFrame::message(
        envelope_id.to_string(),
        MessageEvent {
            event: body.event.clone(),
            from: MessageOrigin::Channel { channel_id: body.channel_id.clone() },
            message: body.message.clone(),
        },
    );
    let report = state.coordinator.fan_out_to_peers(&subscribers, &frame);
    if report.success { Ok(RouteOutcome::ok()) } else { Err(RouteError::Unknown) }
}

/// `user.messages.send`: direct delivery. The recipient id matches a
/// peer id first, then any peer authenticated as that user; delivery to
/// one shard is enough for the aggregate to succeed.
pub fn send_to_user(
    state: &SharedState,
    app_id: &str,
    envelope_id: &str,
    body: &DirectSendBody,
) -> Result<RouteOutcome, RouteError> {
    let peers = state.with_db(|db| db.resolve_peers(app_id, &body.recipient_id))?;
    if peers.is_empty() {
        return Err(RouteError::RecipientNotFound);
    }

    let frame = SinkFrame::message(
        envelope_id.to_string(),
        MessageEvent {
            event: body.event.clone(),
            from: MessageOrigin::Direct,
            message: body.message.clone(),
        },
    );
    let ids: Vec<String> = peers.iter().map(|p| p.id.clone()).collect();
    let report = state.coordinator.fan_out_direct(&ids, &frame);
    if report.success { Ok(RouteOutcome::ok()) } else { Err(RouteError::RecipientNotFound) }
}

/// `global.messages.send`: deliver to every live peer of the app across
/// every shard.
pub fn broadcast(
    state: &SharedState,
    app_id: &str,
    envelope_id: &str,
    body: &BroadcastSendBody,
) -> Result<RouteOutcome, RouteError> {
    let frame = SinkFrame::message(
        envelope_id.to_string(),
        MessageEvent {
            event: body.event.clone(),
            from: MessageOrigin::Broadcast,
            message: body.message.clone(),
        },
    );
    let report = state.coordinator.fan_out_broadcast(app_id, &frame);
    if report.success { Ok(RouteOutcome::ok()) } else { Err(RouteError::Unknown) }
}

/// Stored payload as persisted: the event name plus the original tagged
/// message, replayed with a channel origin attached.
#[derive(Deserialize)]
struct StoredPayload {
    event: String,
    message: crate::protocol::MessagePayload,
}

/// A sink's `request-stored-messages`: honored only when the sink is
/// subscribed to the channel. Frames go straight to the requesting
/// peer's registry, in `createdAt` ascending order.
pub fn replay_stored(
    state: &SharedState,
    registry: &PeerRegistry,
    peer_id: &str,
    channel_id: &str,
    message_ids: &[String],
) {
    let rows = state.with_db(|db| {
        if !db.is_subscribed(peer_id, channel_id)? {
            return Ok(None);
        }
        Ok(Some(db.stored_messages_by_ids(channel_id, message_ids)?))
    });
    let rows = match rows {
        Ok(Some(rows)) => rows,
        Ok(None) => {
            tracing::debug!(peer = peer_id, channel = channel_id, "replay request from non-subscriber ignored");
            return;
        }
        Err(_) => return,
    };

    for row in rows {
        let payload: StoredPayload = match serde_json::from_value(row.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(message = %row.id, error = %e, "unreadable stored message skipped");
                continue;
            }
        };
        let frame = SinkFrame::message(
            row.id,
            MessageEvent {
                event: payload.event,
                from: MessageOrigin::Channel { channel_id: channel_id.to_string() },
                message: payload.message,
            },
        );
        registry.send_frame(peer_id, &frame);
    }
}

/// Disconnect reaping: snapshot the peer's channels and co-members,
/// delete the peer row (cascading its subscriptions), then emit exactly
/// one `member-leave` per co-subscriber per shared channel. Safe to call
/// more than once; the second call finds no peer row.
pub fn handle_disconnect(state: &SharedState, app_id: &str, peer_id: &str) {
    let snapshot = state.with_db(|db| {
        let Some(peer) = db.get_peer(app_id, peer_id)? else {
            return Ok(None);
        };
        let mut notifications = Vec::new();
        for channel_id in db.peer_channel_ids(peer_id)? {
            let Some(channel) = db.get_channel(app_id, &channel_id)? else {
                continue;
            };
            let others = db.channel_members(&channel_id, Some(peer_id))?;
            if !others.is_empty() {
                notifications.push((channel, others));
            }
        }
        db.delete_peer(peer_id)?;
        Ok(Some((peer, notifications)))
    });
    let Ok(Some((peer, notifications))) = snapshot else {
        return;
    };

    for (channel, others) in notifications {
        let frame = SinkFrame::metadata(MetadataEvent::MemberLeave {
            channel_id: channel.id,
            member: member_info(&peer, channel.auth),
        });
        let ids: Vec<String> = others.iter().map(|p| p.id.clone()).collect();
        state.coordinator.fan_out_to_peers(&ids, &frame);
    }
}
