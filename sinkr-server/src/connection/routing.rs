//! Route dispatch.
//!
//! Both source transports — the long-lived WebSocket and the stateless
//! HTTP POST — funnel every envelope through [`execute`], so a request
//! has identical effects regardless of how it arrived.

use crate::db::AppRow;
use crate::protocol::{RouteOutcome, SourceEnvelope, SourceReply, SourceRequest};
use crate::server::SharedState;

use super::channel;

/// Execute one validated envelope for an authenticated source and build
/// the correlated reply. Validation failures and engine errors surface
/// as `{success: false, error}`; they never abort the connection.
pub fn execute(state: &SharedState, app: &AppRow, envelope: SourceEnvelope) -> SourceReply {
    let route = envelope.data.route();
    let outcome = match &envelope.data {
        SourceRequest::UserAuthenticate(body) => channel::authenticate_user(state, &app.id, body),
        SourceRequest::ChannelCreate(body) => channel::create_channel(state, &app.id, body),
        SourceRequest::ChannelDelete(body) => channel::delete_channel(state, &app.id, body),
        SourceRequest::ChannelMessagesDelete(body) => channel::delete_messages(state, &app.id, body),
        SourceRequest::ChannelSubscribersAdd(body) => channel::subscribe(state, &app.id, body),
        SourceRequest::ChannelSubscribersRemove(body) => channel::unsubscribe(state, &app.id, body),
        SourceRequest::ChannelMessagesSend(body) => {
            channel::send_to_channel(state, &app.id, &envelope.id, body)
        }
        SourceRequest::UserMessagesSend(body) => {
            channel::send_to_user(state, &app.id, &envelope.id, body)
        }
        SourceRequest::GlobalMessagesSend(body) => {
            channel::broadcast(state, &app.id, &envelope.id, body)
        }
    };
    SourceReply {
        id: envelope.id,
        route: route.to_string(),
        response: outcome.unwrap_or_else(RouteOutcome::err),
    }
}
