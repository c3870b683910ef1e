//! Homeserver events and queries.
//!
//! Messages and topics go out through the sender's own IRC connection.
//! Membership changes create PM and admin rooms and are mirrored as IRC
//! joins and parts where the network allows it.

use tracing::{debug, error, info, warn};

use crate::bridge::actions::{from_remote_event, to_local};
use crate::bridge::requests::Disposition;
use crate::bridge::state::BridgeContext;
use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::{ActionKind, RemoteAction, RemoteEvent};
use crate::common::types::{LinkData, LocalRoom, RemoteRoom};
use crate::irc::server::SyncKind;
use crate::matrix::client::AliasRoomOptions;

const ADMIN_HELP: &str = "Commands: !nick <server> <nick>";

pub async fn handle_remote_event(ctx: &BridgeContext, event: &RemoteEvent) -> BridgeResult<Disposition> {
    match event.event_type.as_str() {
        "m.room.message" | "m.room.topic" => on_message(ctx, event).await,
        "m.room.member" => on_member(ctx, event).await,
        other => {
            debug!("Ignoring event of type {}", other);
            Ok(Disposition::Ignored)
        }
    }
}

async fn on_message(ctx: &BridgeContext, event: &RemoteEvent) -> BridgeResult<Disposition> {
    if ctx.is_bridge_user(&event.sender) {
        return Ok(Disposition::Ignored);
    }

    if let Some((_, owner)) = ctx.store.rooms.admin_room_by_id(&event.room_id).await? {
        if owner != event.sender {
            debug!("{} is not the owner of admin room {}", event.sender, event.room_id);
            return Ok(Disposition::Ignored);
        }
        return on_admin_command(ctx, event).await;
    }

    let action = from_remote_event(event, ctx.remote.homeserver_url())?;
    let local_action = to_local(&action);

    let rooms = ctx.store.rooms.linked_local_rooms(&event.room_id).await?;
    if rooms.is_empty() {
        debug!("No IRC rooms linked to {}", event.room_id);
        return Ok(Disposition::Ignored);
    }

    let mut failure = None;
    for room in rooms {
        let sent = async {
            let server = ctx.server(&room.domain)?;
            let conn = ctx.client_for(server, &event.sender).await?;
            if room.is_channel() {
                ensure_bot_in(ctx, &room).await;
            }
            conn.send_action(&room, &local_action).await
        }
        .await;
        if let Err(e) = sent {
            error!(
                "Failed to send {} from {} to {} on {}: {}",
                local_action.kind, event.sender, room.channel, room.domain, e
            );
            failure = Some(e);
        }
    }
    failure.map_or(Ok(Disposition::Done), Err)
}

async fn on_member(ctx: &BridgeContext, event: &RemoteEvent) -> BridgeResult<Disposition> {
    let (Some(membership), Some(target)) = (event.membership(), event.state_key.as_deref()) else {
        return Ok(Disposition::Ignored);
    };
    match membership {
        "invite" => on_invite(ctx, event, target).await,
        "join" => on_join(ctx, &event.room_id, target).await,
        "leave" | "ban" => on_leave(ctx, &event.room_id, target).await,
        _ => Ok(Disposition::Ignored),
    }
}

async fn on_invite(ctx: &BridgeContext, event: &RemoteEvent, invitee: &str) -> BridgeResult<Disposition> {
    if ctx.is_bridge_user(&event.sender) {
        return Ok(Disposition::Ignored);
    }

    if invitee == ctx.bot_user_id() {
        info!("{} invited the bridge bot to {}", event.sender, event.room_id);
        ctx.remote.join_room(None, &event.room_id).await?;
        ctx.store
            .rooms
            .set_admin_room(&RemoteRoom::new(event.room_id.clone()), &event.sender)
            .await?;
        ctx.remote
            .send_action(
                None,
                &event.room_id,
                &RemoteAction::new(ActionKind::Notice, ADMIN_HELP),
            )
            .await?;
        return Ok(Disposition::Done);
    }

    let Some(server) = ctx.server_claiming_user(invitee) else {
        return Ok(Disposition::Ignored);
    };
    if !server.allows_pms() {
        info!("{} does not allow PMs, ignoring invite of {}", server.domain(), invitee);
        return Ok(Disposition::Ignored);
    }
    let Some(nick) = server.nick_from_user_id(invitee) else {
        return Ok(Disposition::Ignored);
    };

    ctx.remote.join_room(Some(invitee), &event.room_id).await?;
    ctx.store
        .rooms
        .set_pm_link(
            &LocalRoom::new(server.domain(), nick),
            &RemoteRoom::new(event.room_id.clone()),
            &event.sender,
            invitee,
        )
        .await?;
    Ok(Disposition::Done)
}

async fn on_join(ctx: &BridgeContext, room_id: &str, user_id: &str) -> BridgeResult<Disposition> {
    if ctx.is_bridge_user(user_id) {
        return Ok(Disposition::Ignored);
    }

    let mut joined = false;
    for room in ctx.store.rooms.linked_local_rooms(room_id).await? {
        if !room.is_channel() {
            continue;
        }
        let server = ctx.server(&room.domain)?;
        if !server.should_sync_membership_to_irc(SyncKind::Incremental, Some(room_id)) {
            continue;
        }
        let conn = ctx.client_for(server, user_id).await?;
        conn.join_channel(&room.channel).await?;
        ensure_bot_in(ctx, &room).await;
        joined = true;
    }
    Ok(if joined { Disposition::Done } else { Disposition::Ignored })
}

async fn on_leave(ctx: &BridgeContext, room_id: &str, user_id: &str) -> BridgeResult<Disposition> {
    if ctx.is_bridge_user(user_id) {
        return Ok(Disposition::Ignored);
    }

    let mut parted = false;
    for room in ctx.store.rooms.linked_local_rooms(room_id).await? {
        if !room.is_channel() {
            continue;
        }
        let server = ctx.server(&room.domain)?;
        if !server.should_sync_membership_to_irc(SyncKind::Incremental, Some(room_id)) {
            continue;
        }
        if let Some(conn) = ctx.connections.client(&room.domain, user_id) {
            conn.leave_channel(&room.channel).await?;
            parted = true;
        }
    }
    Ok(if parted { Disposition::Done } else { Disposition::Ignored })
}

/// The bot is the one receiving channel traffic, so it must sit in every
/// channel someone talks in.
pub async fn ensure_bot_in(ctx: &BridgeContext, room: &LocalRoom) {
    if let Some(bot) = ctx.connections.bot(&room.domain) {
        if let Err(e) = bot.join_channel(&room.channel).await {
            warn!("Bot failed to join {} on {}: {}", room.channel, room.domain, e);
        }
    }
}

// ============================================================================
// Admin rooms
// ============================================================================

async fn on_admin_command(ctx: &BridgeContext, event: &RemoteEvent) -> BridgeResult<Disposition> {
    let body = event
        .content
        .get("body")
        .and_then(|b| b.as_str())
        .unwrap_or_default();
    let mut args = body.split_whitespace();

    let reply = match (args.next(), args.next(), args.next()) {
        (Some("!nick"), Some(domain), Some(nick)) => change_nick(ctx, &event.sender, domain, nick).await,
        _ => ADMIN_HELP.to_string(),
    };
    ctx.remote
        .send_action(None, &event.room_id, &RemoteAction::new(ActionKind::Notice, reply))
        .await?;
    Ok(Disposition::Done)
}

/// Change a user's nick on one network, returning the reply for the user.
async fn change_nick(ctx: &BridgeContext, user_id: &str, domain: &str, nick: &str) -> String {
    let server = match ctx.server(domain) {
        Ok(server) => server,
        Err(e) => return e.to_string(),
    };
    if !server.allows_nick_changes() {
        return format!("Nick changes are not allowed on {}", domain);
    }

    let changed = async {
        let conn = ctx.client_for(server, user_id).await?;
        let message = conn.change_nick(nick).await?;
        let mut identity = conn.identity().clone();
        identity.nick = conn.nick();
        ctx.store.users.set_local_identity(user_id, &identity).await?;
        Ok::<_, BridgeError>(message)
    }
    .await;

    changed.unwrap_or_else(|e| {
        warn!("Nick change for {} to {} failed: {}", user_id, nick, e);
        e.to_string()
    })
}

// ============================================================================
// Queries
// ============================================================================

/// Create the room behind a dynamic channel alias.
pub async fn on_alias_query(ctx: &BridgeContext, alias: &str) -> BridgeResult<bool> {
    let Some(server) = ctx
        .servers
        .values()
        .find(|s| s.creates_dynamic_aliases() && s.claims_alias(alias))
    else {
        return Ok(false);
    };
    let Some(channel) = server.channel_from_alias(alias) else {
        return Ok(false);
    };
    if server.is_excluded_channel(&channel) {
        info!("Alias {} is for excluded channel {}", alias, channel);
        return Ok(false);
    }

    let options = AliasRoomOptions {
        alias: alias.to_string(),
        name: channel.clone(),
        topic: None,
        join_rule: server.join_rule(),
        publish: server.should_publish_rooms(),
    };
    let room_id = ctx.remote.create_room_with_alias(&options).await?;
    let room = LocalRoom::new(server.domain(), channel);
    ctx.store
        .rooms
        .link_rooms(
            &RemoteRoom::new(room_id.clone()),
            &room,
            LinkData::Channel { from_config: false },
        )
        .await?;

    if server.has_invite_rooms() {
        for user_id in &server.config().dynamic_channels.whitelist {
            ctx.remote.invite(None, &room_id, user_id).await?;
        }
    }
    ensure_bot_in(ctx, &room).await;
    info!("Created {} for {} on {}", room_id, room.channel, room.domain);
    Ok(true)
}

/// Provision the virtual user behind a claimed user ID.
pub async fn on_user_query(ctx: &BridgeContext, user_id: &str) -> BridgeResult<bool> {
    let Some(server) = ctx.server_claiming_user(user_id) else {
        return Ok(false);
    };
    let Some(nick) = server.nick_from_user_id(user_id) else {
        return Ok(false);
    };
    ctx.ensure_virtual_user(server, &nick).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::bridge::testing::{harness, settle, ALICE, DOMAIN, MAPPED_ROOM};
    use crate::matrix::testing::RemoteCall;

    fn event(value: serde_json::Value) -> RemoteEvent {
        serde_json::from_value(value).unwrap()
    }

    fn message(room_id: &str, sender: &str, body: &str) -> RemoteEvent {
        event(json!({
            "type": "m.room.message",
            "room_id": room_id,
            "sender": sender,
            "content": { "msgtype": "m.text", "body": body }
        }))
    }

    fn member(room_id: &str, sender: &str, target: &str, membership: &str) -> RemoteEvent {
        event(json!({
            "type": "m.room.member",
            "room_id": room_id,
            "sender": sender,
            "state_key": target,
            "content": { "membership": membership }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_goes_out_as_sender() {
        let h = harness("").await;
        let result = handle_remote_event(&h.ctx, &message(MAPPED_ROOM, ALICE, "hello")).await;
        assert_eq!(result.unwrap(), Disposition::Done);

        let wire = h.connector.wire_for("M-alice").unwrap();
        let sent = wire.sent();
        assert!(sent.contains(&"JOIN #rust".to_string()));
        assert!(sent.contains(&"PRIVMSG #rust :hello".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_message_reuses_connection() {
        let h = harness("").await;
        handle_remote_event(&h.ctx, &message(MAPPED_ROOM, ALICE, "one")).await.unwrap();
        handle_remote_event(&h.ctx, &message(MAPPED_ROOM, ALICE, "two")).await.unwrap();
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_user_echo_is_ignored() {
        let h = harness("").await;
        let echo = message(MAPPED_ROOM, "@irc.example.org_bob:hs.example.org", "hi");
        let result = handle_remote_event(&h.ctx, &echo).await;
        assert_eq!(result.unwrap(), Disposition::Ignored);
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlinked_room_is_ignored() {
        let h = harness("").await;
        let result = handle_remote_event(&h.ctx, &message("!other:hs", ALICE, "hi")).await;
        assert_eq!(result.unwrap(), Disposition::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_msgtype_is_rejected() {
        let h = harness("").await;
        let located = event(json!({
            "type": "m.room.message",
            "room_id": MAPPED_ROOM,
            "sender": ALICE,
            "content": { "msgtype": "m.location", "body": "here" }
        }));
        assert!(matches!(
            handle_remote_event(&h.ctx, &located).await,
            Err(BridgeError::UnknownActionKind { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_of_virtual_user_creates_pm_link() {
        let h = harness("").await;
        let bob = "@irc.example.org_bob:hs.example.org";
        let result = handle_remote_event(&h.ctx, &member("!pm:hs", ALICE, bob, "invite")).await;
        assert_eq!(result.unwrap(), Disposition::Done);

        let room = h.ctx.store.rooms.pm_room(ALICE, bob).await.unwrap().unwrap();
        assert_eq!(room.room_id, "!pm:hs");
        assert!(h.remote.calls().contains(&RemoteCall::Join {
            as_user: Some(bob.to_string()),
            room: "!pm:hs".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_refused_without_pms() {
        let h = harness("private_messages { enabled = false }").await;
        let bob = "@irc.example.org_bob:hs.example.org";
        let result = handle_remote_event(&h.ctx, &member("!pm:hs", ALICE, bob, "invite")).await;
        assert_eq!(result.unwrap(), Disposition::Ignored);
        assert!(h.ctx.store.rooms.pm_room(ALICE, bob).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_of_bot_creates_admin_room() {
        let h = harness("").await;
        let bot = h.ctx.bot_user_id();
        handle_remote_event(&h.ctx, &member("!admin:hs", ALICE, &bot, "invite"))
            .await
            .unwrap();

        let (room, owner) = h.ctx.store.rooms.admin_room_by_id("!admin:hs").await.unwrap().unwrap();
        assert_eq!(room.room_id, "!admin:hs");
        assert_eq!(owner, ALICE);
        assert_eq!(h.remote.sends().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_nick_command() {
        let h = harness("irc_clients { allow_nick_changes = true }").await;
        h.ctx
            .store
            .rooms
            .set_admin_room(&RemoteRoom::new("!admin:hs"), ALICE)
            .await
            .unwrap();

        let command = message("!admin:hs", ALICE, &format!("!nick {} alicia", DOMAIN));
        handle_remote_event(&h.ctx, &command).await.unwrap();
        settle().await;

        let stored = h.ctx.store.users.local_identity(ALICE, DOMAIN).await.unwrap().unwrap();
        assert_eq!(stored.nick, "alicia");
        let (_, room_id, reply) = h.remote.sends().pop().unwrap();
        assert_eq!(room_id, "!admin:hs");
        assert_eq!(reply.kind, ActionKind::Notice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_nick_command_refused_when_disallowed() {
        let h = harness("").await;
        h.ctx
            .store
            .rooms
            .set_admin_room(&RemoteRoom::new("!admin:hs"), ALICE)
            .await
            .unwrap();

        let command = message("!admin:hs", ALICE, &format!("!nick {} alicia", DOMAIN));
        handle_remote_event(&h.ctx, &command).await.unwrap();

        let (_, _, reply) = h.remote.sends().pop().unwrap();
        assert!(reply.body.contains("not allowed"));
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_is_mirrored_when_enabled() {
        let h = harness(
            "membership_lists { enabled = true, global { matrix_to_irc { incremental = true } } }",
        )
        .await;
        let result = handle_remote_event(&h.ctx, &member(MAPPED_ROOM, ALICE, ALICE, "join")).await;
        assert_eq!(result.unwrap(), Disposition::Done);
        assert!(h
            .connector
            .wire_for("M-alice")
            .unwrap()
            .sent()
            .contains(&"JOIN #rust".to_string()));

        let result = handle_remote_event(&h.ctx, &member(MAPPED_ROOM, ALICE, ALICE, "leave")).await;
        assert_eq!(result.unwrap(), Disposition::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_is_not_mirrored_by_default() {
        let h = harness("").await;
        let result = handle_remote_event(&h.ctx, &member(MAPPED_ROOM, ALICE, ALICE, "join")).await;
        assert_eq!(result.unwrap(), Disposition::Ignored);
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_query_creates_room() {
        let h = harness("dynamic_channels { enabled = true }").await;
        let alias = format!("#irc_{}_#go:hs.example.org", DOMAIN);
        assert!(on_alias_query(&h.ctx, &alias).await.unwrap());

        let rooms = h
            .ctx
            .store
            .rooms
            .linked_remote_rooms(&LocalRoom::new(DOMAIN, "#go"))
            .await
            .unwrap();
        assert_eq!(rooms.len(), 1);
        assert!(h.remote.calls().contains(&RemoteCall::CreateWithAlias { alias }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_query_for_excluded_channel() {
        let h = harness(r##"dynamic_channels { enabled = true, exclude = ["#secret"] }"##).await;
        let alias = format!("#irc_{}_#secret:hs.example.org", DOMAIN);
        assert!(!on_alias_query(&h.ctx, &alias).await.unwrap());
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_query_without_dynamic_channels() {
        let h = harness("").await;
        let alias = format!("#irc_{}_#go:hs.example.org", DOMAIN);
        assert!(!on_alias_query(&h.ctx, &alias).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_query_registers_once() {
        let h = harness("").await;
        let bob = "@irc.example.org_bob:hs.example.org";
        assert!(on_user_query(&h.ctx, bob).await.unwrap());
        assert!(on_user_query(&h.ctx, bob).await.unwrap());
        assert!(!on_user_query(&h.ctx, "@someone:hs.example.org").await.unwrap());

        let registers = h
            .remote
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RemoteCall::Register { .. }))
            .count();
        assert_eq!(registers, 1);
        assert!(h.remote.calls().contains(&RemoteCall::DisplayName {
            user_id: bob.to_string(),
            display_name: "bob (IRC)".to_string(),
        }));
    }
}
