//! IRC events.
//!
//! Channel traffic is taken from the bot's connection only, so each line is
//! bridged once no matter how many of our connections share the channel.
//! Private messages arrive on the connection they were sent to.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bridge::actions::to_remote;
use crate::bridge::requests::Disposition;
use crate::bridge::state::BridgeContext;
use crate::common::error::BridgeResult;
use crate::common::messages::{LocalAction, LocalEvent, LocalEventKind};
use crate::common::types::{is_channel_name, to_irc_lower, LocalRoom, RemoteRoom};
use crate::irc::server::{ServerPolicy, SyncKind};

pub async fn handle_local_event(ctx: &BridgeContext, event: &LocalEvent) -> BridgeResult<Disposition> {
    let server = ctx.server(&event.domain)?.clone();

    match &event.kind {
        LocalEventKind::Message {
            from,
            target,
            action,
        } => {
            if ctx.connections.owns_nick(&event.domain, from) {
                return Ok(Disposition::Ignored);
            }
            if is_channel_name(target) {
                if !event.receiver_is_bot {
                    return Ok(Disposition::Ignored);
                }
                on_channel_message(ctx, &server, from, target, action).await
            } else if to_irc_lower(target) == to_irc_lower(&event.receiver) {
                on_private_message(ctx, &server, &event.receiver, from, action).await
            } else {
                Ok(Disposition::Ignored)
            }
        }
        LocalEventKind::Join { nick, channel } => {
            if !event.receiver_is_bot || ctx.connections.owns_nick(&event.domain, nick) {
                return Ok(Disposition::Ignored);
            }
            on_membership(ctx, &server, nick, channel, true).await
        }
        LocalEventKind::Part { nick, channel, .. } => {
            if !event.receiver_is_bot || ctx.connections.owns_nick(&event.domain, nick) {
                return Ok(Disposition::Ignored);
            }
            on_membership(ctx, &server, nick, channel, false).await
        }
        LocalEventKind::Mode {
            channel,
            by,
            mode,
            arg,
        } => {
            if !event.receiver_is_bot {
                return Ok(Disposition::Ignored);
            }
            info!(
                "MODE {} {} {} by {} on {}",
                channel,
                mode,
                arg.as_deref().unwrap_or_default(),
                by,
                event.domain
            );
            Ok(Disposition::Done)
        }
    }
}

async fn on_channel_message(
    ctx: &BridgeContext,
    server: &Arc<ServerPolicy>,
    from: &str,
    channel: &str,
    action: &LocalAction,
) -> BridgeResult<Disposition> {
    let rooms = ctx
        .store
        .rooms
        .linked_remote_rooms(&LocalRoom::new(server.domain(), channel))
        .await?;
    if rooms.is_empty() {
        debug!("No rooms linked to {} on {}", channel, server.domain());
        return Ok(Disposition::Ignored);
    }

    let remote_action = to_remote(action)?;
    let user_id = ctx.ensure_virtual_user(server, from).await?;
    for room in rooms {
        ctx.remote
            .send_action(Some(&user_id), &room.room_id, &remote_action)
            .await?;
    }
    Ok(Disposition::Done)
}

async fn on_private_message(
    ctx: &BridgeContext,
    server: &Arc<ServerPolicy>,
    receiver: &str,
    from: &str,
    action: &LocalAction,
) -> BridgeResult<Disposition> {
    let Some(conn) = ctx.connections.by_nick(server.domain(), receiver) else {
        return Ok(Disposition::Ignored);
    };
    let Some(owner) = conn.owner().filter(|_| !conn.is_bot()) else {
        debug!("PM from {} to the bot, ignoring", from);
        return Ok(Disposition::Ignored);
    };
    if !server.allows_pms() {
        info!("{} does not allow PMs, dropping PM from {}", server.domain(), from);
        return Ok(Disposition::Ignored);
    }

    let remote_action = to_remote(action)?;
    let real_user_id = owner.user_id.clone();
    let virtual_user_id = ctx.ensure_virtual_user(server, from).await?;

    let room_id = match ctx.store.rooms.pm_room(&real_user_id, &virtual_user_id).await? {
        Some(room) => room.room_id,
        None => {
            let room_id = ctx
                .remote
                .create_room_with_user(&virtual_user_id, &real_user_id, from)
                .await?;
            ctx.store
                .rooms
                .set_pm_link(
                    &LocalRoom::new(server.domain(), from),
                    &RemoteRoom::new(room_id.clone()),
                    &real_user_id,
                    &virtual_user_id,
                )
                .await?;
            room_id
        }
    };

    ctx.remote
        .send_action(Some(&virtual_user_id), &room_id, &remote_action)
        .await?;
    Ok(Disposition::Done)
}

async fn on_membership(
    ctx: &BridgeContext,
    server: &Arc<ServerPolicy>,
    nick: &str,
    channel: &str,
    joined: bool,
) -> BridgeResult<Disposition> {
    if !server.should_sync_membership_to_remote(SyncKind::Incremental, Some(channel)) {
        return Ok(Disposition::Ignored);
    }
    let rooms = ctx
        .store
        .rooms
        .linked_remote_rooms(&LocalRoom::new(server.domain(), channel))
        .await?;
    if rooms.is_empty() {
        return Ok(Disposition::Ignored);
    }

    let user_id = ctx.ensure_virtual_user(server, nick).await?;
    for room in rooms {
        if joined {
            ctx.remote.join_room(Some(&user_id), &room.room_id).await?;
        } else {
            ctx.remote.leave_room(Some(&user_id), &room.room_id).await?;
        }
    }
    Ok(Disposition::Done)
}
