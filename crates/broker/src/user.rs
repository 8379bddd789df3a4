// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-level online/offline bookkeeping, edge-triggered on the first
//! device to connect and the last device to disconnect.

use crate::dispatcher::Dispatcher;
use crate::model::{StateChange, Uid};
use crate::redis_store::RedisStore;

/// Announce a user online, but only the first time (edge-triggered): a
/// second device connecting for the same user must not re-announce.
pub async fn announce_online(store: &RedisStore, dispatcher: &Dispatcher, uid: &Uid) -> anyhow::Result<()> {
    if store.mark_user_online(uid).await? {
        dispatcher.dispatch_user_online(StateChange::user(uid.clone(), "user_online")).await;
    }
    Ok(())
}

/// Announce a user offline, but only once their last device has gone.
pub async fn announce_offline_if_last(
    store: &RedisStore,
    dispatcher: &Dispatcher,
    uid: &Uid,
) -> anyhow::Result<()> {
    if store.mark_user_offline_if_empty(uid).await? {
        dispatcher.dispatch_user_offline(StateChange::user(uid.clone(), "user_offline")).await;
    }
    Ok(())
}
