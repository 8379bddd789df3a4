// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device record lifecycle: claiming a device on this instance (with
//! preemption of any prior owner), keeping its record alive, and tearing
//! it down. Mirrors SPEC_FULL.md §4.1's startup/teardown sequencing.

use chrono::Utc;
use tracing::info;

use crate::model::{device_id_for, Command, Device, DeviceId, Instruction, StateChange, Uid};
use crate::state::AppState;

/// Outcome of claiming a device: the fresh record, and whether a prior
/// session for the same `deviceId` was preempted (evicted) to make room.
pub struct Claimed {
    pub device: Device,
    pub preempted: bool,
}

/// Claim a device for this instance, preempting any instance that
/// currently owns it (SPEC_FULL.md §4.1 step 1-2). If the prior session
/// belonged to a different `uid`, its cached frames are dropped so the new
/// owner never replays another user's history.
pub async fn claim(state: &AppState, device_name: &str, uid: &Uid, client_address: &str) -> anyhow::Result<Claimed> {
    let device_id = device_id_for(device_name);

    let existing = state.store.get_device(&device_id).await?;
    let mut preempted = false;

    if let Some(ref prior) = existing {
        preempted = true;
        if prior.uid != *uid {
            state.store.drop_frame_cache(&device_id).await?;
        }

        let extrude = Instruction::new(Command::ExtrudeOffline, device_id.clone(), Some(client_address.to_owned()));
        if prior.instance_address == state.instance_address {
            if let Some(sender) = state.device_channels.get(&device_id) {
                // Best-effort: if the old handler's receiver already
                // dropped, there is nothing left to preempt.
                let _ = sender.send(extrude).await;
            }
        } else {
            state.dispatcher.dispatch_instruction(&prior.instance_address, extrude).await;
        }
        info!(device_id = %device_id, prior_instance = %prior.instance_address, "preempting prior device session");
    }

    // Seed last_frame_id from the cache's tail score so replay ids stay
    // monotonic even when the device migrates to a new owning instance.
    let seed_frame_id = state.store.tail_frame_id(&device_id).await.unwrap_or(0);

    let now = Utc::now();
    let device = Device {
        device_id: device_id.clone(),
        device_name: device_name.to_owned(),
        uid: uid.clone(),
        login_time: now,
        instance_address: state.instance_address.clone(),
        device_address: client_address.to_owned(),
        last_touch_time: now,
        last_frame_id: seed_frame_id,
    };

    state.store.put_device(&device, state.config.device_user_exist_duration()).await?;
    state.store.add_user_device(uid, &device_id).await?;
    state.local_devices.insert(device_id.clone(), device.clone());

    state
        .dispatcher
        .dispatch_device_online(StateChange::device(uid.clone(), device_id, "device_connect"))
        .await;

    Ok(Claimed { device, preempted })
}

/// Refresh a claimed device's TTL, and its user's device-set TTL, on every
/// heartbeat tick so a live connection's shared state never silently
/// expires mid-session.
pub async fn touch(state: &AppState, device_id: &DeviceId, uid: &Uid) -> anyhow::Result<()> {
    let ttl = state.config.device_user_exist_duration();
    state.store.touch_device(device_id, ttl).await?;
    state.store.touch_user_device_set(uid, ttl).await
}

/// Release a device's ownership record and announce it cluster-wide. The
/// record and frame cache are intentionally left to expire by TTL (not
/// deleted here) so a reconnect within the TTL window can continue the
/// frame id sequence and replay recent history; only the per-instance and
/// per-user *set membership* is removed immediately.
pub async fn release(state: &AppState, device_id: &DeviceId, uid: &Uid, reason: &str) -> anyhow::Result<()> {
    state.local_devices.remove(device_id);
    state.store.remove_device(device_id, &state.instance_address).await?;
    state.store.remove_user_device(uid, device_id).await?;
    state
        .dispatcher
        .dispatch_device_offline(StateChange::device(uid.clone(), device_id.clone(), reason))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_derivation_matches_model() {
        let name = "laptop-1";
        assert_eq!(device_id_for(name), device_id_for(name));
    }
}
