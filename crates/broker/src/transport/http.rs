// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/token`, `/send`, `/kick`, and `/info` — the non-streaming request
//! APIs, per SPEC_FULL.md §4.4-§4.7. Each has a `GET` and `POST` route
//! sharing one handler body, since the spec accepts the same parameters
//! either as a query string or a JSON body.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::mint_token;
use crate::error::{BrokerError, Envelope};
use crate::model::{device_id_for, Command, Device, DeviceId, Instance, InstanceAddress, Instruction, Uid};
use crate::state::AppState;

fn micros_since(start: Instant) -> i64 {
    start.elapsed().as_micros().min(i64::MAX as u128) as i64
}

// -- /token -----------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub uid: Option<String>,
    pub device_name: Option<String>,
    pub ttl: Option<i64>,
}

async fn do_token(state: &AppState, req: TokenRequest) -> Response {
    let start = Instant::now();
    let uid = match req.uid {
        Some(v) if !v.is_empty() => v,
        _ => return BrokerError::Request("missing uid".into()).into_response(),
    };
    let device_name = match req.device_name {
        Some(v) if !v.is_empty() => v,
        _ => return BrokerError::Request("missing device_name".into()).into_response(),
    };
    let ttl = req.ttl.unwrap_or(state.config.jwt_expire_secs);

    match mint_token(&state.config.jwt_secret, &Uid::from(uid), &device_name, ttl) {
        Ok(token) => Json(Envelope::ok(token, micros_since(start))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn token_get(State(state): State<Arc<AppState>>, Query(req): Query<TokenRequest>) -> Response {
    do_token(&state, req).await
}

pub async fn token_post(State(state): State<Arc<AppState>>, Json(req): Json<TokenRequest>) -> Response {
    do_token(&state, req).await
}

// -- Shared target resolution / fan-out --------------------------------------

/// Resolve the union of target device ids for `/send` and `/kick`: each
/// `device` name is hashed directly; each `uid`'s device set is read from
/// shared state; if neither selector is present, every device on every
/// known instance is resolved (broadcast), chunked and read concurrently.
async fn resolve_targets(state: &AppState, uid_csv: Option<&str>, device_csv: Option<&str>) -> IndexSet<DeviceId> {
    let mut targets = IndexSet::new();

    let devices: Vec<&str> = device_csv
        .map(|csv| csv.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let uids: Vec<&str> =
        uid_csv.map(|csv| csv.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()).unwrap_or_default();

    for name in &devices {
        targets.insert(device_id_for(name));
    }

    for uid in &uids {
        match state.store.devices_for_user(&Uid::from(*uid)).await {
            Ok(ids) => targets.extend(ids),
            Err(e) => warn!(error = %e, uid = %uid, "failed to read user device set"),
        }
    }

    if devices.is_empty() && uids.is_empty() {
        let instances = match state.store.known_instances().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "broadcast resolution: failed to read cluster instance set");
                return targets;
            }
        };
        for chunk in instances.chunks(state.config.resolve_batch_size) {
            let mut reads = FuturesUnordered::new();
            for address in chunk {
                reads.push(async move { (address, state.store.devices_on_instance(address).await) });
            }
            while let Some((address, result)) = reads.next().await {
                match result {
                    Ok(ids) => targets.extend(ids),
                    Err(e) => warn!(error = %e, address = %address, "broadcast resolution: per-instance read failed"),
                }
            }
        }
    }

    targets
}

/// Deliver `command` to every target: locally-registered devices get it
/// enqueued directly on their command channel; the rest are grouped by
/// owning instance (resolved concurrently, chunked) and published as one
/// batch per instance. Returns the count of devices actually enqueued or
/// published — not merely the number of candidate ids — per the
/// REDESIGN-flagged fix to the original's "count every candidate" bug.
async fn fan_out(
    state: &AppState,
    targets: &IndexSet<DeviceId>,
    command: Command,
    event: Option<String>,
    data: Option<String>,
) -> u64 {
    let mut delivered: u64 = 0;
    let mut remaining: Vec<DeviceId> = Vec::new();

    let build = |device_id: DeviceId| match &event {
        Some(ev) => Instruction::with_event(command, device_id, ev.clone(), data.clone()),
        None => Instruction::new(command, device_id, data.clone()),
    };

    for device_id in targets {
        let sender = state.device_channels.get(device_id).map(|r| r.value().clone());
        match sender {
            Some(sender) => {
                if sender.send(build(device_id.clone())).await.is_ok() {
                    delivered += 1;
                }
            }
            None => remaining.push(device_id.clone()),
        }
    }

    if remaining.is_empty() {
        return delivered;
    }

    let mut by_instance: HashMap<InstanceAddress, Vec<Instruction>> = HashMap::new();
    for chunk in remaining.chunks(state.config.resolve_batch_size) {
        let mut lookups = FuturesUnordered::new();
        for device_id in chunk {
            let device_id = device_id.clone();
            lookups.push(async move { (device_id.clone(), state.store.get_device_instance(&device_id).await) });
        }
        while let Some((device_id, result)) = lookups.next().await {
            match result {
                Ok(Some(address)) => by_instance.entry(address).or_default().push(build(device_id)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, device_id = %device_id, "instance lookup failed"),
            }
        }
    }

    for (address, instructions) in by_instance {
        delivered += instructions.len() as u64;
        state.dispatcher.dispatch_instructions(&address, instructions).await;
    }

    delivered
}

// -- /send --------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct SendRequest {
    pub uid: Option<String>,
    pub device: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
}

async fn do_send(state: &AppState, req: SendRequest) -> Response {
    let start = Instant::now();
    let data = match req.data {
        Some(v) => v,
        None => return BrokerError::Request("missing data".into()).into_response(),
    };

    let targets = resolve_targets(state, req.uid.as_deref(), req.device.as_deref()).await;
    let delivered = fan_out(state, &targets, Command::SendFrame, req.event, Some(data)).await;
    Json(Envelope::ok(delivered, micros_since(start))).into_response()
}

pub async fn send_get(State(state): State<Arc<AppState>>, Query(req): Query<SendRequest>) -> Response {
    do_send(&state, req).await
}

pub async fn send_post(State(state): State<Arc<AppState>>, Json(req): Json<SendRequest>) -> Response {
    do_send(&state, req).await
}

// -- /kick ----------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct KickRequest {
    pub uid: Option<String>,
    pub device: Option<String>,
    pub data: Option<String>,
}

async fn do_kick(state: &AppState, req: KickRequest) -> Response {
    let start = Instant::now();
    let has_uid = req.uid.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
    let has_device = req.device.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
    if !has_uid && !has_device {
        return BrokerError::Request("at least one of uid or device is required".into()).into_response();
    }

    let targets = resolve_targets(state, req.uid.as_deref(), req.device.as_deref()).await;
    let delivered = fan_out(state, &targets, Command::KickOffline, None, req.data).await;
    Json(Envelope::ok(delivered, micros_since(start))).into_response()
}

pub async fn kick_get(State(state): State<Arc<AppState>>, Query(req): Query<KickRequest>) -> Response {
    do_kick(&state, req).await
}

pub async fn kick_post(State(state): State<Arc<AppState>>, Json(req): Json<KickRequest>) -> Response {
    do_kick(&state, req).await
}

// -- /info ------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct InfoRequest {
    pub device: Option<String>,
    pub uid: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    #[serde(flatten)]
    pub device: Device,
    pub connected_locally: bool,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub uid: Uid,
    pub device_count: u64,
    pub earliest_login: Option<DateTime<Utc>>,
    pub latest_touch: Option<DateTime<Utc>>,
    pub devices: Vec<DeviceId>,
}

#[derive(Debug, Serialize)]
pub struct InstanceInfo {
    #[serde(flatten)]
    pub instance: Instance,
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct ClusterInfo {
    pub instances: Vec<InstanceAddress>,
    pub total_devices: u64,
    pub online_users: u64,
}

/// Parameter precedence per SPEC_FULL.md §4.6: `device` → `uid` →
/// `address` → cluster summary.
async fn do_info(state: &AppState, req: InfoRequest) -> Response {
    let start = Instant::now();

    if let Some(name) = req.device.filter(|v| !v.is_empty()) {
        let device_id = device_id_for(&name);
        return match state.store.get_device(&device_id).await {
            Ok(Some(device)) => {
                let connected_locally = state.device_channels.contains_key(&device_id);
                Json(Envelope::ok(DeviceInfo { device, connected_locally }, micros_since(start))).into_response()
            }
            Ok(None) => BrokerError::Request(format!("unknown device {name}")).into_response(),
            Err(e) => BrokerError::Bus(e.to_string()).into_response(),
        };
    }

    if let Some(uid_str) = req.uid.filter(|v| !v.is_empty()) {
        let uid = Uid::from(uid_str);
        let device_ids = match state.store.devices_for_user(&uid).await {
            Ok(v) => v,
            Err(e) => return BrokerError::Bus(e.to_string()).into_response(),
        };
        let mut earliest_login: Option<DateTime<Utc>> = None;
        let mut latest_touch: Option<DateTime<Utc>> = None;
        for device_id in &device_ids {
            if let Ok(Some(device)) = state.store.get_device(device_id).await {
                earliest_login = Some(earliest_login.map_or(device.login_time, |t| t.min(device.login_time)));
                latest_touch = Some(latest_touch.map_or(device.last_touch_time, |t| t.max(device.last_touch_time)));
            }
        }
        let info = UserInfo { device_count: device_ids.len() as u64, earliest_login, latest_touch, devices: device_ids, uid };
        return Json(Envelope::ok(info, micros_since(start))).into_response();
    }

    if let Some(address) = req.address.filter(|v| !v.is_empty()) {
        let address = InstanceAddress::from(address);
        return match state.store.instance_record(&address).await {
            Ok(Some(instance)) => {
                let online = state.store.known_instances().await.map(|known| known.contains(&address)).unwrap_or(false);
                Json(Envelope::ok(InstanceInfo { instance, online }, micros_since(start))).into_response()
            }
            Ok(None) => BrokerError::Request(format!("unknown instance {}", address.as_str())).into_response(),
            Err(e) => BrokerError::Bus(e.to_string()).into_response(),
        };
    }

    let instances = match state.store.known_instances().await {
        Ok(v) => v,
        Err(e) => return BrokerError::Bus(e.to_string()).into_response(),
    };
    let mut total_devices = 0u64;
    for address in &instances {
        total_devices += state.store.device_count_on_instance(address).await.unwrap_or(0);
    }
    let online_users = state.store.online_user_count().await.unwrap_or(0);
    Json(Envelope::ok(ClusterInfo { instances, total_devices, online_users }, micros_since(start))).into_response()
}

pub async fn info_get(State(state): State<Arc<AppState>>, Query(req): Query<InfoRequest>) -> Response {
    do_info(&state, req).await
}

pub async fn info_post(State(state): State<Arc<AppState>>, Json(req): Json<InfoRequest>) -> Response {
    do_info(&state, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_since_is_non_negative() {
        let start = Instant::now();
        assert!(micros_since(start) >= 0);
    }
}
