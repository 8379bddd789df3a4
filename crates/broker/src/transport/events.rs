// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `GET /events` — the long-lived SSE connection handler. Implements the
//! startup sequence, steady-state multiplexing loop, and teardown from
//! SPEC_FULL.md §4.1: one task per connection, owning the single writer on
//! its HTTP response body, fed by a command channel registered in
//! [`AppState::device_channels`].

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::device;
use crate::error::BrokerError;
use crate::model::{Command, Device, DeviceId, Frame, Instruction, Uid};
use crate::state::{AppState, WaitGroupGuard};
use crate::transport::auth::token_check;
use crate::user;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// `token`/`device`/`id` may arrive as query parameters or as
/// `X-SSE-Token`/`X-SSE-Device`/`X-SSE-ID` headers — `EventSource` cannot
/// set arbitrary request headers, so browsers use the query form while
/// server-to-server callers may prefer headers.
fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_owned())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|s| s.parse().ok())
}

fn client_address(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_owned()))
        .unwrap_or_else(|| "unknown".to_owned())
}

fn sys_event_bytes(name: &str, data: &str) -> Vec<u8> {
    format!("event: {name}\ndata: {data}\n\n").into_bytes()
}

pub async fn events(State(state): State<Arc<AppState>>, Query(query): Query<EventsQuery>, headers: HeaderMap) -> Response {
    let token = match query.token.clone().or_else(|| header_str(&headers, "x-sse-token")) {
        Some(t) => t,
        None => return BrokerError::Auth("missing token".into()).into_response(),
    };
    let device_name = match query.device.clone().or_else(|| header_str(&headers, "x-sse-device")) {
        Some(d) => d,
        None => return BrokerError::Request("missing device".into()).into_response(),
    };
    let last_event_id = query.id.or_else(|| header_u64(&headers, "x-sse-id")).unwrap_or(0);

    let claims = match token_check(&state.config.jwt_secret, &token, &device_name) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let uid = Uid::from(claims.uid);
    let client_address = client_address(&headers);

    // Startup sequence steps 1-3 (preempt, create record, announce online)
    // run here, before the response is returned, so any failure surfaces
    // as a plain 500 rather than a mid-stream teardown.
    let claimed = match device::claim(&state, &device_name, &uid, &client_address).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, device = %device_name, "device claim failed");
            return BrokerError::Internal(e.to_string()).into_response();
        }
    };
    if let Err(e) = user::announce_online(&state.store, &state.dispatcher, &uid).await {
        warn!(error = %e, uid = %uid, "announce_online failed");
        return BrokerError::Internal(e.to_string()).into_response();
    }

    let device_id = claimed.device.device_id.clone();
    let (tx_cmd, rx_cmd) = mpsc::channel::<Instruction>(1);
    state.device_channels.insert(device_id.clone(), tx_cmd.clone());
    let guard = state.connections.add();

    let (tx_body, rx_body) = mpsc::channel::<Result<Bytes, Infallible>>(16);

    let conn_state = state.clone();
    tokio::spawn(async move {
        run_connection(conn_state, claimed.device, uid, client_address, last_event_id, rx_cmd, tx_body, tx_cmd, guard)
            .await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx_body));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|e| BrokerError::Internal(e.to_string()).into_response())
}

/// Steps 4 onward: send `sys_connected`, replay cache, then multiplex the
/// command channel, the heartbeat ticker, and peer-close detection (a
/// failed body write) until one of them ends the connection.
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    state: Arc<AppState>,
    device: Device,
    uid: Uid,
    client_address: String,
    last_event_id: u64,
    mut rx_cmd: mpsc::Receiver<Instruction>,
    tx_body: mpsc::Sender<Result<Bytes, Infallible>>,
    own_channel: mpsc::Sender<Instruction>,
    _guard: WaitGroupGuard,
) {
    let device_id = device.device_id.clone();

    if tx_body.send(Ok(Bytes::from(sys_event_bytes("sys_connected", &client_address)))).await.is_err() {
        finalize(&state, &device_id, &uid, &own_channel, "device_disconnect").await;
        return;
    }

    if last_event_id > 0 {
        match state.store.replay_frames(&device_id, last_event_id).await {
            Ok(cached) => {
                for payload in cached {
                    let frame: Frame = match serde_json::from_slice(&payload) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "failed to decode a cached frame, skipping");
                            continue;
                        }
                    };
                    if tx_body.send(Ok(Bytes::from(frame.to_sse_bytes()))).await.is_err() {
                        finalize(&state, &device_id, &uid, &own_channel, "device_disconnect").await;
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, device_id = %device_id, "replay fetch failed"),
        }
    }

    let mut local_last_id = device.last_frame_id;
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.tick().await;

    let reason = loop {
        tokio::select! {
            received = rx_cmd.recv() => {
                let Some(instruction) = received else {
                    break "device_disconnect";
                };
                match instruction.command {
                    Command::SendFrame => {
                        let frame_id = match state.store.incr_last_frame_id(&device_id).await {
                            Ok(id) => id,
                            Err(e) => {
                                warn!(error = %e, device_id = %device_id, "frame id allocation degraded, using local fallback");
                                local_last_id += 1;
                                local_last_id
                            }
                        };
                        let frame = Frame {
                            id: frame_id,
                            event: instruction.event.unwrap_or_default(),
                            data: instruction.data.unwrap_or_default(),
                        };
                        match serde_json::to_vec(&frame) {
                            Ok(payload) => {
                                if let Err(e) = state
                                    .store
                                    .cache_frame(
                                        &device_id,
                                        frame.id,
                                        &payload,
                                        state.config.device_frame_cache_size,
                                        state.config.device_frame_cache_expire(),
                                    )
                                    .await
                                {
                                    warn!(error = %e, device_id = %device_id, "cache_frame failed, replay window degraded");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode frame for caching"),
                        }
                        if tx_body.send(Ok(Bytes::from(frame.to_sse_bytes()))).await.is_err() {
                            break "device_disconnect";
                        }
                    }
                    Command::ExtrudeOffline | Command::KickOffline | Command::InstanceClose => {
                        let name = instruction.command.sys_event_name().unwrap_or("sys_unknown");
                        let data = instruction.data.unwrap_or_default();
                        let _ = tx_body.send(Ok(Bytes::from(sys_event_bytes(name, &data)))).await;
                        break match instruction.command {
                            Command::ExtrudeOffline => "extrude_offline",
                            Command::KickOffline => "kick_offline",
                            Command::InstanceClose => "instance_close",
                            Command::SendFrame => unreachable!("matched above"),
                        };
                    }
                }
            }
            _ = heartbeat.tick() => {
                if tx_body.send(Ok(Bytes::from_static(b":heartbeat\n\n"))).await.is_err() {
                    break "heartbeat_fail";
                }
                if let Err(e) = device::touch(&state, &device_id, &uid).await {
                    warn!(error = %e, device_id = %device_id, "heartbeat touch failed, recovers next tick");
                }
            }
        }
    };

    finalize(&state, &device_id, &uid, &own_channel, reason).await;
}

/// Teardown steps (a)-(d); step (e) (wait-group decrement) happens when
/// `_guard` is dropped at the end of [`run_connection`].
///
/// Step (a) is identity-checked: on same-instance preemption,
/// `device::claim` hands the new handler's `Sender` a fresh registration
/// under the same `device_id` before the old handler's `finalize` runs, so
/// an unconditional `remove` here could delete the *new* handler's entry
/// out from under it. `remove_if` only removes the entry when it still
/// holds this handler's own sender (`Sender::same_channel`), so a
/// preempted handler's teardown never clobbers its successor's
/// registration.
async fn finalize(state: &Arc<AppState>, device_id: &DeviceId, uid: &Uid, own_channel: &mpsc::Sender<Instruction>, reason: &str) {
    state.device_channels.remove_if(device_id, |_, sender| sender.same_channel(own_channel));
    if let Err(e) = device::release(state, device_id, uid, reason).await {
        warn!(error = %e, device_id = %device_id, "device release failed during teardown");
    }
    if let Err(e) = user::announce_offline_if_last(&state.store, &state.dispatcher, uid).await {
        warn!(error = %e, uid = %uid, "announce_offline_if_last failed during teardown");
    }
    info!(device_id = %device_id, reason, "connection finalized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_event_bytes_have_no_id_line() {
        let bytes = sys_event_bytes("sys_connected", "1.2.3.4");
        let text = String::from_utf8(bytes).expect("utf8");
        assert_eq!(text, "event: sys_connected\ndata: 1.2.3.4\n\n");
    }

    #[test]
    fn client_address_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().expect("header value"));
        assert_eq!(client_address(&headers), "1.2.3.4");
    }

    #[test]
    fn client_address_falls_back_to_unknown() {
        assert_eq!(client_address(&HeaderMap::new()), "unknown");
    }
}
