//! Core data model: devices, users, instances, frames, instructions.
//!
//! Field shapes mirror the wire format in SPEC_FULL.md §6 exactly; newtypes
//! exist only to keep device/user/instance identifiers from being swapped
//! at call sites, not to change serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(DeviceId);
string_id!(Uid);
string_id!(InstanceAddress);

/// Computes a device's identity from its human-assigned name: `MD5(deviceName)`.
pub fn device_id_for(device_name: &str) -> DeviceId {
    use md5::{Digest, Md5};
    let digest = Md5::digest(device_name.as_bytes());
    DeviceId(format!("{digest:x}"))
}

/// A single live (or recently-live) device connection record. Mutated only
/// by the instance named in `instance_address` (SPEC_FULL.md §3 ownership).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub device_name: String,
    pub uid: Uid,
    pub login_time: DateTime<Utc>,
    pub instance_address: InstanceAddress,
    /// The client-visible IP of the `/events` connection, as seen by this
    /// instance (not necessarily reachable from other instances).
    pub device_address: String,
    pub last_touch_time: DateTime<Utc>,
    pub last_frame_id: u64,
}

/// Aggregate per-user bookkeeping: which devices are currently attributed
/// to this user, used to drive online/offline edge-triggered events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: Uid,
    pub device_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// A broker process's own cluster-visible identity and liveness record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub address: InstanceAddress,
    pub version: String,
    pub start_time: DateTime<Utc>,
    pub device_count: u64,
}

/// A single cached SSE frame, addressable by monotonic per-device id.
/// `data` is opaque text — the broker never inspects or reinterprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    pub data: String,
}

impl Frame {
    /// Render as wire-format SSE bytes per SPEC_FULL.md §4.1: `id:` and
    /// `data:` lines always; an `event:` line only when `event` is
    /// non-empty (the empty form is the bare `id`/`data` pair).
    pub fn to_sse_bytes(&self) -> Vec<u8> {
        let mut out = format!("id: {}\n", self.id);
        if !self.event.is_empty() {
            out.push_str("event: ");
            out.push_str(&self.event);
            out.push('\n');
        }
        out.push_str("data: ");
        out.push_str(&self.data);
        out.push_str("\n\n");
        out.into_bytes()
    }
}

/// Commands carried on a per-instance topic or a local device channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    SendFrame,
    ExtrudeOffline,
    KickOffline,
    InstanceClose,
}

impl Command {
    /// The `sys_*` event name emitted for a command other than `SendFrame`.
    pub fn sys_event_name(self) -> Option<&'static str> {
        match self {
            Command::SendFrame => None,
            Command::ExtrudeOffline => Some("sys_extrude_offline"),
            Command::KickOffline => Some("sys_kick_offline"),
            Command::InstanceClose => Some("sys_instance_close"),
        }
    }
}

/// A command sent to a specific device's connection handler, either from a
/// local `/send`/`/kick` call or forwarded across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub device_id: DeviceId,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Instruction {
    pub fn new(command: Command, device_id: DeviceId, data: Option<String>) -> Self {
        Self { device_id, command, event: None, data }
    }

    pub fn with_event(command: Command, device_id: DeviceId, event: impl Into<String>, data: Option<String>) -> Self {
        Self { device_id, command, event: Some(event.into()), data }
    }
}

/// Payload accepted on an instance topic: [`Dispatcher`](crate::dispatcher::Dispatcher)
/// publishes a lone instruction as a bare JSON object (matching the
/// SPEC_FULL.md §6 wire format exactly, so a single instruction round-trips
/// byte-for-byte) and only wraps a genuine multi-item batch in an array.
/// The topic consumer must therefore accept either shape.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InstructionBatch {
    One(Instruction),
    Many(Vec<Instruction>),
}

impl InstructionBatch {
    pub fn into_vec(self) -> Vec<Instruction> {
        match self {
            InstructionBatch::One(instruction) => vec![instruction],
            InstructionBatch::Many(instructions) => instructions,
        }
    }
}

/// A cluster-wide notification of a device or user connecting/disconnecting,
/// published on the shared state-change topic so external observers (and
/// other instances' own bookkeeping) can react.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub uid: Uid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub trigger_time: DateTime<Utc>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl StateChange {
    pub fn device(uid: Uid, device_id: DeviceId, reason: impl Into<String>) -> Self {
        Self { uid, device_id: Some(device_id), trigger_time: Utc::now(), reason: reason.into(), payload: None }
    }

    pub fn user(uid: Uid, reason: impl Into<String>) -> Self {
        Self { uid, device_id: None, trigger_time: Utc::now(), reason: reason.into(), payload: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_stable_md5() {
        let a = device_id_for("laptop-1");
        let b = device_id_for("laptop-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn different_names_hash_differently() {
        assert_ne!(device_id_for("laptop-1"), device_id_for("laptop-2"));
    }

    #[test]
    fn frame_sse_bytes_have_trailing_blank_line() {
        let frame = Frame { id: 7, event: "message".into(), data: "hello".into() };
        let text = String::from_utf8(frame.to_sse_bytes()).expect("utf8");
        assert_eq!(text, "id: 7\nevent: message\ndata: hello\n\n");
    }

    #[test]
    fn frame_sse_bytes_omit_event_line_when_empty() {
        let frame = Frame { id: 1, event: String::new(), data: "hello".into() };
        let text = String::from_utf8(frame.to_sse_bytes()).expect("utf8");
        assert_eq!(text, "id: 1\ndata: hello\n\n");
    }

    #[test]
    fn instruction_round_trips_through_json() {
        let instr =
            Instruction::new(Command::SendFrame, DeviceId::from("d1"), Some("payload".to_owned()));
        let encoded = serde_json::to_vec(&instr).expect("encode");
        let decoded: Instruction = serde_json::from_slice(&encoded).expect("decode");
        assert_eq!(decoded.device_id, instr.device_id);
        assert_eq!(decoded.command, instr.command);
        assert_eq!(decoded.data, instr.data);
    }

    #[test]
    fn instruction_batch_decodes_a_bare_object_as_one() {
        let instr = Instruction::new(Command::SendFrame, DeviceId::from("d1"), Some("hi".to_owned()));
        let payload = serde_json::to_vec(&instr).expect("encode");
        let batch: InstructionBatch = serde_json::from_slice(&payload).expect("decode");
        let decoded = batch.into_vec();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].device_id, instr.device_id);
        assert_eq!(decoded[0].data, instr.data);
    }

    #[test]
    fn instruction_batch_decodes_an_array_as_many() {
        let instrs = vec![
            Instruction::new(Command::SendFrame, DeviceId::from("d1"), None),
            Instruction::new(Command::SendFrame, DeviceId::from("d2"), None),
        ];
        let payload = serde_json::to_vec(&instrs).expect("encode");
        let batch: InstructionBatch = serde_json::from_slice(&payload).expect("decode");
        let decoded = batch.into_vec();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].device_id, DeviceId::from("d1"));
        assert_eq!(decoded[1].device_id, DeviceId::from("d2"));
    }

    #[test]
    fn command_sys_event_names_match_spec() {
        assert_eq!(Command::ExtrudeOffline.sys_event_name(), Some("sys_extrude_offline"));
        assert_eq!(Command::KickOffline.sys_event_name(), Some("sys_kick_offline"));
        assert_eq!(Command::InstanceClose.sys_event_name(), Some("sys_instance_close"));
        assert_eq!(Command::SendFrame.sys_event_name(), None);
    }
}
