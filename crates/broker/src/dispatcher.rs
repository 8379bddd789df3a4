// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Publish-only fan-out onto the shared Redis bus. Never blocks a caller on
//! a bus error — failures are logged and swallowed, matching SPEC_FULL.md
//! §4.3's "dispatcher never blocks the caller on I/O errors".

use tracing::warn;

use crate::model::{InstanceAddress, Instruction, StateChange};
use crate::redis_store::{
    topic_instance, RedisStore, TOPIC_DEVICE_OFFLINE, TOPIC_DEVICE_ONLINE, TOPIC_USER_OFFLINE, TOPIC_USER_ONLINE,
};

/// Instructions are dispatched in chunks of this size to keep individual
/// `PUBLISH` payloads bounded.
const BATCH_SIZE: usize = 250;

#[derive(Clone)]
pub struct Dispatcher {
    store: RedisStore,
}

impl Dispatcher {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// Publish a single instruction to the instance that owns its device.
    pub async fn dispatch_instruction(&self, instance_address: &InstanceAddress, instruction: Instruction) {
        self.dispatch_instructions(instance_address, vec![instruction]).await;
    }

    /// Publish a batch of instructions bound for a single instance,
    /// chunked at `BATCH_SIZE`. Each chunk is built by appending to an
    /// initially-empty `Vec` — never pre-sized and indexed into, which is
    /// what produced leading empty instructions in the system this one
    /// replaces. A single-item batch is published as a bare `Instruction`
    /// object rather than a one-element array, matching the wire format in
    /// SPEC_FULL.md §6 (`{device_id, command, event, data}`) so an external
    /// publisher emitting that exact shape round-trips byte-for-byte; only
    /// a genuine multi-item batch is wrapped in a JSON array.
    pub async fn dispatch_instructions(&self, instance_address: &InstanceAddress, instructions: Vec<Instruction>) {
        if instructions.is_empty() {
            return;
        }
        let topic = topic_instance(instance_address);
        if instructions.len() == 1 {
            if let Some(instruction) = instructions.into_iter().next() {
                self.publish_one(&topic, &instruction).await;
            }
            return;
        }
        for chunk in instructions.chunks(BATCH_SIZE) {
            let mut batch = Vec::new();
            for instruction in chunk {
                batch.push(instruction.clone());
            }
            self.publish_batch(&topic, &batch).await;
        }
    }

    async fn publish_one(&self, topic: &str, instruction: &Instruction) {
        match serde_json::to_vec(instruction) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(topic, &payload).await {
                    warn!(topic = %topic, error = %e, "dispatch instruction failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode instruction"),
        }
    }

    async fn publish_batch(&self, topic: &str, batch: &[Instruction]) {
        match serde_json::to_vec(batch) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(topic, &payload).await {
                    warn!(topic = %topic, error = %e, "dispatch instructions failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode instruction batch"),
        }
    }

    /// Publish a state change to the cluster-wide topic matching its kind.
    pub async fn dispatch_state_change(&self, kind: StateChangeKind, change: StateChange) {
        let topic = match kind {
            StateChangeKind::DeviceOnline => TOPIC_DEVICE_ONLINE,
            StateChangeKind::DeviceOffline => TOPIC_DEVICE_OFFLINE,
            StateChangeKind::UserOnline => TOPIC_USER_ONLINE,
            StateChangeKind::UserOffline => TOPIC_USER_OFFLINE,
        };
        match serde_json::to_vec(&change) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(topic, &payload).await {
                    warn!(topic = %topic, error = %e, "dispatch state change failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode state change"),
        }
    }

    pub async fn dispatch_device_online(&self, change: StateChange) {
        self.dispatch_state_change(StateChangeKind::DeviceOnline, change).await;
    }

    pub async fn dispatch_device_offline(&self, change: StateChange) {
        self.dispatch_state_change(StateChangeKind::DeviceOffline, change).await;
    }

    pub async fn dispatch_user_online(&self, change: StateChange) {
        self.dispatch_state_change(StateChangeKind::UserOnline, change).await;
    }

    pub async fn dispatch_user_offline(&self, change: StateChange) {
        self.dispatch_state_change(StateChangeKind::UserOffline, change).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum StateChangeKind {
    DeviceOnline,
    DeviceOffline,
    UserOnline,
    UserOffline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, DeviceId};

    #[test]
    fn batches_never_exceed_batch_size() {
        let instructions: Vec<Instruction> = (0..620)
            .map(|i| Instruction::new(Command::SendFrame, DeviceId(format!("d{i}")), None))
            .collect();
        let chunks: Vec<_> = instructions.chunks(BATCH_SIZE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 250);
        assert_eq!(chunks[2].len(), 120);
    }

    #[test]
    fn chunk_building_never_leaves_leading_empties() {
        let instructions: Vec<Instruction> =
            (0..3).map(|i| Instruction::new(Command::SendFrame, DeviceId(format!("d{i}")), None)).collect();
        let mut batch = Vec::new();
        for instruction in &instructions {
            batch.push(instruction.clone());
        }
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].device_id, DeviceId("d0".into()));
    }
}
