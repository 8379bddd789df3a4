// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared broker state, threaded through every handler as `Arc<AppState>`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::model::{Device, DeviceId, InstanceAddress, Instruction};
use crate::redis_store::RedisStore;

pub struct AppState {
    pub config: BrokerConfig,
    pub instance_address: InstanceAddress,
    pub store: RedisStore,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
    /// Per-device command channel, keyed by device id. A connection
    /// handler registers its receiving half here on startup and removes it
    /// on teardown; the instance subscriber loop and local `/send`/`/kick`
    /// handlers both look devices up here to deliver instructions.
    pub device_channels: Arc<DashMap<DeviceId, mpsc::Sender<Instruction>>>,
    /// Cache of devices currently connected to this instance, mirroring the
    /// shared record for the subset this instance owns. `/send`, `/kick`,
    /// and `/info` consult this before falling back to a bus round-trip.
    pub local_devices: Arc<DashMap<DeviceId, Device>>,
    /// Tracks live connection-handler tasks so `stop()` can wait for all of
    /// them to finish tearing down before the process exits.
    pub connections: WaitGroup,
}

impl AppState {
    pub fn new(
        config: BrokerConfig,
        instance_address: InstanceAddress,
        store: RedisStore,
        shutdown: CancellationToken,
    ) -> Self {
        let dispatcher = Dispatcher::new(store.clone());
        Self {
            config,
            instance_address,
            store,
            dispatcher,
            shutdown,
            device_channels: Arc::new(DashMap::new()),
            local_devices: Arc::new(DashMap::new()),
            connections: WaitGroup::new(),
        }
    }
}

/// A counting join primitive: `add()` on handler spawn, a `Drop` guard
/// calls `done()` exactly once even if the handler task panics, and
/// `wait()` resolves once the count returns to zero.
#[derive(Clone)]
pub struct WaitGroup {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self { count: Arc::new(AtomicUsize::new(0)), notify: Arc::new(Notify::new()) }
    }

    pub fn add(&self) -> WaitGroupGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        WaitGroupGuard { count: self.count.clone(), notify: self.notify.clone() }
    }

    pub async fn wait(&self) {
        loop {
            // Register interest before checking the count: `notify_waiters`
            // only wakes futures that already exist at the time it's
            // called, so creating this future after the check could miss a
            // notification from a guard that drops in between and hang
            // forever with a zero count.
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropped exactly once per connection handler, regardless of which exit
/// path (normal close, error, panic) the handler task takes.
pub struct WaitGroupGuard {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_group_resolves_after_guards_drop() {
        let wg = WaitGroup::new();
        let g1 = wg.add();
        let g2 = wg.add();
        drop(g1);
        drop(g2);
        wg.wait().await;
    }
}
