// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Redis-backed shared state: the key table from SPEC_FULL.md §6, plus the
//! pub/sub plumbing the dispatcher publishes onto and the connection
//! handler's background subscriber reads from.

use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::config::BrokerConfig;
use crate::model::{Device, DeviceId, InstanceAddress, Uid};

pub const KEY_CLUSTER_INSTANCE_SET: &str = "sse_cluster_instance_set";
pub const KEY_ONLINE_USER_SET: &str = "sse_online_user_set";

pub fn key_instance(address: &InstanceAddress) -> String {
    format!("sse_instance_{}", address.as_str())
}

pub fn key_instance_device_set(address: &InstanceAddress) -> String {
    format!("sse_instance_device_set_{}", address.as_str())
}

pub fn key_device(device_id: &DeviceId) -> String {
    format!("sse_device_{}", device_id.as_str())
}

pub fn key_user_device_set(uid: &Uid) -> String {
    format!("sse_user_device_set_{}", uid.as_str())
}

pub fn key_frame_cache(device_id: &DeviceId) -> String {
    format!("sse_frame_cache_{}", device_id.as_str())
}

pub fn topic_instance(address: &InstanceAddress) -> String {
    format!("sse_topic_instance_{}", address.as_str())
}

pub const TOPIC_DEVICE_ONLINE: &str = "sse_topic_device_online";
pub const TOPIC_DEVICE_OFFLINE: &str = "sse_topic_device_offline";
pub const TOPIC_USER_ONLINE: &str = "sse_topic_user_online";
pub const TOPIC_USER_OFFLINE: &str = "sse_topic_user_offline";

/// Thin async wrapper over a Redis connection manager, exposing the
/// operations the rest of the broker needs by name rather than raw
/// commands, matching the data model's key layout 1:1.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &BrokerConfig) -> anyhow::Result<Self> {
        let addr = config.redis_addrs.first().cloned().unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned());
        info!(addr = %addr, db = config.redis_db, "connecting to redis");
        let client = redis::Client::open(build_url(&addr, config))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // -- Device record --------------------------------------------------

    /// Create (or overwrite) a device record and add it to the owning
    /// instance's device set, all in one pipeline.
    pub async fn put_device(&self, device: &Device, ttl: std::time::Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = key_device(&device.device_id);
        redis::pipe()
            .atomic()
            .hset(&key, "uid", device.uid.as_str())
            .hset(&key, "device", device.device_name.as_str())
            .hset(&key, "login_time", device.login_time.to_rfc3339())
            .hset(&key, "instance_address", device.instance_address.as_str())
            .hset(&key, "device_address", device.device_address.as_str())
            .hset(&key, "last_touch_time", device.last_touch_time.to_rfc3339())
            .hset(&key, "last_frame_id", device.last_frame_id)
            .expire(&key, ttl.as_secs() as i64)
            .sadd(key_instance_device_set(&device.instance_address), device.device_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &DeviceId) -> anyhow::Result<Option<Device>> {
        let mut conn = self.conn.clone();
        let fields: Vec<(String, String)> = conn.hgetall(key_device(device_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
        let parse_time = |s: Option<String>| -> DateTime<Utc> {
            s.as_deref().and_then(|v| DateTime::parse_from_rfc3339(v).ok()).map(|v| v.with_timezone(&Utc)).unwrap_or_else(Utc::now)
        };
        Ok(Some(Device {
            device_id: device_id.clone(),
            device_name: get("device").unwrap_or_default(),
            uid: Uid(get("uid").unwrap_or_default()),
            login_time: parse_time(get("login_time")),
            instance_address: InstanceAddress(get("instance_address").unwrap_or_default()),
            device_address: get("device_address").unwrap_or_default(),
            last_touch_time: parse_time(get("last_touch_time")),
            last_frame_id: get("last_frame_id").and_then(|v| v.parse().ok()).unwrap_or(0),
        }))
    }

    pub async fn get_device_instance(&self, device_id: &DeviceId) -> anyhow::Result<Option<InstanceAddress>> {
        let mut conn = self.conn.clone();
        let addr: Option<String> = conn.hget(key_device(device_id), "instance_address").await?;
        Ok(addr.filter(|s| !s.is_empty()).map(InstanceAddress))
    }

    /// Refresh a device record's TTL; called on every heartbeat and every
    /// frame send so a live connection's record never silently expires.
    pub async fn touch_device(
        &self,
        device_id: &DeviceId,
        ttl: std::time::Duration,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(key_device(device_id), "last_touch_time", Utc::now().to_rfc3339())
            .expire(key_device(device_id), ttl.as_secs() as i64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove a device from its owning instance's device set. Deliberately
    /// does NOT delete the device hash itself — per SPEC_FULL.md §4.1 the
    /// record and its frame cache are left to expire by TTL so a reconnect
    /// within the window can continue the frame id sequence and replay.
    pub async fn remove_device(&self, device_id: &DeviceId, instance_address: &InstanceAddress) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key_instance_device_set(instance_address), device_id.as_str()).await?;
        Ok(())
    }

    pub async fn devices_on_instance(&self, instance_address: &InstanceAddress) -> anyhow::Result<Vec<DeviceId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(key_instance_device_set(instance_address)).await?;
        Ok(ids.into_iter().map(DeviceId).collect())
    }

    pub async fn device_count_on_instance(&self, instance_address: &InstanceAddress) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.scard(key_instance_device_set(instance_address)).await?;
        Ok(n)
    }

    // -- Frame cache / monotonic frame id --------------------------------

    /// Atomically allocate the next monotonic frame id for a device: a
    /// `HINCRBY` on the device hash's `last_frame_id` field, so the
    /// counter lives in shared state (survives a preemption migrating the
    /// device between instances) rather than in instance-local memory.
    pub async fn incr_last_frame_id(&self, device_id: &DeviceId) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.hincr(key_device(device_id), "last_frame_id", 1i64).await?;
        Ok(id)
    }

    /// The highest frame id currently in a device's cache (the tail
    /// score), used to seed `last_frame_id` on reconnect so replay ids
    /// stay monotonic across a preemption.
    pub async fn tail_frame_id(&self, device_id: &DeviceId) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let rows: Vec<(Vec<u8>, f64)> =
            conn.zrevrangebyscore_withscores(key_frame_cache(device_id), "+inf", "-inf").await?;
        Ok(rows.first().map(|(_, score)| *score as u64).unwrap_or(0))
    }

    /// Append a frame to a device's replay cache, trimming to
    /// `device_frame_cache_size` and refreshing the TTL in one pipeline.
    pub async fn cache_frame(
        &self,
        device_id: &DeviceId,
        frame_id: u64,
        payload: &[u8],
        cache_size: u64,
        expire: std::time::Duration,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = key_frame_cache(device_id);
        redis::pipe()
            .atomic()
            .zadd(&key, payload, frame_id as f64)
            .zremrangebyrank(&key, 0, -(cache_size as isize) - 1)
            .expire(&key, expire.as_secs() as i64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Frames cached for a device with id greater than `since`, in id order.
    pub async fn replay_frames(&self, device_id: &DeviceId, since: u64) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let key = key_frame_cache(device_id);
        let items: Vec<Vec<u8>> = conn.zrangebyscore(&key, format!("({since}"), "+inf").await?;
        Ok(items)
    }

    /// Drop a device's entire cached frame history — used on preemption
    /// when the incoming session belongs to a different `uid` than the one
    /// previously attached to this device id.
    pub async fn drop_frame_cache(&self, device_id: &DeviceId) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key_frame_cache(device_id)).await?;
        Ok(())
    }

    // -- User device set / online user set -------------------------------

    pub async fn add_user_device(&self, uid: &Uid, device_id: &DeviceId) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key_user_device_set(uid), device_id.as_str()).await?;
        Ok(())
    }

    pub async fn remove_user_device(&self, uid: &Uid, device_id: &DeviceId) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key_user_device_set(uid), device_id.as_str()).await?;
        Ok(())
    }

    /// Liveness touch on the user's device set, run alongside every device
    /// heartbeat so the set's TTL never lapses while at least one of its
    /// devices is actively ticking.
    pub async fn touch_user_device_set(&self, uid: &Uid, ttl: std::time::Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key_user_device_set(uid), ttl.as_secs() as i64).await?;
        Ok(())
    }

    pub async fn devices_for_user(&self, uid: &Uid) -> anyhow::Result<Vec<DeviceId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(key_user_device_set(uid)).await?;
        Ok(ids.into_iter().map(DeviceId).collect())
    }

    pub async fn user_device_count(&self, uid: &Uid) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.scard(key_user_device_set(uid)).await?;
        Ok(n)
    }

    /// Add `uid` to the online-user set; returns `true` the first time
    /// (edge-triggered), `false` if it was already present.
    pub async fn mark_user_online(&self, uid: &Uid) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(KEY_ONLINE_USER_SET, uid.as_str()).await?;
        Ok(added == 1)
    }

    /// Remove `uid` from the online-user set iff its device set is empty.
    /// Returns `true` iff the removal actually happened (edge-triggered).
    pub async fn mark_user_offline_if_empty(&self, uid: &Uid) -> anyhow::Result<bool> {
        if self.user_device_count(uid).await? == 0 {
            let mut conn = self.conn.clone();
            let removed: i64 = conn.srem(KEY_ONLINE_USER_SET, uid.as_str()).await?;
            return Ok(removed == 1);
        }
        Ok(false)
    }

    pub async fn online_user_count(&self) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.scard(KEY_ONLINE_USER_SET).await?;
        Ok(n)
    }

    // -- Instance record / cluster set -----------------------------------

    pub async fn register_instance(
        &self,
        address: &InstanceAddress,
        version: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = key_instance(address);
        redis::pipe()
            .atomic()
            .sadd(KEY_CLUSTER_INSTANCE_SET, address.as_str())
            .hset(&key, "version", version)
            .hset(&key, "address", address.as_str())
            .hset(&key, "start_time", Utc::now().to_rfc3339())
            .hset(&key, "device_count", 0i64)
            .expire(&key, ttl.as_secs() as i64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn deregister_instance(&self, address: &InstanceAddress) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .srem(KEY_CLUSTER_INSTANCE_SET, address.as_str())
            .del(key_instance(address))
            .del(key_instance_device_set(address))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn known_instances(&self) -> anyhow::Result<Vec<InstanceAddress>> {
        let mut conn = self.conn.clone();
        let addrs: Vec<String> = conn.smembers(KEY_CLUSTER_INSTANCE_SET).await?;
        Ok(addrs.into_iter().map(InstanceAddress).collect())
    }

    pub async fn instance_record(&self, address: &InstanceAddress) -> anyhow::Result<Option<crate::model::Instance>> {
        let mut conn = self.conn.clone();
        let fields: Vec<(String, String)> = conn.hgetall(key_instance(address)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
        let start_time = get("start_time")
            .as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now));
        let device_count = self.device_count_on_instance(address).await?;
        Ok(Some(crate::model::Instance {
            address: address.clone(),
            version: get("version").unwrap_or_default(),
            start_time,
            device_count,
        }))
    }

    /// Publish bytes onto a topic; returns number of subscribers that
    /// received it (mirrors `PUBLISH`'s own return value).
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        let n: i64 = conn.publish(topic, payload).await?;
        Ok(n)
    }
}

fn build_url(addr: &str, config: &BrokerConfig) -> String {
    if config.redis_password.is_none() && config.redis_db == 0 {
        return addr.to_owned();
    }
    let mut url = url_with_db(addr, config.redis_db);
    if let Some(ref password) = config.redis_password {
        url = url.replacen("redis://", &format!("redis://:{password}@"), 1);
    }
    url
}

fn url_with_db(addr: &str, db: i64) -> String {
    if db == 0 {
        return addr.to_owned();
    }
    format!("{}/{db}", addr.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceAddress;

    #[test]
    fn topic_instance_is_address_scoped() {
        let a = InstanceAddress::from("10.0.0.1:8080");
        assert_eq!(topic_instance(&a), "sse_topic_instance_10.0.0.1:8080");
    }

    #[test]
    fn key_layout_matches_spec_table() {
        let a = InstanceAddress::from("10.0.0.1:8080");
        let d = DeviceId::from("abc123");
        let u = Uid::from("u1");
        assert_eq!(key_instance(&a), "sse_instance_10.0.0.1:8080");
        assert_eq!(key_instance_device_set(&a), "sse_instance_device_set_10.0.0.1:8080");
        assert_eq!(key_device(&d), "sse_device_abc123");
        assert_eq!(key_user_device_set(&u), "sse_user_device_set_u1");
        assert_eq!(key_frame_cache(&d), "sse_frame_cache_abc123");
    }

    #[test]
    fn url_with_db_appends_index() {
        assert_eq!(url_with_db("redis://localhost:6379", 0), "redis://localhost:6379");
        assert_eq!(url_with_db("redis://localhost:6379", 3), "redis://localhost:6379/3");
    }
}
