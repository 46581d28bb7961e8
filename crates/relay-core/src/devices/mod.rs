//! Device registry
//!
//! Tracks the devices belonging to each user together with their push tokens. Storage
//! is partitioned by key in `DashMap`s so heartbeats, deliveries and the retention sweep
//! never contend on a single lock. A push token identifies at most one device:
//! registering a known token under a new device id moves it.

use crate::config::DeviceConfig;
use crate::core_types::{DeviceId, DeviceRegistration, Platform, UserId};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub push_token: String,
    pub platform: Platform,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Device>,
    /// push token -> device id
    tokens: DashMap<String, DeviceId>,
    liveness_window: Duration,
    retention: Duration,
}

impl DeviceRegistry {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            devices: DashMap::new(),
            tokens: DashMap::new(),
            liveness_window: config.liveness_window(),
            retention: config.retention(),
        }
    }

    pub fn register(&self, device_id: &str, user_id: &str, push_token: &str, platform: Platform) {
        self.register_at(device_id, user_id, push_token, platform, Utc::now())
    }

    pub fn register_device(&self, registration: &DeviceRegistration) {
        self.register(
            &registration.device_id,
            &registration.user_id,
            &registration.push_token,
            registration.platform,
        )
    }

    pub fn register_at(
        &self,
        device_id: &str,
        user_id: &str,
        push_token: &str,
        platform: Platform,
        now: DateTime<Utc>,
    ) {
        // Move the token off whichever device held it before.
        if let Some(previous) = self
            .tokens
            .get(push_token)
            .map(|owner| owner.value().clone())
        {
            if previous != device_id {
                log::info!(
                    "Push token moved from device '{}' to device '{}'",
                    previous,
                    device_id
                );
                self.devices.remove(&previous);
            }
        }

        let mut stale_token = None;
        match self.devices.get_mut(device_id) {
            Some(mut existing) => {
                if existing.push_token != push_token {
                    stale_token = Some(std::mem::replace(
                        &mut existing.push_token,
                        push_token.to_string(),
                    ));
                }
                existing.user_id = user_id.to_string();
                existing.platform = platform;
                existing.last_seen_at = now;
            }
            None => {
                log::debug!("Registered device '{}' for user '{}'", device_id, user_id);
                self.devices.insert(
                    device_id.to_string(),
                    Device {
                        device_id: device_id.to_string(),
                        user_id: user_id.to_string(),
                        push_token: push_token.to_string(),
                        platform,
                        registered_at: now,
                        last_seen_at: now,
                    },
                );
            }
        }

        if let Some(old) = stale_token {
            self.tokens
                .remove_if(&old, |_, owner| owner.as_str() == device_id);
        }
        self.tokens
            .insert(push_token.to_string(), device_id.to_string());
    }

    /// Refresh `last_seen_at`. Returns false for unknown devices.
    pub fn touch(&self, device_id: &str) -> bool {
        self.touch_at(device_id, Utc::now())
    }

    pub fn touch_at(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut device) => {
                device.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Remove a device. Unknown ids are a no-op.
    pub fn unregister(&self, device_id: &str) -> Option<Device> {
        let (_, device) = self.devices.remove(device_id)?;
        self.tokens
            .remove_if(&device.push_token, |_, owner| owner.as_str() == device_id);
        log::debug!("Unregistered device '{}'", device_id);
        Some(device)
    }

    /// Remove whichever device holds `push_token`.
    pub fn remove_by_token(&self, push_token: &str) -> Option<Device> {
        let (_, device_id) = self.tokens.remove(push_token)?;
        let removed = self
            .devices
            .remove_if(&device_id, |_, device| device.push_token == push_token)
            .map(|(_, device)| device);
        if let Some(device) = &removed {
            log::warn!(
                "Removed device '{}' of user '{}' after its push token was rejected",
                device.device_id,
                device.user_id
            );
        }
        removed
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    /// Devices of `user_id` seen within the liveness window.
    pub fn active_devices_for(&self, user_id: &str) -> Vec<Device> {
        self.active_devices_for_at(user_id, Utc::now())
    }

    pub fn active_devices_for_at(&self, user_id: &str, now: DateTime<Utc>) -> Vec<Device> {
        let cutoff = now - self.liveness_window;
        self.collect(|d| d.user_id == user_id && d.last_seen_at >= cutoff)
    }

    /// Every retained device of `user_id`.
    pub fn devices_for(&self, user_id: &str) -> Vec<Device> {
        self.collect(|d| d.user_id == user_id)
    }

    fn collect<F: Fn(&Device) -> bool>(&self, keep: F) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// Drop devices unseen for the retention window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let expired: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|entry| entry.last_seen_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for device_id in expired {
            if let Some((_, device)) = self
                .devices
                .remove_if(&device_id, |_, d| d.last_seen_at < cutoff)
            {
                self.tokens
                    .remove_if(&device.push_token, |_, owner| *owner == device_id);
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("Device sweep removed {} stale devices", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
