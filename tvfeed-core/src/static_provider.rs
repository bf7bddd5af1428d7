//! Source provider backed by a static group table.
//!
//! Every device can receive every configured group. Tuning a device to one
//! service makes all services of the same NID/TSID group receivable. Groups
//! can be marked unavailable to model missing hardware or a dead transponder.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::provider::SourceProvider;
use crate::source::{SourceId, SourceInformation};
use crate::task::CancellableTask;

fn default_devices() -> usize {
    2
}

fn default_service_type() -> u8 {
    0x01
}

/// Provider configuration, usually the `[provider]` section of a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticProviderConfig {
    /// Number of tuner devices.
    #[serde(default = "default_devices")]
    pub devices: usize,
    /// Simulated tuning and table read latency (milliseconds).
    #[serde(default)]
    pub tune_delay_ms: u64,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// One transport stream and the services carried in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub nid: u16,
    pub tsid: u16,
    /// Tuning succeeds but no service can be received.
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub sid: u16,
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_service_type")]
    pub service_type: u8,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub video_pid: Option<u16>,
    #[serde(default)]
    pub audio_pids: Vec<u16>,
}

impl StaticProviderConfig {
    /// Create an empty configuration with the given number of devices.
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            tune_delay_ms: 0,
            groups: Vec::new(),
        }
    }

    /// Add a receivable group. Service IDs are assigned in order starting at 0x0400.
    pub fn with_group(mut self, nid: u16, tsid: u16, names: &[&str]) -> Self {
        self.groups.push(GroupConfig::new(nid, tsid, names));
        self
    }

    /// Add a group that can never be received.
    pub fn with_unavailable_group(mut self, nid: u16, tsid: u16, names: &[&str]) -> Self {
        let mut group = GroupConfig::new(nid, tsid, names);
        group.unavailable = true;
        self.groups.push(group);
        self
    }

    pub fn with_tune_delay(mut self, delay_ms: u64) -> Self {
        self.tune_delay_ms = delay_ms;
        self
    }

    /// Four terrestrial groups, used when no configuration file is given.
    pub fn sample(devices: usize) -> Self {
        Self::new(devices)
            .with_group(0x7FE0, 0x7FE0, &["NHK", "NHK2", "NHK3"])
            .with_group(0x7FE1, 0x7FE1, &["ETV", "ETV2"])
            .with_group(0x7FE2, 0x7FE2, &["NTV", "NTV2"])
            .with_group(0x7FE3, 0x7FE3, &["TBS", "TBS2"])
    }
}

impl GroupConfig {
    fn new(nid: u16, tsid: u16, names: &[&str]) -> Self {
        let services = names
            .iter()
            .enumerate()
            .map(|(i, name)| ServiceConfig {
                sid: 0x0400 + i as u16,
                name: name.to_string(),
                provider: String::new(),
                service_type: default_service_type(),
                encrypted: false,
                video_pid: None,
                audio_pids: Vec::new(),
            })
            .collect();
        Self {
            nid,
            tsid,
            unavailable: false,
            services,
        }
    }

    fn contains(&self, source: &SourceId) -> bool {
        self.nid == source.nid
            && self.tsid == source.tsid
            && self.services.iter().any(|s| s.sid == source.sid)
    }

    fn sources(&self) -> Vec<SourceId> {
        self.services
            .iter()
            .map(|s| SourceId::new(self.nid, self.tsid, s.sid))
            .collect()
    }
}

/// Per-device usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub allocated: bool,
    /// `(nid, tsid)` of the group the device is tuned to.
    pub tuned: Option<(u16, u16)>,
    pub allocations: u32,
    pub releases: u32,
    pub activations: u32,
    pub refreshes: u32,
}

/// Provider serving a fixed group table.
pub struct StaticSourceProvider {
    config: StaticProviderConfig,
    devices: Mutex<Vec<DeviceStats>>,
}

impl StaticSourceProvider {
    pub fn new(config: StaticProviderConfig) -> Self {
        let devices = vec![DeviceStats::default(); config.devices];
        info!(
            "Static provider: {} devices, {} groups",
            config.devices,
            config.groups.len()
        );
        Self {
            config,
            devices: Mutex::new(devices),
        }
    }

    /// Get the counters of one device.
    pub fn stats(&self, index: usize) -> Option<DeviceStats> {
        self.devices().get(index).cloned()
    }

    /// Get the counters of all devices.
    pub fn all_stats(&self) -> Vec<DeviceStats> {
        self.devices().clone()
    }

    fn devices(&self) -> MutexGuard<'_, Vec<DeviceStats>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_service(&self, source: &SourceId) -> Option<&ServiceConfig> {
        self.config
            .groups
            .iter()
            .filter(|g| g.nid == source.nid && g.tsid == source.tsid)
            .flat_map(|g| g.services.iter())
            .find(|s| s.sid == source.sid)
    }

    fn delayed<T>(&self, value: Option<T>) -> CancellableTask<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.config.tune_delay_ms == 0 {
            return CancellableTask::completed(value);
        }

        let delay = Duration::from_millis(self.config.tune_delay_ms);
        CancellableTask::run(move |token| async move {
            tokio::select! {
                _ = token.cancelled() => None,
                _ = tokio::time::sleep(delay) => value,
            }
        })
    }
}

impl SourceProvider for StaticSourceProvider {
    fn device_count(&self) -> usize {
        self.config.devices
    }

    fn allocate_device(&self, index: usize) -> Result<(), ProviderError> {
        let mut devices = self.devices();
        let device = devices
            .get_mut(index)
            .ok_or(ProviderError::OutOfRange(index))?;

        if device.allocated {
            return Err(ProviderError::AlreadyAllocated(index));
        }

        device.allocated = true;
        device.allocations += 1;
        info!("Device {} allocated", index);
        Ok(())
    }

    fn release_device(&self, index: usize) {
        let mut devices = self.devices();
        match devices.get_mut(index) {
            Some(device) if device.allocated => {
                device.allocated = false;
                device.tuned = None;
                device.releases += 1;
                info!("Device {} released", index);
            }
            Some(_) => warn!("Device {} released but not allocated", index),
            None => warn!("Release of unknown device {}", index),
        }
    }

    fn activate(&self, index: usize, source: &SourceId) -> CancellableTask<Vec<SourceId>> {
        let group = self.config.groups.iter().find(|g| g.contains(source));

        {
            let mut devices = self.devices();
            let Some(device) = devices.get_mut(index).filter(|d| d.allocated) else {
                warn!("Activate on unallocated device {}", index);
                return CancellableTask::completed(Some(Vec::new()));
            };

            device.activations += 1;
            device.tuned = group.map(|g| (g.nid, g.tsid));
        }

        let sources = match group {
            Some(group) if group.unavailable => {
                debug!("Device {}: group {:04X}/{:04X} has no signal", index, group.nid, group.tsid);
                Vec::new()
            }
            Some(group) => group.sources(),
            None => {
                warn!("Device {}: no group carries {}", index, source);
                Vec::new()
            }
        };

        self.delayed(Some(sources))
    }

    fn translate(&self, name: &str) -> Option<SourceId> {
        self.config.groups.iter().find_map(|g| {
            g.services
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .map(|s| SourceId::new(g.nid, g.tsid, s.sid))
        })
    }

    fn source_information(&self, index: usize, source: &SourceId) -> CancellableTask<SourceInformation> {
        let info = self.find_service(source).map(|s| SourceInformation {
            source: *source,
            name: s.name.clone(),
            provider: s.provider.clone(),
            service_type: s.service_type,
            is_encrypted: s.encrypted,
            video_pid: s.video_pid,
            audio_pids: s.audio_pids.clone(),
        });

        if info.is_none() {
            warn!("Device {}: no information for {}", index, source);
        }

        self.delayed(info)
    }

    fn refresh_source_informations(&self, index: usize) {
        if let Some(device) = self.devices().get_mut(index) {
            device.refreshes += 1;
            debug!("Device {}: source information cache cleared", index);
        }
    }
}
