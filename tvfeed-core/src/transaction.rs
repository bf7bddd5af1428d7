//! View-change transactions.
//!
//! Every change of a feed's view or recording flags goes through a
//! [`FeedTransaction`]. Changes apply immediately so later steps of the same
//! request observe them, but their notifications are held back until
//! [`commit`](FeedTransaction::commit). A transaction that is dropped without
//! committing restores every flag it touched and fires nothing.

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::device::DeviceSlot;
use crate::error::FeedError;
use crate::event::FeedEvent;
use crate::feed::{Feed, FeedView};
use crate::source::{RecordingKey, SourceId};

/// Compensating action recorded for each change.
#[derive(Debug)]
enum Undo {
    PrimaryView {
        source: SourceId,
        device: usize,
        visible: bool,
    },
    SecondaryView {
        source: SourceId,
        device: usize,
        visible: bool,
    },
    Recording {
        source: SourceId,
        device: usize,
        key: RecordingKey,
        active: bool,
    },
    /// Device was allocated or re-tuned from idle for this request.
    Claimed { device: usize },
    /// Device was re-tuned away from a group still in use. Holds the replaced
    /// feed list with its flags.
    Retuned {
        device: usize,
        previous: Option<Vec<Feed>>,
    },
}

impl Undo {
    fn flag_device(&self) -> Option<usize> {
        match self {
            Undo::PrimaryView { device, .. }
            | Undo::SecondaryView { device, .. }
            | Undo::Recording { device, .. } => Some(*device),
            Undo::Claimed { .. } | Undo::Retuned { .. } => None,
        }
    }
}

/// A scoped batch of feed flag changes over all device slots.
pub struct FeedTransaction<'a> {
    devices: &'a mut [DeviceSlot],
    events: &'a broadcast::Sender<FeedEvent>,
    rollback: Vec<Undo>,
    commit: Vec<FeedEvent>,
}

impl<'a> FeedTransaction<'a> {
    pub fn new(devices: &'a mut [DeviceSlot], events: &'a broadcast::Sender<FeedEvent>) -> Self {
        Self {
            devices,
            events,
            rollback: Vec::new(),
            commit: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[DeviceSlot] {
        &*self.devices
    }

    pub(crate) fn device_mut(&mut self, index: usize) -> &mut DeviceSlot {
        &mut self.devices[index]
    }

    /// Find the feed for `source` on any device.
    pub fn find_feed(&self, source: &SourceId) -> Option<FeedView> {
        self.devices.iter().find_map(|d| d.feed(source))
    }

    /// The feed currently holding the primary view, as seen by this transaction.
    pub fn primary_view(&self) -> Option<FeedView> {
        self.devices
            .iter()
            .flat_map(DeviceSlot::feeds)
            .find(|f| f.primary_view)
    }

    /// Check if this transaction changed a flag of a feed on `device`.
    pub fn touches(&self, device: usize) -> bool {
        self.rollback.iter().any(|u| u.flag_device() == Some(device))
    }

    /// Number of changes that would be undone on rollback.
    pub fn pending_changes(&self) -> usize {
        self.rollback.len()
    }

    fn locate<R>(&self, source: &SourceId, inspect: impl Fn(&Feed) -> R) -> Result<(usize, R), FeedError> {
        self.devices
            .iter()
            .find_map(|d| d.with_feed(source, &inspect).map(|value| (d.index(), value)))
            .ok_or(FeedError::FeedNotFound(*source))
    }

    fn apply(&mut self, device: usize, source: &SourceId, change: impl FnOnce(&mut Feed)) {
        if self.devices[device].with_feed_mut(source, change).is_none() {
            warn!("Feed {} vanished from device {}", source, device);
        }
    }

    /// Show or hide `source` as the primary view.
    pub fn change_primary_view(&mut self, source: &SourceId, visible: bool) -> Result<(), FeedError> {
        let (device, current) = self.locate(source, Feed::is_primary_view)?;
        if current == visible {
            return Err(FeedError::InvalidTransition {
                feed: *source,
                reason: if visible {
                    "primary view already on"
                } else {
                    "primary view already off"
                },
            });
        }

        self.apply(device, source, |f| f.set_primary_view(visible));
        self.rollback.push(Undo::PrimaryView {
            source: *source,
            device,
            visible: !visible,
        });
        self.commit.push(FeedEvent::PrimaryViewVisibilityChanged {
            source: *source,
            device,
            visible,
        });
        debug!("Primary view {} -> {}", source, visible);
        Ok(())
    }

    pub fn enable_primary_view(&mut self, source: &SourceId) -> Result<(), FeedError> {
        self.change_primary_view(source, true)
    }

    pub fn disable_primary_view(&mut self, source: &SourceId) -> Result<(), FeedError> {
        self.change_primary_view(source, false)
    }

    /// Show or hide `source` as a secondary view.
    pub fn change_secondary_view(&mut self, source: &SourceId, visible: bool) -> Result<(), FeedError> {
        let (device, current) = self.locate(source, Feed::is_secondary_view)?;
        if current == visible {
            return Err(FeedError::InvalidTransition {
                feed: *source,
                reason: if visible {
                    "secondary view already on"
                } else {
                    "secondary view already off"
                },
            });
        }

        self.apply(device, source, |f| f.set_secondary_view(visible));
        self.rollback.push(Undo::SecondaryView {
            source: *source,
            device,
            visible: !visible,
        });
        self.commit.push(FeedEvent::SecondaryViewVisibilityChanged {
            source: *source,
            device,
            visible,
        });
        debug!("Secondary view {} -> {}", source, visible);
        Ok(())
    }

    pub fn enable_secondary_view(&mut self, source: &SourceId) -> Result<(), FeedError> {
        self.change_secondary_view(source, true)
    }

    pub fn disable_secondary_view(&mut self, source: &SourceId) -> Result<(), FeedError> {
        self.change_secondary_view(source, false)
    }

    /// Start or stop the recording `key` on `source`.
    pub fn change_recording(
        &mut self,
        source: &SourceId,
        key: &RecordingKey,
        active: bool,
    ) -> Result<(), FeedError> {
        let (device, current) = self.locate(source, |f| f.is_recording(key))?;
        if current == active {
            return Err(FeedError::InvalidTransition {
                feed: *source,
                reason: if active {
                    "recording already running"
                } else {
                    "recording not running"
                },
            });
        }

        self.apply(device, source, |f| f.set_recording(key, active));
        self.rollback.push(Undo::Recording {
            source: *source,
            device,
            key: key.clone(),
            active: !active,
        });
        self.commit.push(FeedEvent::RecordingStateChanged {
            source: *source,
            device,
            key: key.clone(),
            active,
        });
        debug!("Recording {} on {} -> {}", key, source, active);
        Ok(())
    }

    pub fn enable_recording(&mut self, source: &SourceId, key: &RecordingKey) -> Result<(), FeedError> {
        self.change_recording(source, key, true)
    }

    pub fn disable_recording(&mut self, source: &SourceId, key: &RecordingKey) -> Result<(), FeedError> {
        self.change_recording(source, key, false)
    }

    /// Record that `device` was taken for this request; rollback releases it.
    pub(crate) fn claim(&mut self, device: usize) {
        self.rollback.push(Undo::Claimed { device });
    }

    /// Re-tune `device` to the group of `source`; rollback reinstalls the
    /// replaced feeds and tunes back.
    pub(crate) fn retune(&mut self, device: usize, source: SourceId) {
        let previous = self.devices[device].retune(source);
        self.rollback.push(Undo::Retuned { device, previous });
    }

    /// Keep all changes, fire their notifications in order and release every
    /// device left idle.
    pub fn commit(mut self) {
        self.rollback.clear();

        let count = self.commit.len();
        for event in self.commit.drain(..) {
            // No receivers is fine
            let _ = self.events.send(event);
        }

        for slot in self.devices.iter_mut() {
            if slot.test_idle() {
                info!("Released idle device {}", slot.index());
            }
        }
        debug!("Committed {} feed changes", count);
    }

    /// Undo all changes, awaiting re-tunes back to the previous groups.
    ///
    /// Dropping the transaction restores the same state but does not wait for
    /// the devices to follow.
    pub async fn rollback(mut self) {
        if !self.rollback.is_empty() {
            info!("Rolling back {} feed changes", self.rollback.len());
        }

        while let Some(undo) = self.rollback.pop() {
            let tuned_back = match &undo {
                Undo::Retuned {
                    device,
                    previous: Some(_),
                } => Some(*device),
                _ => None,
            };
            self.undo(undo);

            if let Some(device) = tuned_back {
                if !self.devices[device].wait_for_group().await {
                    warn!("Device {}: hardware did not return to its previous group", device);
                }
            }
        }
        self.commit.clear();
    }

    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::PrimaryView { source, visible, .. } => {
                self.restore(&source, |f| f.set_primary_view(visible));
            }
            Undo::SecondaryView { source, visible, .. } => {
                self.restore(&source, |f| f.set_secondary_view(visible));
            }
            Undo::Recording { source, key, active, .. } => {
                self.restore(&source, |f| f.set_recording(&key, active));
            }
            Undo::Claimed { device } => {
                if self.devices[device].release_if_unused() {
                    debug!("Device {}: released on rollback", device);
                }
            }
            Undo::Retuned {
                device,
                previous: Some(feeds),
            } => {
                debug!("Device {}: reinstalling {} feeds", device, feeds.len());
                self.devices[device].reinstall(feeds);
            }
            Undo::Retuned { device, previous: None } => {
                self.devices[device].release_if_unused();
            }
        }
    }

    /// Restore a flag on whichever device now carries `source`.
    fn restore(&mut self, source: &SourceId, change: impl FnOnce(&mut Feed)) {
        match self.devices.iter().position(|d| d.contains(source)) {
            Some(device) => self.apply(device, source, change),
            None => warn!("Feed {} no longer received, cannot restore", source),
        }
    }
}

impl Drop for FeedTransaction<'_> {
    fn drop(&mut self) {
        if self.rollback.is_empty() {
            return;
        }

        warn!("Feed transaction dropped, undoing {} changes", self.rollback.len());
        while let Some(undo) = self.rollback.pop() {
            self.undo(undo);
        }
    }
}
