//! A single receivable source within a tuned group.

use std::collections::BTreeSet;

use log::debug;
use serde::Serialize;

use crate::provider::SourceProvider;
use crate::source::{RecordingKey, SourceId, SourceInformation};
use crate::task::CancellableTask;

/// View and recording state of one source on a device.
///
/// Feeds are owned by their [`DeviceSlot`](crate::device::DeviceSlot) and are
/// recreated on every re-tune. The flags are only written by a
/// [`FeedTransaction`](crate::transaction::FeedTransaction).
#[derive(Debug)]
pub struct Feed {
    source: SourceId,
    /// Index of the owning device.
    device: usize,
    primary_view: bool,
    secondary_view: bool,
    recordings: BTreeSet<RecordingKey>,
    /// Latest metadata read, if one was requested.
    source_info: Option<CancellableTask<SourceInformation>>,
}

impl Feed {
    pub(crate) fn new(source: SourceId, device: usize) -> Self {
        Self {
            source,
            device,
            primary_view: false,
            secondary_view: false,
            recordings: BTreeSet::new(),
            source_info: None,
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn is_primary_view(&self) -> bool {
        self.primary_view
    }

    pub fn is_secondary_view(&self) -> bool {
        self.secondary_view
    }

    pub fn is_recording(&self, key: &RecordingKey) -> bool {
        self.recordings.contains(key)
    }

    pub fn recordings(&self) -> impl Iterator<Item = &RecordingKey> {
        self.recordings.iter()
    }

    /// Check if the feed is shown or recorded.
    pub fn is_active(&self) -> bool {
        self.primary_view || self.secondary_view || !self.recordings.is_empty()
    }

    /// Check if the device may be re-tuned without disturbing anything but a
    /// secondary view.
    pub fn reuse_possible(&self) -> bool {
        !self.primary_view && self.recordings.is_empty()
    }

    /// The latest metadata read, possibly still running.
    pub fn source_information_reader(&self) -> Option<&CancellableTask<SourceInformation>> {
        self.source_info.as_ref()
    }

    /// Get the metadata read, starting a fresh one if none is outstanding.
    pub(crate) fn read_source_information(
        &mut self,
        provider: &dyn SourceProvider,
    ) -> CancellableTask<SourceInformation> {
        let source = self.source;
        let device = self.device;
        self.source_info
            .get_or_insert_with(|| provider.source_information(device, &source))
            .clone()
    }

    /// Drop the current metadata read so the next one starts fresh.
    pub fn refresh_source_information(&mut self) {
        if let Some(reader) = self.source_info.take() {
            debug!("Discarding source information read for {}", self.source);
            reader.cancel();
        }
    }

    pub(crate) fn set_primary_view(&mut self, visible: bool) {
        self.primary_view = visible;
    }

    pub(crate) fn set_secondary_view(&mut self, visible: bool) {
        self.secondary_view = visible;
    }

    pub(crate) fn set_recording(&mut self, key: &RecordingKey, active: bool) {
        if active {
            self.recordings.insert(key.clone());
        } else {
            self.recordings.remove(key);
        }
    }

    /// Take a snapshot of the feed's state.
    pub fn view(&self) -> FeedView {
        FeedView {
            source: self.source,
            device: self.device,
            primary_view: self.primary_view,
            secondary_view: self.secondary_view,
            recordings: self.recordings.iter().cloned().collect(),
        }
    }
}

/// Point-in-time copy of a [`Feed`], handed out to callers.
///
/// Views do not follow later changes; re-resolve by source to get fresh state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedView {
    pub source: SourceId,
    pub device: usize,
    pub primary_view: bool,
    pub secondary_view: bool,
    pub recordings: Vec<RecordingKey>,
}

impl FeedView {
    pub fn is_recording(&self) -> bool {
        !self.recordings.is_empty()
    }
}
