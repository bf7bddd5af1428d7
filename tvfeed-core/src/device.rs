//! Device slot: allocation and group-read state of one tuner.
//!
//! A slot moves from `Unallocated` to `Allocating` when it is told to receive a
//! source, and to `Active` once the provider has reported every source of the
//! tuned group. Group reads run in the background; a read that completes after
//! the slot was re-tuned or released is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::ProviderError;
use crate::feed::{Feed, FeedView};
use crate::provider::SourceProvider;
use crate::source::{SourceId, SourceInformation};
use crate::task::CancellableTask;

/// Externally visible allocation state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Unallocated,
    /// Group read in flight.
    Allocating,
    /// Feed list known, possibly empty.
    Active,
}

enum FeedList {
    Unallocated,
    Pending,
    Active(Vec<Feed>),
}

struct SlotInner {
    /// Bumped on every re-tune and release; a read only publishes if it still
    /// matches.
    generation: u64,
    feeds: FeedList,
}

fn lock(inner: &Mutex<SlotInner>) -> MutexGuard<'_, SlotInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One tuner device and the feeds it currently receives.
pub struct DeviceSlot {
    index: usize,
    provider: Arc<dyn SourceProvider>,
    inner: Arc<Mutex<SlotInner>>,
    /// Set between a successful allocation and the matching release.
    device_held: bool,
    /// Publication of the latest group read. Completes with `true` if the
    /// read's result became the slot's feed list.
    group_read: Option<CancellableTask<bool>>,
}

impl DeviceSlot {
    pub fn new(index: usize, provider: Arc<dyn SourceProvider>) -> Self {
        Self {
            index,
            provider,
            inner: Arc::new(Mutex::new(SlotInner {
                generation: 0,
                feeds: FeedList::Unallocated,
            })),
            device_held: false,
            group_read: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        match lock(&self.inner).feeds {
            FeedList::Unallocated if self.device_held => SlotState::Allocating,
            FeedList::Unallocated => SlotState::Unallocated,
            FeedList::Pending => SlotState::Allocating,
            FeedList::Active(_) => SlotState::Active,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.state() != SlotState::Unallocated
    }

    /// Check if a group read is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(lock(&self.inner).feeds, FeedList::Pending)
    }

    /// Check if the slot is active but none of its feeds is shown or recorded.
    pub fn is_idle(&self) -> bool {
        match &lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.iter().all(|f| !f.is_active()),
            _ => false,
        }
    }

    /// Check if the slot only carries secondary views and may be re-tuned for
    /// a more important request.
    pub fn reuse_possible(&self) -> bool {
        match &lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.iter().all(Feed::reuse_possible),
            _ => false,
        }
    }

    /// Sources shown as secondary views on this slot.
    pub fn secondary_feeds(&self) -> Vec<SourceId> {
        self.collect(|f| f.is_secondary_view().then_some(*f.source()))
    }

    /// Snapshots of all feeds; empty unless the slot is active.
    pub fn feeds(&self) -> Vec<FeedView> {
        self.collect(|f| Some(f.view()))
    }

    pub fn feed(&self, source: &SourceId) -> Option<FeedView> {
        self.with_feed(source, Feed::view)
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.with_feed(source, |_| ()).is_some()
    }

    /// First source of the tuned group, enough to tune back to it.
    pub fn first_source(&self) -> Option<SourceId> {
        match &lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.first().map(|f| *f.source()),
            _ => None,
        }
    }

    fn collect<T>(&self, f: impl FnMut(&Feed) -> Option<T>) -> Vec<T> {
        match &lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.iter().filter_map(f).collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn with_feed<R>(&self, source: &SourceId, f: impl FnOnce(&Feed) -> R) -> Option<R> {
        match &lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.iter().find(|feed| feed.source() == source).map(f),
            _ => None,
        }
    }

    pub(crate) fn with_feed_mut<R>(
        &mut self,
        source: &SourceId,
        f: impl FnOnce(&mut Feed) -> R,
    ) -> Option<R> {
        match &mut lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.iter_mut().find(|feed| feed.source() == source).map(f),
            _ => None,
        }
    }

    /// Allocate the device if this slot does not hold it yet.
    pub fn ensure_device(&mut self) -> Result<(), ProviderError> {
        if self.device_held {
            return Ok(());
        }

        self.provider.allocate_device(self.index)?;
        self.device_held = true;
        Ok(())
    }

    /// Tune the device to the group containing `source`.
    ///
    /// Any pending read is superseded and the feed list becomes pending until
    /// the new read publishes. A failed or empty read leaves an empty list.
    /// Must be called within a tokio runtime.
    pub fn ensure_feed(&mut self, source: SourceId) {
        if let Some(previous) = self.group_read.take() {
            debug!("Device {}: superseding pending group read", self.index);
            previous.cancel();
        }

        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            if let FeedList::Active(feeds) = &mut inner.feeds {
                feeds.iter_mut().for_each(Feed::refresh_source_information);
            }
            inner.feeds = FeedList::Pending;
            inner.generation
        };

        info!("Device {}: tuning to group of {}", self.index, source);
        let read = self.provider.activate(self.index, &source);

        let inner = Arc::clone(&self.inner);
        let index = self.index;
        let publish = read.then(move |sources| {
            let mut inner = lock(&inner);
            if inner.generation != generation || !matches!(inner.feeds, FeedList::Pending) {
                debug!("Device {}: discarding superseded group read for {}", index, source);
                return Some(false);
            }

            let feeds: Vec<Feed> = sources
                .unwrap_or_default()
                .into_iter()
                .map(|s| Feed::new(s, index))
                .collect();

            if feeds.is_empty() {
                warn!("Device {}: group read for {} returned no sources", index, source);
            } else {
                debug!("Device {}: {} sources receivable", index, feeds.len());
            }

            inner.feeds = FeedList::Active(feeds);
            Some(true)
        });

        self.group_read = Some(publish);
    }

    /// Re-tune like `ensure_feed`, handing back the replaced feed list so that
    /// `reinstall` can put it back with its flags intact.
    pub(crate) fn retune(&mut self, source: SourceId) -> Option<Vec<Feed>> {
        let previous = {
            let mut inner = lock(&self.inner);
            match std::mem::replace(&mut inner.feeds, FeedList::Pending) {
                FeedList::Active(mut feeds) => {
                    feeds.iter_mut().for_each(Feed::refresh_source_information);
                    Some(feeds)
                }
                other => {
                    inner.feeds = other;
                    None
                }
            }
        };

        self.ensure_feed(source);
        previous
    }

    /// Put back a feed list taken by `retune` and tune the device back to its
    /// group. The list is installed at once; the hardware follows in the
    /// background and its result never replaces the list.
    pub(crate) fn reinstall(&mut self, feeds: Vec<Feed>) {
        if let Some(read) = self.group_read.take() {
            debug!("Device {}: abandoning group read", self.index);
            read.cancel();
        }

        let first = feeds.first().map(|f| *f.source());
        {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.feeds = FeedList::Active(feeds);
        }

        let Some(first) = first else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("Device {}: no runtime, cannot tune back to {}", self.index, first);
            return;
        }

        info!("Device {}: tuning back to group of {}", self.index, first);
        let index = self.index;
        let confirm = self.provider.activate(self.index, &first).then(move |sources| {
            let covered = sources.is_some_and(|s| s.contains(&first));
            if !covered {
                warn!("Device {}: could not tune back to {}", index, first);
            }
            Some(covered)
        });
        self.group_read = Some(confirm);
    }

    /// Wait for the latest group read. `false` if it was superseded or the
    /// hardware did not follow.
    pub(crate) async fn wait_for_group(&self) -> bool {
        match &self.group_read {
            Some(read) => read.wait().await.unwrap_or(false),
            None => true,
        }
    }

    /// Wait for the latest group read and check if it covers `source`.
    pub async fn wait_for_feed(&self, source: &SourceId) -> bool {
        if let Some(read) = &self.group_read {
            read.wait().await;
        }
        self.contains(source)
    }

    /// Run `callback` once the latest group read has been published.
    ///
    /// The callback receives the feed for `source` and `true`, or `None` and
    /// `false` if the group does not contain it. Does nothing if no read was
    /// ever issued; a read superseded before it publishes never calls back.
    pub fn fire_when_available<F>(&self, source: SourceId, callback: F)
    where
        F: FnOnce(Option<FeedView>, bool) + Send + 'static,
    {
        let Some(read) = &self.group_read else {
            debug!("Device {}: no group read to wait for", self.index);
            return;
        };

        let inner = Arc::clone(&self.inner);
        // Runs detached
        let _continuation = read.then(move |_| {
            let feed = match &lock(&inner).feeds {
                FeedList::Active(feeds) => feeds.iter().find(|f| *f.source() == source).map(Feed::view),
                _ => None,
            };
            let found = feed.is_some();
            callback(feed, found);
            Some(())
        });
    }

    /// Get the metadata read for a feed, starting one if needed.
    pub fn source_information(&mut self, source: &SourceId) -> Option<CancellableTask<SourceInformation>> {
        match &mut lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds
                .iter_mut()
                .find(|f| f.source() == source)
                .map(|f| f.read_source_information(self.provider.as_ref())),
            _ => None,
        }
    }

    /// Discard the metadata read of one feed.
    pub fn refresh_source_information(&mut self, source: &SourceId) -> bool {
        self.with_feed_mut(source, Feed::refresh_source_information).is_some()
    }

    /// Discard all cached metadata of this slot without re-tuning.
    pub fn refresh_source_informations(&mut self) {
        if let FeedList::Active(feeds) = &mut lock(&self.inner).feeds {
            feeds.iter_mut().for_each(Feed::refresh_source_information);
        }
        self.provider.refresh_source_informations(self.index);
    }

    /// Release the device if it is idle.
    pub fn test_idle(&mut self) -> bool {
        if !self.is_idle() {
            return false;
        }

        self.release();
        true
    }

    /// Release the device if nothing on it is in use, including a read in flight.
    pub(crate) fn release_if_unused(&mut self) -> bool {
        let unused = match &lock(&self.inner).feeds {
            FeedList::Active(feeds) => feeds.iter().all(|f| !f.is_active()),
            FeedList::Pending => true,
            FeedList::Unallocated => self.device_held,
        };

        if unused {
            self.release();
        }
        unused
    }

    /// Cancel any read, drop all feeds and hand the device back to the provider.
    pub(crate) fn release(&mut self) {
        if let Some(read) = self.group_read.take() {
            read.cancel();
        }

        {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            if let FeedList::Active(feeds) = &mut inner.feeds {
                feeds.iter_mut().for_each(Feed::refresh_source_information);
            }
            inner.feeds = FeedList::Unallocated;
        }

        if self.device_held {
            self.provider.release_device(self.index);
            self.device_held = false;
        }
        info!("Device {} returned to pool", self.index);
    }
}
