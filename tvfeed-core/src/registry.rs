//! Feed registry: arbitration of views and recordings over all devices.
//!
//! The registry owns one [`DeviceSlot`] per provider device and decides which
//! device receives which source. Every public operation runs inside a
//! [`FeedTransaction`]: either all of its flag changes are committed and
//! announced, or none are.
//!
//! Operations take `&mut self`; the registry is meant to be driven by a single
//! control task, with observers following [`FeedRegistry::subscribe`].

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::device::{DeviceSlot, SlotState};
use crate::error::FeedError;
use crate::event::FeedEvent;
use crate::feed::FeedView;
use crate::provider::SourceProvider;
use crate::source::{RecordingKey, SourceId, SourceInformation};
use crate::task::CancellableTask;
use crate::transaction::FeedTransaction;

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 256;

/// State of one device, as reported by [`FeedRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub index: usize,
    pub state: SlotState,
    pub feeds: Vec<FeedView>,
}

/// Point-in-time state of all devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub devices: Vec<DeviceStatus>,
}

impl RegistrySnapshot {
    pub fn primary_view(&self) -> Option<&FeedView> {
        self.devices
            .iter()
            .flat_map(|d| d.feeds.iter())
            .find(|f| f.primary_view)
    }

    /// Number of devices currently allocated.
    pub fn allocated(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state != SlotState::Unallocated)
            .count()
    }
}

/// Arbiter of all feeds over a provider's devices.
pub struct FeedRegistry {
    provider: Arc<dyn SourceProvider>,
    devices: Vec<DeviceSlot>,
    events: broadcast::Sender<FeedEvent>,
}

impl FeedRegistry {
    /// Create a registry with one unallocated slot per provider device.
    pub fn new(provider: Arc<dyn SourceProvider>) -> Self {
        let count = provider.device_count();
        let devices = (0..count)
            .map(|index| DeviceSlot::new(index, Arc::clone(&provider)))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!("Feed registry created with {} devices", count);
        Self {
            provider,
            devices,
            events,
        }
    }

    /// Subscribe to committed feed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[DeviceSlot] {
        &self.devices
    }

    /// All feeds of all active devices.
    pub fn feeds(&self) -> Vec<FeedView> {
        self.devices.iter().flat_map(DeviceSlot::feeds).collect()
    }

    pub fn primary_view(&self) -> Option<FeedView> {
        self.feeds().into_iter().find(|f| f.primary_view)
    }

    pub fn secondary_views(&self) -> Vec<FeedView> {
        self.feeds().into_iter().filter(|f| f.secondary_view).collect()
    }

    pub fn recordings(&self) -> Vec<FeedView> {
        self.feeds().into_iter().filter(FeedView::is_recording).collect()
    }

    /// Look up the feed for a source name, if any device receives it.
    pub fn find_feed(&self, name: &str) -> Result<Option<FeedView>, FeedError> {
        let source = self.translate(name)?;
        Ok(self.feed_for(&source))
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            devices: self
                .devices
                .iter()
                .map(|d| DeviceStatus {
                    index: d.index(),
                    state: d.state(),
                    feeds: d.feeds(),
                })
                .collect(),
        }
    }

    fn translate(&self, name: &str) -> Result<SourceId, FeedError> {
        self.provider
            .translate(name)
            .ok_or_else(|| FeedError::UnknownSource(name.to_string()))
    }

    fn feed_for(&self, source: &SourceId) -> Option<FeedView> {
        self.devices.iter().find_map(|d| d.feed(source))
    }

    fn begin_change(&mut self) -> FeedTransaction<'_> {
        FeedTransaction::new(&mut self.devices, &self.events)
    }

    /// Make `name` the primary view.
    ///
    /// A secondary view of the same source is promoted and the previous
    /// primary takes its place. Returns `Ok(false)` if no device can receive
    /// the source; the registry is then unchanged.
    pub async fn try_start_primary_feed(&mut self, name: &str) -> Result<bool, FeedError> {
        let source = self.translate(name)?;

        let existing = self.feed_for(&source);
        if existing.as_ref().is_some_and(|f| f.primary_view) {
            debug!("{} is already the primary view", source);
            return Ok(true);
        }
        let was_secondary = existing.is_some_and(|f| f.secondary_view);

        let mut tx = self.begin_change();
        if was_secondary {
            tx.disable_secondary_view(&source)?;
        }

        if let Some(old) = tx.primary_view() {
            tx.disable_primary_view(&old.source)?;
            if was_secondary {
                tx.enable_secondary_view(&old.source)?;
            }
        }

        if !ensure_primary_feed(&mut tx, &source).await? {
            warn!("No device can receive {} as primary view", source);
            tx.rollback().await;
            return Ok(false);
        }

        tx.enable_primary_view(&source)?;
        tx.commit();
        info!("Primary view is now {}", source);
        Ok(true)
    }

    /// Show `name` as a secondary view.
    ///
    /// Never disturbs the primary view or recordings. Fails if the source is
    /// the primary view.
    pub async fn try_start_secondary_feed(&mut self, name: &str) -> Result<bool, FeedError> {
        let source = self.translate(name)?;

        if let Some(feed) = self.feed_for(&source) {
            if feed.secondary_view {
                return Ok(true);
            }
            if feed.primary_view {
                debug!("{} is the primary view, not adding a secondary view", source);
                return Ok(false);
            }
        }

        let mut tx = self.begin_change();
        if !ensure_feed(&mut tx, &source).await {
            warn!("No device available for secondary view {}", source);
            tx.rollback().await;
            return Ok(false);
        }

        tx.enable_secondary_view(&source)?;
        tx.commit();
        info!("Secondary view added: {}", source);
        Ok(true)
    }

    /// Hide the secondary view of `name`, if shown.
    pub fn stop_secondary_feed(&mut self, name: &str) -> Result<(), FeedError> {
        let source = self.translate(name)?;
        if !self.feed_for(&source).is_some_and(|f| f.secondary_view) {
            return Ok(());
        }

        let mut tx = self.begin_change();
        tx.disable_secondary_view(&source)?;
        tx.commit();
        info!("Secondary view removed: {}", source);
        Ok(())
    }

    /// Start the recording `key` on `name`.
    ///
    /// May take the device of the primary view. The recorded source becomes
    /// the primary view if there is none. Fails if `key` is already recording
    /// this source.
    pub async fn try_start_recording_feed(
        &mut self,
        name: &str,
        key: impl Into<RecordingKey>,
    ) -> Result<bool, FeedError> {
        let source = self.translate(name)?;
        let key = key.into();

        if self
            .feed_for(&source)
            .is_some_and(|f| f.recordings.contains(&key))
        {
            warn!("Recording {} already running on {}", key, source);
            return Ok(false);
        }

        let mut tx = self.begin_change();
        if !ensure_recording_feed(&mut tx, &source).await? {
            warn!("No device can receive {} for recording {}", source, key);
            tx.rollback().await;
            return Ok(false);
        }

        tx.enable_recording(&source, &key)?;
        if tx.primary_view().is_none() && !tx.find_feed(&source).is_some_and(|f| f.secondary_view) {
            tx.enable_primary_view(&source)?;
        }
        tx.commit();
        info!("Recording {} started on {}", key, source);
        Ok(true)
    }

    /// Stop the recording `key` on `name`, if running.
    pub fn stop_recording_feed(&mut self, name: &str, key: impl Into<RecordingKey>) -> Result<(), FeedError> {
        let source = self.translate(name)?;
        let key = key.into();
        if !self
            .feed_for(&source)
            .is_some_and(|f| f.recordings.contains(&key))
        {
            return Ok(());
        }

        let mut tx = self.begin_change();
        tx.disable_recording(&source, &key)?;
        tx.commit();
        info!("Recording {} stopped on {}", key, source);
        Ok(())
    }

    /// Get the metadata read for a received source, starting one if needed.
    ///
    /// `Ok(None)` if no device currently receives the source.
    pub fn source_information(
        &mut self,
        name: &str,
    ) -> Result<Option<CancellableTask<SourceInformation>>, FeedError> {
        let source = self.translate(name)?;
        Ok(self
            .devices
            .iter_mut()
            .find_map(|d| d.source_information(&source)))
    }

    /// Discard the metadata read of one received source.
    pub fn refresh_source_information(&mut self, name: &str) -> Result<bool, FeedError> {
        let source = self.translate(name)?;
        Ok(self
            .devices
            .iter_mut()
            .any(|d| d.refresh_source_information(&source)))
    }

    /// Discard cached metadata on every allocated device.
    pub fn refresh_source_informations(&mut self) {
        for slot in self.devices.iter_mut().filter(|d| d.is_allocated()) {
            slot.refresh_source_informations();
        }
    }

    /// Stop every view and recording, then release all devices.
    pub fn shutdown(&mut self) {
        let feeds = self.feeds();

        let mut tx = self.begin_change();
        for feed in &feeds {
            for key in &feed.recordings {
                if let Err(e) = tx.disable_recording(&feed.source, key) {
                    warn!("Shutdown: {}", e);
                }
            }
            if feed.secondary_view {
                if let Err(e) = tx.disable_secondary_view(&feed.source) {
                    warn!("Shutdown: {}", e);
                }
            }
            if feed.primary_view {
                if let Err(e) = tx.disable_primary_view(&feed.source) {
                    warn!("Shutdown: {}", e);
                }
            }
        }
        tx.commit();

        for slot in self.devices.iter_mut().filter(|d| d.is_allocated()) {
            slot.release();
        }
        info!("Feed registry shut down");
    }
}

/// Make a feed for `source` exist without changing any flags.
///
/// Prefers a device already receiving it, then an idle device not touched by
/// this transaction, then an unallocated device.
async fn ensure_feed(tx: &mut FeedTransaction<'_>, source: &SourceId) -> bool {
    if let Some(feed) = tx.find_feed(source) {
        debug!("{} already received on device {}", source, feed.device);
        return true;
    }

    let idle = (0..tx.devices().len()).find(|&i| tx.devices()[i].is_idle() && !tx.touches(i));
    if let Some(index) = idle {
        info!("Re-tuning idle device {} for {}", index, source);
        tx.claim(index);
        return tune(tx, index, source).await;
    }

    for index in 0..tx.devices().len() {
        if tx.devices()[index].is_allocated() {
            continue;
        }

        if let Err(e) = tx.device_mut(index).ensure_device() {
            warn!("Device {} could not be allocated: {}", index, e);
            continue;
        }

        info!("Allocated device {} for {}", index, source);
        tx.claim(index);
        return tune(tx, index, source).await;
    }

    debug!("No free device for {}", source);
    false
}

async fn tune(tx: &mut FeedTransaction<'_>, index: usize, source: &SourceId) -> bool {
    let slot = tx.device_mut(index);
    slot.ensure_feed(*source);
    if slot.wait_for_feed(source).await {
        return true;
    }

    warn!("Device {}: {} is not receivable", index, source);
    false
}

/// Like [`ensure_feed`], but may take over a device that only carries
/// secondary views, hiding them.
async fn ensure_primary_feed(tx: &mut FeedTransaction<'_>, source: &SourceId) -> Result<bool, FeedError> {
    if ensure_feed(tx, source).await {
        return Ok(true);
    }

    let candidate = tx
        .devices()
        .iter()
        .filter(|d| d.reuse_possible() && d.first_source().is_some())
        .min_by_key(|d| d.secondary_feeds().len())
        .map(DeviceSlot::index);
    let Some(index) = candidate else {
        return Ok(false);
    };

    let secondaries = tx.devices()[index].secondary_feeds();
    info!(
        "Taking over device {} for {} ({} secondary views hidden)",
        index,
        source,
        secondaries.len()
    );
    for secondary in &secondaries {
        tx.disable_secondary_view(secondary)?;
    }

    tx.retune(index, *source);
    Ok(tx.devices()[index].wait_for_feed(source).await)
}

/// Like [`ensure_primary_feed`], but may also take the primary view's device.
async fn ensure_recording_feed(tx: &mut FeedTransaction<'_>, source: &SourceId) -> Result<bool, FeedError> {
    if ensure_primary_feed(tx, source).await? {
        return Ok(true);
    }

    let Some(primary) = tx.primary_view() else {
        return Ok(false);
    };

    info!("Pre-empting primary view {} for recording {}", primary.source, source);
    tx.disable_primary_view(&primary.source)?;
    ensure_primary_feed(tx, source).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_provider::{StaticProviderConfig, StaticSourceProvider};
    use std::time::Duration;

    fn registry(config: StaticProviderConfig) -> (FeedRegistry, Arc<StaticSourceProvider>) {
        let provider = Arc::new(StaticSourceProvider::new(config));
        (FeedRegistry::new(provider.clone()), provider)
    }

    fn with_bs(devices: usize) -> StaticProviderConfig {
        StaticProviderConfig::sample(devices).with_unavailable_group(0x0004, 0x4010, &["BS1"])
    }

    fn drain(rx: &mut broadcast::Receiver<FeedEvent>) -> Vec<FeedEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn id(provider: &StaticSourceProvider, name: &str) -> SourceId {
        provider.translate(name).unwrap()
    }

    fn primary_count(registry: &FeedRegistry) -> usize {
        registry.feeds().iter().filter(|f| f.primary_view).count()
    }

    #[tokio::test]
    async fn test_first_primary_allocates_one_device() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));
        let nhk = id(&provider, "NHK");
        let mut rx = registry.subscribe();

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.devices[0].state, SlotState::Active);
        assert_eq!(snapshot.devices[1].state, SlotState::Unallocated);
        assert_eq!(snapshot.primary_view().unwrap().source, nhk);
        assert_eq!(provider.stats(0).unwrap().allocations, 1);
        assert_eq!(
            drain(&mut rx),
            vec![FeedEvent::PrimaryViewVisibilityChanged { source: nhk, device: 0, visible: true }]
        );
    }

    #[tokio::test]
    async fn test_primary_switch_releases_old_device() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));
        let (nhk, etv) = (id(&provider, "NHK"), id(&provider, "ETV"));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        let mut rx = registry.subscribe();
        assert!(registry.try_start_primary_feed("ETV").await.unwrap());

        let primary = registry.primary_view().unwrap();
        assert_eq!(primary.source, etv);
        assert_eq!(primary.device, 1);
        assert!(!registry.devices()[0].is_allocated());
        assert_eq!(provider.stats(0).unwrap().releases, 1);
        assert_eq!(provider.stats(1).unwrap().allocations, 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                FeedEvent::PrimaryViewVisibilityChanged { source: nhk, device: 0, visible: false },
                FeedEvent::PrimaryViewVisibilityChanged { source: etv, device: 1, visible: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_primary_within_group_reuses_device() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_primary_feed("NHK2").await.unwrap());

        assert_eq!(registry.primary_view().unwrap().device, 0);
        let stats = provider.stats(0).unwrap();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.activations, 1);
        assert_eq!(provider.stats(1).unwrap().allocations, 0);
    }

    #[tokio::test]
    async fn test_repeated_request_is_silent() {
        let (mut registry, _provider) = registry(StaticProviderConfig::sample(2));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());

        let before = registry.snapshot();
        let mut rx = registry.subscribe();
        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        registry.stop_secondary_feed("NHK3").unwrap();
        registry.stop_recording_feed("NHK", "missing").unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.snapshot(), before);
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let (mut registry, _provider) = registry(StaticProviderConfig::sample(2));
        assert_eq!(
            registry.try_start_primary_feed("ZZZ").await,
            Err(FeedError::UnknownSource("ZZZ".to_string()))
        );
        assert!(registry.stop_secondary_feed("ZZZ").is_err());
        assert!(registry.find_feed("ZZZ").is_err());
        assert_eq!(registry.find_feed("NHK").unwrap(), None);
    }

    #[tokio::test]
    async fn test_secondary_promotion_swaps_views() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));
        let (nhk, etv) = (id(&provider, "NHK"), id(&provider, "ETV"));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        assert_eq!(registry.find_feed("ETV").unwrap().unwrap().device, 1);

        let mut rx = registry.subscribe();
        assert!(registry.try_start_primary_feed("ETV").await.unwrap());

        assert_eq!(registry.primary_view().unwrap().source, etv);
        let secondaries = registry.secondary_views();
        assert_eq!(secondaries.len(), 1);
        assert_eq!(secondaries[0].source, nhk);
        assert_eq!(primary_count(&registry), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                FeedEvent::SecondaryViewVisibilityChanged { source: etv, device: 1, visible: false },
                FeedEvent::PrimaryViewVisibilityChanged { source: nhk, device: 0, visible: false },
                FeedEvent::SecondaryViewVisibilityChanged { source: nhk, device: 0, visible: true },
                FeedEvent::PrimaryViewVisibilityChanged { source: etv, device: 1, visible: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_secondary_prefers_tuned_device() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));
        let nhk = id(&provider, "NHK");

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(!registry.try_start_secondary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("NHK2").await.unwrap());

        assert_eq!(registry.find_feed("NHK2").unwrap().unwrap().device, 0);
        assert_eq!(provider.stats(1).unwrap().allocations, 0);
        assert_eq!(registry.primary_view().unwrap().source, nhk);
    }

    #[tokio::test]
    async fn test_stop_secondary_releases_idle_device() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        assert!(registry.devices()[1].is_allocated());

        registry.stop_secondary_feed("ETV").unwrap();
        assert!(!registry.devices()[1].is_allocated());
        assert_eq!(provider.stats(1).unwrap().releases, 1);
        assert!(registry.devices()[0].is_allocated());

        // No-op the second time
        registry.stop_secondary_feed("ETV").unwrap();
        assert_eq!(provider.stats(1).unwrap().releases, 1);
    }

    #[tokio::test]
    async fn test_unreceivable_source_releases_device() {
        let (mut registry, provider) = registry(with_bs(2));
        let before = registry.snapshot();
        let mut rx = registry.subscribe();

        assert!(!registry.try_start_primary_feed("BS1").await.unwrap());

        let stats = provider.stats(0).unwrap();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(registry.snapshot(), before);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_failed_switch_restores_previous_state() {
        let (mut registry, provider) = registry(with_bs(2));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        let before = registry.snapshot();
        let mut rx = registry.subscribe();

        assert!(!registry.try_start_primary_feed("BS1").await.unwrap());

        assert_eq!(registry.snapshot(), before);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(provider.stats(0).unwrap().releases, 0);
        assert_eq!(provider.stats(1).unwrap().releases, 0);
    }

    #[tokio::test]
    async fn test_failed_takeover_restores_secondaries() {
        let (mut registry, provider) = registry(with_bs(1));
        let etv = id(&provider, "ETV");

        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        let before = registry.snapshot();
        let mut rx = registry.subscribe();

        // The only device is re-tuned to a group without signal, then back
        assert!(!registry.try_start_primary_feed("BS1").await.unwrap());

        assert_eq!(registry.snapshot(), before);
        assert_eq!(registry.secondary_views().len(), 1);
        assert_eq!(registry.secondary_views()[0].source, etv);
        assert!(drain(&mut rx).is_empty());
        let stats = provider.stats(0).unwrap();
        assert_eq!(stats.tuned, Some((0x7FE1, 0x7FE1)));
        assert_eq!(stats.activations, 3);
        assert_eq!(stats.releases, 0);
    }

    #[tokio::test]
    async fn test_abandoned_takeover_restores_secondaries() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(1).with_tune_delay(50));
        let etv = id(&provider, "ETV");

        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        let before = registry.snapshot();
        let mut rx = registry.subscribe();

        // Caller gives up while the device is being re-tuned
        let attempt = tokio::time::timeout(Duration::from_millis(10), registry.try_start_primary_feed("NTV")).await;
        assert!(attempt.is_err());

        assert_eq!(registry.snapshot(), before);
        assert_eq!(registry.secondary_views()[0].source, etv);
        assert_eq!(provider.stats(0).unwrap().tuned, Some((0x7FE1, 0x7FE1)));

        // The abandoned NTV read never lands
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.snapshot(), before);
        assert!(registry.find_feed("NTV").unwrap().is_none());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(provider.stats(0).unwrap().releases, 0);
    }

    #[tokio::test]
    async fn test_secondary_device_taken_for_primary() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(1));
        let (etv, ntv) = (id(&provider, "ETV"), id(&provider, "NTV"));

        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        let mut rx = registry.subscribe();
        assert!(registry.try_start_primary_feed("NTV").await.unwrap());

        assert_eq!(registry.primary_view().unwrap().source, ntv);
        assert!(registry.secondary_views().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![
                FeedEvent::SecondaryViewVisibilityChanged { source: etv, device: 0, visible: false },
                FeedEvent::PrimaryViewVisibilityChanged { source: ntv, device: 0, visible: true },
            ]
        );

        // A secondary view never takes the primary's device
        assert!(!registry.try_start_secondary_feed("ETV").await.unwrap());
        assert_eq!(registry.primary_view().unwrap().source, ntv);
    }

    #[tokio::test]
    async fn test_recording_without_primary_becomes_primary() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));
        let nhk = id(&provider, "NHK");
        let key = RecordingKey::from("job1");
        let mut rx = registry.subscribe();

        assert!(registry.try_start_recording_feed("NHK", "job1").await.unwrap());
        assert_eq!(
            drain(&mut rx),
            vec![
                FeedEvent::RecordingStateChanged { source: nhk, device: 0, key, active: true },
                FeedEvent::PrimaryViewVisibilityChanged { source: nhk, device: 0, visible: true },
            ]
        );

        // Same key twice fails, another key is fine
        assert!(!registry.try_start_recording_feed("NHK", "job1").await.unwrap());
        assert!(registry.try_start_recording_feed("NHK", "job2").await.unwrap());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(registry.find_feed("NHK").unwrap().unwrap().recordings.len(), 2);
    }

    #[tokio::test]
    async fn test_recording_keeps_device_allocated() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));

        assert!(registry.try_start_recording_feed("NHK", "job1").await.unwrap());
        assert!(registry.try_start_primary_feed("ETV").await.unwrap());

        assert!(registry.devices()[0].is_allocated());
        assert_eq!(registry.primary_view().unwrap().device, 1);
        assert_eq!(registry.recordings().len(), 1);

        registry.stop_recording_feed("NHK", "job1").unwrap();
        assert!(!registry.devices()[0].is_allocated());
        assert_eq!(provider.stats(0).unwrap().releases, 1);
        assert!(registry.recordings().is_empty());
    }

    #[tokio::test]
    async fn test_recording_preempts_primary() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(1));
        let (nhk, etv) = (id(&provider, "NHK"), id(&provider, "ETV"));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        let mut rx = registry.subscribe();
        assert!(registry.try_start_recording_feed("ETV", "job1").await.unwrap());

        assert_eq!(registry.primary_view().unwrap().source, etv);
        assert!(registry.find_feed("NHK").unwrap().is_none());
        assert_eq!(
            drain(&mut rx),
            vec![
                FeedEvent::PrimaryViewVisibilityChanged { source: nhk, device: 0, visible: false },
                FeedEvent::RecordingStateChanged {
                    source: etv,
                    device: 0,
                    key: RecordingKey::from("job1"),
                    active: true,
                },
                FeedEvent::PrimaryViewVisibilityChanged { source: etv, device: 0, visible: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_recording_never_preempts_recording() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(1));

        assert!(registry.try_start_recording_feed("NHK", "job1").await.unwrap());
        let before = registry.snapshot();
        let mut rx = registry.subscribe();

        assert!(!registry.try_start_recording_feed("ETV", "job2").await.unwrap());
        assert_eq!(registry.snapshot(), before);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(provider.stats(0).unwrap().activations, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_primary() {
        let (mut registry, _provider) = registry(with_bs(2).with_tune_delay(2));

        for name in ["NHK", "ETV", "NHK2", "BS1", "NTV", "ETV2", "TBS", "NHK"] {
            let _ = registry.try_start_primary_feed(name).await.unwrap();
            assert_eq!(primary_count(&registry), 1, "after {}", name);
            let _ = registry.try_start_secondary_feed("TBS2").await.unwrap();
            assert!(primary_count(&registry) <= 1);
            assert!(registry.snapshot().allocated() <= 2);
        }
    }

    #[tokio::test]
    async fn test_source_information_follows_feed() {
        let (mut registry, _provider) = registry(StaticProviderConfig::sample(2));

        assert!(registry.source_information("NHK").unwrap().is_none());
        assert!(registry.try_start_primary_feed("NHK").await.unwrap());

        let reader = registry.source_information("NHK").unwrap().unwrap();
        let info = reader.wait().await.unwrap();
        assert_eq!(info.name, "NHK");
        assert!(registry.source_information("ETV").unwrap().is_none());

        assert!(registry.refresh_source_information("NHK").unwrap());
        assert!(reader.is_cancelled());
        assert!(!registry.refresh_source_information("ETV").unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_releases_all_devices() {
        let (mut registry, provider) = registry(StaticProviderConfig::sample(2));

        assert!(registry.try_start_primary_feed("NHK").await.unwrap());
        assert!(registry.try_start_secondary_feed("ETV").await.unwrap());
        assert!(registry.try_start_recording_feed("NHK2", "job1").await.unwrap());
        let mut rx = registry.subscribe();

        registry.shutdown();

        assert!(registry.feeds().is_empty());
        assert_eq!(registry.snapshot().allocated(), 0);
        for stats in provider.all_stats() {
            assert_eq!(stats.releases, 1);
            assert!(!stats.allocated);
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| matches!(
            e,
            FeedEvent::RecordingStateChanged { active: false, .. }
        )));
    }
}
