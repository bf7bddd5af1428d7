//! Source provider contract.
//!
//! The provider is the only component that touches the physical tuners. The
//! registry reaches it exclusively through a [`DeviceSlot`](crate::device::DeviceSlot).

use crate::error::ProviderError;
use crate::source::{SourceId, SourceInformation};
use crate::task::CancellableTask;

/// Access to a fixed set of tuner devices and the sources they can receive.
pub trait SourceProvider: Send + Sync {
    /// Number of devices. Fixed for the provider's lifetime.
    fn device_count(&self) -> usize;

    /// Open the device with the given 0-based index.
    fn allocate_device(&self, index: usize) -> Result<(), ProviderError>;

    /// Close a device previously opened with [`allocate_device`](Self::allocate_device).
    fn release_device(&self, index: usize);

    /// Tune a device to the group containing `source`.
    ///
    /// The task reports every source receivable on the device without further
    /// tuning. An empty list means the group could not be received.
    fn activate(&self, index: usize, source: &SourceId) -> CancellableTask<Vec<SourceId>>;

    /// Resolve a user-facing source name.
    fn translate(&self, name: &str) -> Option<SourceId>;

    /// Start reading descriptive metadata for a source received on a device.
    fn source_information(&self, index: usize, source: &SourceId) -> CancellableTask<SourceInformation>;

    /// Forget any metadata cached for the device.
    fn refresh_source_informations(&self, index: usize);
}
