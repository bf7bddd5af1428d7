//! Tuner and feed arbitration core.
//!
//! A [`FeedRegistry`] distributes a small, fixed set of tuner devices among
//! competing requests: one primary view, any number of secondary views and
//! any number of recordings. Tuning a device makes every source of the same
//! broadcast group receivable, so requests share devices whenever possible.
//!
//! Hardware access goes through a [`SourceProvider`]; [`StaticSourceProvider`]
//! is a configuration-driven implementation.

pub mod device;
pub mod error;
pub mod event;
pub mod feed;
pub mod provider;
pub mod registry;
pub mod source;
pub mod static_provider;
pub mod task;
pub mod transaction;

pub use device::{DeviceSlot, SlotState};
pub use error::{FeedError, ProviderError};
pub use event::FeedEvent;
pub use feed::{Feed, FeedView};
pub use provider::SourceProvider;
pub use registry::{DeviceStatus, FeedRegistry, RegistrySnapshot};
pub use source::{RecordingKey, SourceId, SourceInformation};
pub use static_provider::{StaticProviderConfig, StaticSourceProvider};
pub use task::CancellableTask;
pub use transaction::FeedTransaction;
