//! Notifications published when a feed transaction commits.

use std::fmt;

use serde::Serialize;

use crate::source::{RecordingKey, SourceId};

/// A committed change of a feed's view or recording state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    PrimaryViewVisibilityChanged {
        source: SourceId,
        device: usize,
        visible: bool,
    },
    SecondaryViewVisibilityChanged {
        source: SourceId,
        device: usize,
        visible: bool,
    },
    RecordingStateChanged {
        source: SourceId,
        device: usize,
        key: RecordingKey,
        active: bool,
    },
}

impl FeedEvent {
    pub fn source(&self) -> &SourceId {
        match self {
            FeedEvent::PrimaryViewVisibilityChanged { source, .. }
            | FeedEvent::SecondaryViewVisibilityChanged { source, .. }
            | FeedEvent::RecordingStateChanged { source, .. } => source,
        }
    }

    pub fn device(&self) -> usize {
        match self {
            FeedEvent::PrimaryViewVisibilityChanged { device, .. }
            | FeedEvent::SecondaryViewVisibilityChanged { device, .. }
            | FeedEvent::RecordingStateChanged { device, .. } => *device,
        }
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

impl fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedEvent::PrimaryViewVisibilityChanged { source, device, visible } => {
                write!(f, "primary view {} {} (device {})", on_off(*visible), source, device)
            }
            FeedEvent::SecondaryViewVisibilityChanged { source, device, visible } => {
                write!(f, "secondary view {} {} (device {})", on_off(*visible), source, device)
            }
            FeedEvent::RecordingStateChanged { source, device, key, active } => {
                write!(f, "recording {} {} {} (device {})", key, on_off(*active), source, device)
            }
        }
    }
}
