//! Core types for the interest client.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Immutable identifier of a service instance.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        InstanceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        InstanceId(s.to_string())
    }
}

/// Lifecycle status reported by an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    #[default]
    Unknown,
}

/// A registered service instance.
///
/// Values are snapshots: an update produces a new `InstanceInfo` and the
/// registry replaces the stored copy, nothing is mutated in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub app: String,
    pub app_group: Option<String>,
    pub vip_address: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl InstanceInfo {
    /// Create an instance of `app` with default attributes.
    pub fn new(id: impl Into<InstanceId>, app: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app: app.into(),
            app_group: None,
            vip_address: None,
            hostname: None,
            port: None,
            status: InstanceStatus::Up,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_app_group(mut self, group: impl Into<String>) -> Self {
        self.app_group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_vip_address(mut self, vip: impl Into<String>) -> Self {
        self.vip_address = Some(vip.into());
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.hostname = Some(hostname.into());
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        InstanceId(s)
    }
}

/// Kind of data origin, used only to rank copies of the same instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Registered by a local actor in this process.
    Local,
    /// Received through server-to-server replication.
    Replicated,
    /// Received through an interest subscription channel.
    Interested,
}

impl Origin {
    pub const ALL: [Origin; 3] = [Origin::Local, Origin::Replicated, Origin::Interested];
}

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a data origin.
///
/// Two sources are equal iff their ids are equal. Every call to
/// [`Source::new`] yields a fresh id, so each channel instance gets its own
/// source even when channels share a name.
#[derive(Clone, Serialize, Deserialize)]
pub struct Source {
    pub origin: Origin,
    pub name: String,
    pub id: u64,
}

impl Source {
    pub fn new(origin: Origin, name: impl Into<String>) -> Self {
        Self {
            origin,
            name: name.into(),
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::new(Origin::Local, name)
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Source {}

impl Hash for Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({:?}:{}#{})", self.origin, self.name, self.id)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// A change to the set of instances matching an interest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeNotification {
    Add(Arc<InstanceInfo>),
    Modify(Arc<InstanceInfo>),
    Delete(InstanceId),
    /// Start of a burst of notifications delivered as one unit.
    BufferStart,
    /// End of the burst opened by the last `BufferStart`.
    BufferEnd,
}

impl ChangeNotification {
    /// True for Add/Modify/Delete, false for buffer markers.
    pub fn is_data(&self) -> bool {
        !matches!(self, ChangeNotification::BufferStart | ChangeNotification::BufferEnd)
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            ChangeNotification::Add(info) | ChangeNotification::Modify(info) => Some(&info.id),
            ChangeNotification::Delete(id) => Some(id),
            _ => None,
        }
    }

    /// The instance carried by an Add or Modify.
    pub fn data(&self) -> Option<&InstanceInfo> {
        match self {
            ChangeNotification::Add(info) | ChangeNotification::Modify(info) => Some(info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_equality_by_id() {
        let a = Source::new(Origin::Interested, "channel");
        let b = Source::new(Origin::Interested, "channel");
        assert_ne!(a, b);

        let mut renamed = a.clone();
        renamed.name = "other".to_string();
        renamed.origin = Origin::Local;
        assert_eq!(a, renamed);
    }

    #[test]
    fn test_instance_update_is_new_value() {
        let original = InstanceInfo::new("i-1", "discovery");
        let updated = original.clone().with_status(InstanceStatus::OutOfService);

        assert_eq!(original.status, InstanceStatus::Up);
        assert_eq!(updated.status, InstanceStatus::OutOfService);
        assert_eq!(original.id, updated.id);
    }

    #[test]
    fn test_notification_accessors() {
        let info = Arc::new(InstanceInfo::new("i-1", "zuul"));
        let add = ChangeNotification::Add(info.clone());
        assert!(add.is_data());
        assert_eq!(add.instance_id(), Some(&InstanceId::from("i-1")));
        assert_eq!(add.data().map(|i| i.app.as_str()), Some("zuul"));

        assert!(!ChangeNotification::BufferStart.is_data());
        assert!(ChangeNotification::BufferEnd.instance_id().is_none());

        let delete = ChangeNotification::Delete(InstanceId::from("i-1"));
        assert!(delete.data().is_none());
        assert!(delete.is_data());
    }
}
