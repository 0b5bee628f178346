//! Interest predicates and their union algebra.

use crate::types::{InstanceId, InstanceInfo};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// A predicate selecting a subset of registry instances.
///
/// Values are always canonical: composites never nest, never contain
/// `FullRegistry`, never have exactly one member, and hold no duplicates.
/// Structural equality therefore equals set equality over the flattened
/// members, and [`Interest::union`] is associative, commutative and
/// idempotent.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Interest {
    /// Every instance in the registry.
    FullRegistry,
    /// Instances of one application.
    Application(String),
    /// Instances belonging to an application group.
    ApplicationGroup(String),
    /// Instances registered under a vip address.
    Vip(String),
    /// A single instance.
    Instance(InstanceId),
    /// Union of its members.
    Composite(InterestSet),
}

/// Flattened member set of a composite interest.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct InterestSet(BTreeSet<Interest>);

impl InterestSet {
    pub fn iter(&self) -> impl Iterator<Item = &Interest> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Interest {
    pub fn application(name: impl Into<String>) -> Self {
        Interest::Application(name.into())
    }

    pub fn application_group(name: impl Into<String>) -> Self {
        Interest::ApplicationGroup(name.into())
    }

    pub fn vip(address: impl Into<String>) -> Self {
        Interest::Vip(address.into())
    }

    pub fn instance(id: impl Into<InstanceId>) -> Self {
        Interest::Instance(id.into())
    }

    /// Interest matching nothing.
    pub fn empty() -> Self {
        Interest::Composite(InterestSet::default())
    }

    /// Canonical union of `interests`.
    pub fn composite<I>(interests: I) -> Self
    where
        I: IntoIterator<Item = Interest>,
    {
        let mut members = BTreeSet::new();
        for interest in interests {
            match interest {
                Interest::FullRegistry => return Interest::FullRegistry,
                Interest::Composite(set) => members.extend(set.0),
                atom => {
                    members.insert(atom);
                }
            }
        }

        if members.len() == 1 {
            if let Some(only) = members.pop_first() {
                return only;
            }
        }
        Interest::Composite(InterestSet(members))
    }

    #[must_use]
    pub fn union(&self, other: &Interest) -> Interest {
        Interest::composite([self.clone(), other.clone()])
    }

    /// Flattened members; an atom is its own single member.
    pub fn members(&self) -> Vec<&Interest> {
        match self {
            Interest::Composite(set) => set.iter().collect(),
            atom => vec![atom],
        }
    }

    /// True if every instance selected by `other` is selected by `self`
    /// on the member level.
    pub fn contains(&self, other: &Interest) -> bool {
        if *self == Interest::FullRegistry {
            return true;
        }
        let mine = self.members();
        other.members().iter().all(|member| mine.contains(member))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Interest::Composite(set) if set.is_empty())
    }

    pub fn matches(&self, info: &InstanceInfo) -> bool {
        match self {
            Interest::FullRegistry => true,
            Interest::Application(app) => info.app == *app,
            Interest::ApplicationGroup(group) => info.app_group.as_deref() == Some(group.as_str()),
            Interest::Vip(vip) => info.vip_address.as_deref() == Some(vip.as_str()),
            Interest::Instance(id) => info.id == *id,
            Interest::Composite(set) => set.iter().any(|member| member.matches(info)),
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::FullRegistry => write!(f, "*"),
            Interest::Application(app) => write!(f, "app:{app}"),
            Interest::ApplicationGroup(group) => write!(f, "group:{group}"),
            Interest::Vip(vip) => write!(f, "vip:{vip}"),
            Interest::Instance(id) => write!(f, "instance:{id}"),
            Interest::Composite(set) => {
                write!(f, "[")?;
                for (i, member) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{member}")?;
                }
                write!(f, "]")
            }
        }
    }
}
