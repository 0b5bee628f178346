//! Multi-sourced instance registry.

mod holder;
mod sourced;

pub use holder::{HolderChange, MultiSourcedDataHolder, SourcePriority};
pub use sourced::SourcedEurekaRegistry;
