//! Interests and the index layer that turns them into notification streams.
//!
//! - [`Interest`]: canonical predicate over instances, closed under union.
//! - [`IndexRegistry`]: one live index per distinct interest; new
//!   subscribers get a snapshot of current matches, then live changes.
//! - [`BatchingRegistry`]: per-source burst detection feeding
//!   `BufferStart`/`BufferEnd` markers.
//!
//! # Example
//!
//! ```ignore
//! let stream = registry.for_interest(&Interest::application("zuul"))?;
//! for notification in stream.drain_data() {
//!     match notification {
//!         ChangeNotification::Add(info) => println!("up: {}", info.id),
//!         ChangeNotification::Delete(id) => println!("gone: {id}"),
//!         _ => {}
//!     }
//! }
//! ```

mod batching;
mod index;
mod interest;
mod stream;

pub use batching::{BatchTransition, BatchingRegistry, Quiescence};
pub use index::IndexRegistry;
pub use interest::{Interest, InterestSet};
pub use stream::{NotificationStream, SubscriptionId};
