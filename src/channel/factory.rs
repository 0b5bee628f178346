//! Channel construction.

use crate::channel::{ChannelContext, InterestChannel};
use crate::config::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};

/// Creates fresh channels for the client. Each call must return a new,
/// idle channel with a unique id and its own source.
pub trait ChannelFactory: Send + Sync {
    fn new_channel(&self) -> InterestChannel;
}

/// Factory producing [`InterestChannel`]s over one transport.
pub struct InterestChannelFactory {
    context: ChannelContext,
    name: String,
    evict_on_close: bool,
    next_id: AtomicU64,
}

impl InterestChannelFactory {
    pub fn new(context: ChannelContext, config: &ClientConfig) -> Self {
        Self {
            context,
            name: config.channel_name.clone(),
            evict_on_close: config.evict_on_channel_failure,
            next_id: AtomicU64::new(0),
        }
    }
}

impl ChannelFactory for InterestChannelFactory {
    fn new_channel(&self) -> InterestChannel {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        InterestChannel::new(id, &self.name, self.context.clone(), self.evict_on_close)
    }
}
