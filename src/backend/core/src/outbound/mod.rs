//! Outbound delivery: bounded retries with fixed backoff, then dead-letter.
//!
//! ```rust,ignore
//! let queue = OutboundDeliveryQueue::new(
//!     delivery_fn(|channel, channel_id, text, thread_id| async move {
//!         send_to_channel(&channel, &channel_id, &text, thread_id.as_deref()).await
//!     }),
//!     OutboundQueueConfig::default(),
//!     None,
//! );
//! queue.enqueue("slack", "C0123", "deploy finished", None);
//! ```

pub mod job;
pub mod journal;
pub mod queue;

pub use job::{OutboundJob, OutboundSnapshot};
pub use journal::{OutboundJournal, RedisJournalConfig, RedisOutboundJournal};
pub use queue::{
    delivery_fn, DeliveryFn, DeliveryStats, FnDelivery, OutboundDeliveryQueue, OutboundQueueConfig,
    StepOutcome, SENT_PREFIX,
};
