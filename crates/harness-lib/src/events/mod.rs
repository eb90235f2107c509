//! PTP cloud events: wire model, filter algebra and the consumer client

mod consumer;
mod filter;
mod model;

pub use consumer::{ConsumerEventSource, EventConsumer, EventSource, EventWaitOptions};
pub use filter::EventFilter;
pub use model::{event_types, CloudEvent, EventData, EventValue, SyncState};
