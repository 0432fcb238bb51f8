//! Priority queue storage and the `QueueManager` facade.

mod manager;
mod memory;
mod persistent;
pub mod scorer;
mod state;
mod store;

pub use manager::{QueueError, QueueManager, QueueResult, QueueStatus, SendOptions, SystemStatus};
pub use memory::InMemoryQueueStore;
pub use persistent::{FileQueueStore, PersistenceError};
pub use state::{QueueLimits, QueueMetrics};
pub use store::QueueStore;
