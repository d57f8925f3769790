pub mod cache;
pub mod queue;
pub mod report;

pub use cache::{Cache, CacheError};
pub use queue::{QueueError, TaskQueue};
pub use report::{SplitReport, split_report};
