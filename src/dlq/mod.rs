pub mod permanent;
pub mod queue;
pub mod types;
pub mod worker;

pub use permanent::{MemoryPermanentFailureStore, PermanentFailure, PermanentFailureStore};
pub use queue::DeadLetterQueue;
pub use types::{DlqConfig, DlqEntry, DlqHealth, FailureInfo, RetryOutcome};
pub use worker::{DlqWorker, RetryPassReport};
