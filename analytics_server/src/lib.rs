pub mod conversation;
pub mod error;
pub mod logging;
pub mod retention;
pub mod scheduler;
pub mod sessions;
pub mod stats;

pub use conversation::{Conversation, ConversationStore};
pub use error::AnalyticsError;
pub use logging::{LoggingConfig, LoggingPipeline, LoggingStats};
pub use scheduler::{JobOutcome, Scheduler};
pub use sessions::{ChatSessionRow, SessionStore};
pub use stats::{AggregationOutcome, CollectionRollup, StatisticsService};
