pub mod error;
pub mod kst;
pub mod logpath;
pub mod models;
pub mod record;

pub use error::CoreError;
pub use models::{
  ChatMessage, CollectionInfo, ModelFamily, ReasoningLevel, RetrievedDoc, SourceData, Usage,
};
pub use record::{
  ErrorInfo, InteractionRecord, MessageType, Performance, RetrievalInfo, SessionUpdate,
};
