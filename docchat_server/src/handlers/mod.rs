pub mod analytics;
pub mod chat;
