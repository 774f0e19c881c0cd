//! Data models for chat messages and their wire records

mod message;
mod record;

pub use message::*;
pub use record::*;
