//! Message reconciliation core
//!
//! Keeps one ordered, deduplicated message list per conversation and
//! decides how remote change events are applied to it.

mod change;
mod error;
mod reconciler;

pub use change::{classify, ChangeAction, IgnoreReason};
pub use error::SyncError;
pub use reconciler::{AttachOutcome, IdentityRule, ReconciliationState};
