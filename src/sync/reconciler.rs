//! Canonical message list for one open conversation.
//!
//! The list is always sorted by `created` ascending. Messages with equal
//! timestamps keep their arrival order, which is what a stable sort of
//! "append then sort" produces; insertion goes straight to that position.

use serde::{Deserialize, Serialize};

use crate::models::{ImageData, Message, MessageKey, MessageKind};

/// How two messages are judged to be the same message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityRule {
    /// Same sender and same `created` timestamp.
    #[default]
    SenderAndCreated,
    /// Compare store ids when both messages have one, otherwise fall back
    /// to sender and `created`. Distinguishes two stored messages sent by
    /// the same sender in the same millisecond.
    PreferStoreId,
}

impl IdentityRule {
    pub fn same(self, a: &Message, b: &Message) -> bool {
        match (self, a.id.as_deref(), b.id.as_deref()) {
            (IdentityRule::PreferStoreId, Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }
}

/// Result of [`ReconciliationState::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// An equal message is already present; nothing changed.
    Duplicate,
    /// The list changed and must be redrawn.
    Inserted { position: usize, is_now_last: bool },
}

impl InsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }

    /// Scroll decision for this insert given the current viewport.
    pub fn scrolls(&self, viewport_at_bottom: bool) -> bool {
        match self {
            InsertOutcome::Inserted { is_now_last, .. } => viewport_at_bottom && *is_now_last,
            InsertOutcome::Duplicate => false,
        }
    }
}

/// Result of [`ReconciliationState::attach_resolved_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached { position: usize },
    /// No message with that key.
    Absent,
    /// The message with that key is a text message.
    NotAnImage,
}

/// Ordered, deduplicated message list.
#[derive(Debug, Default)]
pub struct ReconciliationState {
    canonical: Vec<Message>,
    identity: IdentityRule,
}

impl ReconciliationState {
    pub fn new(identity: IdentityRule) -> Self {
        Self {
            canonical: Vec::new(),
            identity,
        }
    }

    /// Add a message unless an equal one is already present.
    pub fn insert(&mut self, message: Message) -> InsertOutcome {
        if self.contains(&message) {
            tracing::debug!(
                "Duplicate message from {} at {}",
                message.sender.sender_id,
                message.created
            );
            return InsertOutcome::Duplicate;
        }

        let position = self
            .canonical
            .partition_point(|m| m.created <= message.created);
        self.canonical.insert(position, message);

        InsertOutcome::Inserted {
            position,
            is_now_last: position + 1 == self.canonical.len(),
        }
    }

    /// Attach a downloaded bitmap in place. Never moves the message.
    pub fn attach_resolved_image(&mut self, key: &MessageKey, image: ImageData) -> AttachOutcome {
        let Some(position) = self.position_of_key(key) else {
            tracing::debug!("Resolved image for absent message {:?}, ignoring", key);
            return AttachOutcome::Absent;
        };

        match &mut self.canonical[position].kind {
            MessageKind::Image { preview, .. } => {
                *preview = Some(image);
                AttachOutcome::Attached { position }
            }
            MessageKind::Text(_) => AttachOutcome::NotAnImage,
        }
    }

    /// True iff the viewport is at the bottom and `inserted` is the last message.
    pub fn should_auto_scroll(&self, inserted: &Message, viewport_at_bottom: bool) -> bool {
        viewport_at_bottom
            && self
                .canonical
                .last()
                .is_some_and(|last| self.identity.same(last, inserted))
    }

    pub fn contains(&self, message: &Message) -> bool {
        self.canonical.iter().any(|m| self.identity.same(m, message))
    }

    pub fn messages(&self) -> &[Message] {
        &self.canonical
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    fn position_of_key(&self, key: &MessageKey) -> Option<usize> {
        self.canonical.iter().position(|m| {
            if m.sender.sender_id != key.sender_id || m.created != key.created {
                return false;
            }
            match (self.identity, m.id.as_deref(), key.id.as_deref()) {
                (IdentityRule::PreferStoreId, Some(x), Some(y)) => x == y,
                _ => true,
            }
        })
    }
}
