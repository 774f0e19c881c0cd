//! Remote change application: decide what a feed event means for the canonical list

use url::Url;

use super::reconciler::ReconciliationState;
use crate::models::{ChangeEvent, ChangeKind, Message};

/// What the session must do with one change-feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeAction {
    /// Insert right away.
    Insert(Message),
    /// Fetch the image first, then insert the message with the bitmap attached.
    Resolve { message: Message, url: Url },
    /// Nothing to do.
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// `Modified` / `Removed`; the conversation is append-only.
    NotAnAddition,
    /// Record could not be turned into a message.
    Malformed(String),
    /// Already in the canonical list.
    AlreadyPresent,
}

/// Classify a change-feed event against the current state.
pub fn classify(event: &ChangeEvent, state: &ReconciliationState) -> ChangeAction {
    if event.kind != ChangeKind::Added {
        return ChangeAction::Ignore(IgnoreReason::NotAnAddition);
    }

    let message = match event.to_message() {
        Ok(m) => m,
        Err(e) => return ChangeAction::Ignore(IgnoreReason::Malformed(e.to_string())),
    };

    if state.contains(&message) {
        return ChangeAction::Ignore(IgnoreReason::AlreadyPresent);
    }

    match message.pending_download().cloned() {
        Some(url) => ChangeAction::Resolve { message, url },
        None => ChangeAction::Insert(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRecord, Sender};

    fn added(id: &str, sender: &str, created: i64, content: Option<&str>, image_ref: Option<&str>) -> ChangeEvent {
        ChangeEvent::added(
            id,
            &MessageRecord {
                sender_id: sender.to_string(),
                display_name: sender.to_string(),
                created,
                content: content.map(String::from),
                image_ref: image_ref.map(String::from),
            },
        )
    }

    #[test]
    fn test_text_added_inserts() {
        let state = ReconciliationState::default();
        let ev = added("d1", "a", 100, Some("hi"), None);
        match classify(&ev, &state) {
            ChangeAction::Insert(m) => {
                assert_eq!(m.created, 100);
                assert_eq!(m.id.as_deref(), Some("d1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_image_added_needs_resolution() {
        let state = ReconciliationState::default();
        let ev = added("d2", "b", 5, None, Some("https://files.example.com/x"));
        match classify(&ev, &state) {
            ChangeAction::Resolve { message, url } => {
                assert_eq!(url.as_str(), "https://files.example.com/x");
                assert_eq!(message.created, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_modified_and_removed_ignored() {
        let state = ReconciliationState::default();
        for kind in [ChangeKind::Modified, ChangeKind::Removed] {
            let mut ev = added("d1", "a", 1, Some("x"), None);
            ev.kind = kind;
            assert_eq!(
                classify(&ev, &state),
                ChangeAction::Ignore(IgnoreReason::NotAnAddition)
            );
        }
    }

    #[test]
    fn test_malformed_dropped() {
        let state = ReconciliationState::default();
        let ev = ChangeEvent {
            kind: ChangeKind::Added,
            document_id: "d1".to_string(),
            record: serde_json::Map::new(),
        };
        assert!(matches!(
            classify(&ev, &state),
            ChangeAction::Ignore(IgnoreReason::Malformed(_))
        ));
    }

    #[test]
    fn test_present_image_not_downloaded_again() {
        let mut state = ReconciliationState::default();
        let url = url::Url::parse("https://files.example.com/x").unwrap();
        state.insert(Message::image(Sender::new("b", "b"), 5, Some(vec![1].into()), Some(url)));

        let ev = added("d2", "b", 5, None, Some("https://files.example.com/x"));
        assert_eq!(
            classify(&ev, &state),
            ChangeAction::Ignore(IgnoreReason::AlreadyPresent)
        );
    }
}
