//! The payload unit exchanged between producers and consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// A delayed message.
///
/// A message is addressed by `id`, delivered on `topic` and carries an opaque
/// `body`. All three fields must be non-empty for the message to be accepted
/// by a queue; see [`Message::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub body: String,
}

impl Message {
    /// Create a message with a producer-assigned id.
    pub fn new(id: impl Into<String>, topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            body: body.into(),
        }
    }

    /// Create a message whose id is assigned here.
    ///
    /// Uses UUIDv7 (time-ordered), so ids generated by one producer sort in
    /// creation order.
    pub fn with_generated_id(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Uuid::now_v7().to_string(), topic, body)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check the validity invariant: `id`, `topic` and `body` are non-empty.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.is_empty() {
            return Err(DomainError::validation("message id must not be empty"));
        }
        if self.topic.is_empty() {
            return Err(DomainError::validation("message topic must not be empty"));
        }
        if self.body.is_empty() {
            return Err(DomainError::validation("message body must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn complete_message_is_valid() {
        let msg = Message::new("j1", "email", "hi");
        assert!(msg.is_valid());
        assert_eq!(msg.validate(), Ok(()));
    }

    #[test]
    fn empty_fields_are_rejected_by_name() {
        let cases = [
            (Message::new("", "email", "hi"), "id"),
            (Message::new("j1", "", "hi"), "topic"),
            (Message::new("j1", "email", ""), "body"),
        ];

        for (msg, field) in cases {
            match msg.validate() {
                Err(DomainError::Validation(reason)) => assert!(
                    reason.contains(field),
                    "expected '{field}' in '{reason}'"
                ),
                other => panic!("expected validation error for empty {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = Message::with_generated_id("email", "hi");
        let b = Message::with_generated_id("email", "hi");
        assert!(a.is_valid());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serializes_with_plain_field_names() {
        let msg = Message::new("j1", "email", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "j1", "topic": "email", "body": "hi"})
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a message is valid exactly when no field is empty.
        #[test]
        fn validity_matches_non_empty_fields(
            id in ".{0,8}",
            topic in ".{0,8}",
            body in ".{0,8}",
        ) {
            let expected = !id.is_empty() && !topic.is_empty() && !body.is_empty();
            let msg = Message::new(id, topic, body);
            prop_assert_eq!(msg.is_valid(), expected);
        }
    }
}
