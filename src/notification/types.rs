use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;

bitflags! {
    /// Delivery channels a message is eligible for.
    ///
    /// An empty set means the message has no target and is never published.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Target: u32 {
        const EMAIL = 1;
        const SMS = 1 << 1;
        const MOBILE_PUSH = 1 << 2;
        const WEB_PUSH = 1 << 3;
        const CUSTOM = 1 << 4;
    }
}

impl Default for Target {
    fn default() -> Self {
        Target::empty()
    }
}

/// Priority levels for queued messages.
///
/// Only the store looks at the priority; sinks and publishers always run in
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Priority {
    /// Dispatched only when nothing else is waiting
    Low,
    /// Normal priority (default)
    #[default]
    Default,
    /// Dispatched before any Default or Low message
    High,
}

impl Priority {
    /// Get numeric value for priority comparison
    pub fn as_weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Default => 2,
            Priority::High => 3,
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Default => "default",
            Priority::High => "high",
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_weight().cmp(&other.as_weight())
    }
}

/// A single addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Channel-specific address (mail address, phone number, device token...)
    pub address: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    /// Publisher-interpreted role, e.g. "to", "cc" or "bcc"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            full_name: None,
            tag: None,
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Check whether this recipient carries the given tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }
}

/// A notification waiting to be delivered by one or more publishers.
///
/// The id is assigned by the store when the message is added and can only be
/// set once. Everything else is freely mutable until the message is queued;
/// afterwards only sinks touch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    pub priority: Priority,
    pub target: Target,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a builder for a new message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// The store-assigned id, if the message has been queued
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    /// Assign the message id. Fails if an id is already present.
    pub fn assign_id(&mut self, id: impl Into<String>) -> Result<(), NotifyError> {
        if let Some(existing) = &self.id {
            return Err(NotifyError::IdAlreadyAssigned {
                id: existing.clone(),
            });
        }
        self.id = Some(id.into());
        Ok(())
    }

    pub fn has_recipients(&self) -> bool {
        !self.recipients.is_empty()
    }

    /// Recipients carrying the given tag, in insertion order
    pub fn recipients_tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Recipient> {
        self.recipients.iter().filter(move |r| r.has_tag(tag))
    }

    /// Check the message is acceptable for queuing
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.recipients.is_empty() {
            return Err(NotifyError::Validation(
                "message must have at least one recipient".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating messages
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    priority: Priority,
    target: Target,
    recipients: Vec<Recipient>,
    subject: Option<String>,
    data: serde_json::Value,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the target channels
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Add a recipient
    pub fn with_recipient(mut self, recipient: Recipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    /// Add several recipients, keeping their order
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = Recipient>) -> Self {
        self.recipients.extend(recipients);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Set the payload from a serializable value
    pub fn with_data_from<T: Serialize>(mut self, data: &T) -> Result<Self, serde_json::Error> {
        self.data = serde_json::to_value(data)?;
        Ok(self)
    }

    /// Build the message. The id stays unassigned until the message is added.
    pub fn build(self) -> Message {
        Message {
            id: None,
            priority: self.priority,
            target: self.target,
            recipients: self.recipients,
            subject: self.subject,
            data: self.data,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let message = Message::builder()
            .with_priority(Priority::High)
            .with_target(Target::EMAIL | Target::SMS)
            .with_recipient(Recipient::new("a@example.com").with_full_name("Ann").with_tag("to"))
            .with_subject("Welcome")
            .with_data(json!({"body": "hello"}))
            .build();

        assert!(message.id().is_none());
        assert_eq!(message.priority, Priority::High);
        assert!(message.target.contains(Target::EMAIL));
        assert!(message.target.contains(Target::SMS));
        assert_eq!(message.recipients.len(), 1);
        assert_eq!(message.subject.as_deref(), Some("Welcome"));
    }

    #[test]
    fn test_assign_id_once() {
        let mut message = Message::builder().build();

        message.assign_id("first").unwrap();
        assert_eq!(message.id(), Some("first"));

        let err = message.assign_id("second").unwrap_err();
        assert!(matches!(err, NotifyError::IdAlreadyAssigned { ref id } if id == "first"));
        assert_eq!(message.id(), Some("first"));
    }

    #[test]
    fn test_validate_requires_recipient() {
        let message = Message::builder().with_target(Target::EMAIL).build();
        assert!(matches!(message.validate(), Err(NotifyError::Validation(_))));

        let message = Message::builder()
            .with_recipient(Recipient::new("+15550100"))
            .build();
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Default);
        assert!(Priority::Default > Priority::Low);
        assert_eq!(Priority::default(), Priority::Default);
    }

    #[test]
    fn test_target_intersection() {
        let capability = Target::EMAIL | Target::WEB_PUSH;
        assert!(capability.intersects(Target::EMAIL));
        assert!(!capability.intersects(Target::SMS | Target::CUSTOM));
        assert!(Target::default().is_empty());
    }

    #[test]
    fn test_recipients_tagged() {
        let message = Message::builder()
            .with_recipients([
                Recipient::new("to@example.com").with_tag("to"),
                Recipient::new("cc@example.com").with_tag("cc"),
                Recipient::new("to2@example.com").with_tag("to"),
            ])
            .build();

        let to: Vec<_> = message.recipients_tagged("to").map(|r| r.address.as_str()).collect();
        assert_eq!(to, vec!["to@example.com", "to2@example.com"]);
    }

    #[test]
    fn test_message_serialization() {
        let mut message = Message::builder()
            .with_target(Target::SMS)
            .with_recipient(Recipient::new("+15550100"))
            .build();
        message.assign_id("abc").unwrap();

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["target"], "SMS");
        assert_eq!(json["priority"], "Default");
        assert!(json["recipients"][0].get("tag").is_none());
    }
}
