//! Deterministic queue key naming.
//!
//! Every message type owns a fixed family of list keys, `{TypeName}.{role}`.
//! These strings are the only addressing mechanism between producers and
//! workers, so they must stay byte-for-byte stable across releases: changing
//! them strands whatever is already queued under the old names.

use std::fmt;

/// Prefix reserved for temporary reply queues.
pub const TEMP_QUEUE_PREFIX: &str = "mq:tmp:";

/// Role a queue plays for its message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Work queue polled by the type's workers.
    Inbound,
    /// Polled before `Inbound` when priority polling is enabled, after it otherwise.
    Priority,
    /// Bounded "last N" queue of handler replies.
    Outbound,
    /// Terminal queue of envelopes that exhausted their retries.
    DeadLetter,
    /// Broadcast channel for the type.
    Topic,
}

impl QueueRole {
    /// All roles, in a stable order.
    pub const ALL: [QueueRole; 5] = [
        QueueRole::Inbound,
        QueueRole::Priority,
        QueueRole::Outbound,
        QueueRole::DeadLetter,
        QueueRole::Topic,
    ];

    /// Key suffix for this role, without the leading dot.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            QueueRole::Inbound => "inq",
            QueueRole::Priority => "priorityq",
            QueueRole::Outbound => "outq",
            QueueRole::DeadLetter => "dlq",
            QueueRole::Topic => "topic",
        }
    }

    /// Inverse of [`QueueRole::suffix`].
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.suffix() == suffix)
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Rejected message type names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueNameError {
    #[error("message type name must not be empty")]
    Empty,
    #[error("message type name {0:?} uses the reserved prefix \"mq:tmp:\"")]
    Reserved(String),
}

fn validate(type_name: &str) -> Result<(), QueueNameError> {
    if type_name.is_empty() {
        return Err(QueueNameError::Empty);
    }
    if type_name.starts_with(TEMP_QUEUE_PREFIX) {
        return Err(QueueNameError::Reserved(type_name.to_string()));
    }
    Ok(())
}

/// Key of the `role` queue for `type_name`.
///
/// # Errors
///
/// Returns `QueueNameError` if `type_name` is empty or reserved.
pub fn queue_name(type_name: &str, role: QueueRole) -> Result<String, QueueNameError> {
    validate(type_name)?;
    Ok(format!("{type_name}.{}", role.suffix()))
}

/// Splits a queue key back into its type name and role.
///
/// Returns `None` for keys not produced by [`queue_name`], including
/// temporary queues.
#[must_use]
pub fn split_queue_name(queue: &str) -> Option<(&str, QueueRole)> {
    let (type_name, suffix) = queue.rsplit_once('.')?;
    let role = QueueRole::from_suffix(suffix)?;
    validate(type_name).ok()?;
    Some((type_name, role))
}

/// A fresh, uniquely named queue for one-off replies.
#[must_use]
pub fn temp_queue_name() -> String {
    format!("{TEMP_QUEUE_PREFIX}{}", uuid::Uuid::new_v4())
}

/// All queue keys for one message type, computed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub type_name: String,
    /// `{Type}.inq`, the work queue.
    pub inbound: String,
    /// `{Type}.priorityq`, for envelopes published with a priority.
    pub priority: String,
    /// `{Type}.outq`, where replies go when nobody asked for them.
    pub outbound: String,
    /// `{Type}.dlq`, for envelopes that ran out of attempts.
    pub dead_letter: String,
    /// `{Type}.topic`, the notification channel name.
    pub topic: String,
}

impl QueueNames {
    /// # Errors
    ///
    /// Returns `QueueNameError` if `type_name` is empty or reserved.
    pub fn new(type_name: &str) -> Result<Self, QueueNameError> {
        validate(type_name)?;
        let name = |role: QueueRole| format!("{type_name}.{}", role.suffix());
        Ok(Self {
            type_name: type_name.to_string(),
            inbound: name(QueueRole::Inbound),
            priority: name(QueueRole::Priority),
            outbound: name(QueueRole::Outbound),
            dead_letter: name(QueueRole::DeadLetter),
            topic: name(QueueRole::Topic),
        })
    }

    /// Key for `role`.
    #[must_use]
    pub fn get(&self, role: QueueRole) -> &str {
        match role {
            QueueRole::Inbound => &self.inbound,
            QueueRole::Priority => &self.priority,
            QueueRole::Outbound => &self.outbound,
            QueueRole::DeadLetter => &self.dead_letter,
            QueueRole::Topic => &self.topic,
        }
    }

    /// Where a publish of an envelope with `priority` lands.
    #[must_use]
    pub fn publish_target(&self, priority: i64) -> &str {
        if priority > 0 {
            &self.priority
        } else {
            &self.inbound
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn naming_is_deterministic() {
        let a = queue_name("Order", QueueRole::Inbound).unwrap();
        let b = queue_name("Order", QueueRole::Inbound).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "Order.inq");
    }

    #[test]
    fn exact_key_format_is_stable() {
        assert_eq!(queue_name("Order", QueueRole::Outbound).unwrap(), "Order.outq");
        assert_eq!(queue_name("Order", QueueRole::DeadLetter).unwrap(), "Order.dlq");
        assert_eq!(queue_name("Order", QueueRole::Topic).unwrap(), "Order.topic");
        assert_eq!(queue_name("Order", QueueRole::Priority).unwrap(), "Order.priorityq");
    }

    #[test]
    fn roles_never_collide() {
        assert_ne!(
            queue_name("Order", QueueRole::Inbound).unwrap(),
            queue_name("Order", QueueRole::DeadLetter).unwrap()
        );

        let types = ["Order", "Order.inq", "order", "Incr", "a.b"];
        let mut seen = HashSet::new();
        for t in types {
            for role in QueueRole::ALL {
                assert!(seen.insert(queue_name(t, role).unwrap()), "{t} {role}");
            }
        }
    }

    #[test]
    fn empty_and_reserved_names_are_rejected() {
        assert_eq!(queue_name("", QueueRole::Inbound), Err(QueueNameError::Empty));
        assert!(matches!(
            queue_name("mq:tmp:x", QueueRole::Inbound),
            Err(QueueNameError::Reserved(_))
        ));
    }

    #[test]
    fn split_inverts_naming() {
        for role in QueueRole::ALL {
            let key = queue_name("billing.Invoice", role).unwrap();
            assert_eq!(split_queue_name(&key), Some(("billing.Invoice", role)));
        }
        assert_eq!(split_queue_name("Order"), None);
        assert_eq!(split_queue_name("Order.bogus"), None);
        assert_eq!(split_queue_name(&temp_queue_name()), None);
    }

    #[test]
    fn bundle_matches_free_function() {
        let names = QueueNames::new("Incr").unwrap();
        for role in QueueRole::ALL {
            assert_eq!(names.get(role), queue_name("Incr", role).unwrap());
        }
        assert_eq!(names.publish_target(0), "Incr.inq");
        assert_eq!(names.publish_target(5), "Incr.priorityq");
    }

    #[test]
    fn temp_queues_are_unique() {
        let a = temp_queue_name();
        assert!(a.starts_with(TEMP_QUEUE_PREFIX));
        assert_ne!(a, temp_queue_name());
    }
}
