//! Named logical channels over a broker connection.

use crate::message::EntityName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker entity a link is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPath {
    /// Point-to-point queue (send and receive)
    Queue { name: EntityName },
    /// Topic (send only, fans out to subscriptions)
    Topic { name: EntityName },
    /// Subscription of a topic (receive only)
    Subscription {
        topic: EntityName,
        subscription: EntityName,
    },
}

impl EntityPath {
    /// Path for a queue
    pub fn queue(name: EntityName) -> Self {
        Self::Queue { name }
    }

    /// Path for a topic
    pub fn topic(name: EntityName) -> Self {
        Self::Topic { name }
    }

    /// Path for a topic subscription
    pub fn subscription(topic: EntityName, subscription: EntityName) -> Self {
        Self::Subscription {
            topic,
            subscription,
        }
    }

    /// Whether messages can be sent to this entity
    pub fn accepts_sends(&self) -> bool {
        !matches!(self, Self::Subscription { .. })
    }

    /// Whether messages can be received from this entity
    pub fn accepts_receives(&self) -> bool {
        !matches!(self, Self::Topic { .. })
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue { name } | Self::Topic { name } => write!(f, "{}", name),
            Self::Subscription {
                topic,
                subscription,
            } => write!(f, "{}/subscriptions/{}", topic, subscription),
        }
    }
}

/// Direction of message flow over a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    Send,
    Receive,
}

/// Request to open a link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkSpec {
    pub entity: EntityPath,
    pub direction: LinkDirection,
}

impl LinkSpec {
    /// Sending link to `entity`
    pub fn sender(entity: EntityPath) -> Self {
        Self {
            entity,
            direction: LinkDirection::Send,
        }
    }

    /// Receiving link from `entity`
    pub fn receiver(entity: EntityPath) -> Self {
        Self {
            entity,
            direction: LinkDirection::Receive,
        }
    }
}

/// Identifier issued by a connection when it opens a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// An open link: a spec plus the identifier the connection assigned to it.
///
/// Uniquely identifies one logical channel on one connection. A link does not
/// survive a reconnect; it must be reopened on the new connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    id: LinkId,
    spec: LinkSpec,
}

impl Link {
    pub fn new(id: LinkId, spec: LinkSpec) -> Self {
        Self { id, spec }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn spec(&self) -> &LinkSpec {
        &self.spec
    }

    pub fn entity(&self) -> &EntityPath {
        &self.spec.entity
    }

    pub fn direction(&self) -> LinkDirection {
        self.spec.direction
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?} {})", self.id, self.spec.direction, self.spec.entity)
    }
}
