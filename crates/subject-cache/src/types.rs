use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use uuid::Uuid;

/// The internal identity of a subject, and the primary key of the
/// [`IdentityCache`](crate::caching::IdentityCache).
///
/// The optional name is only a hint used when an entry is first created. Two identities are
/// equal if and only if their unique ids are equal.
#[derive(Clone, Debug)]
pub struct Identity {
    id: Uuid,
    name: Option<Arc<str>>,
}

impl Identity {
    pub fn new(id: Uuid) -> Self {
        Self { id, name: None }
    }

    pub fn with_name(id: Uuid, name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl From<Uuid> for Identity {
    fn from(id: Uuid) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({name})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Parses an external subject key.
///
/// Both the hyphenated and the simple (32 hex digits) form of a UUID are accepted.
pub fn parse_key(key: &str) -> Option<Uuid> {
    Uuid::parse_str(key.trim()).ok()
}
