//! Identifier space: node ids, item names and composite item ids.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::error::InvalidNameError;

/// Opaque node identifier.
///
/// Persistent ids are ULIDs assigned by the persistence provider when a node
/// is first saved. Nodes created in a session carry a transient id with the
/// reserved `~` prefix until their save commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// prefix for session-local placeholder ids
    pub const TRANSIENT_PREFIX: &'static str = "~";

    /// create a NodeId from an existing persistent identifier
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), InvalidNameError> {
        if id.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if id.len() > 128 {
            return Err(InvalidNameError::TooLong(id.len()));
        }

        for (i, c) in id.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// Generate a new persistent id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Generate a session-local placeholder id.
    pub fn transient() -> Self {
        Self(format!(
            "{}{}",
            Self::TRANSIENT_PREFIX,
            ulid::Ulid::new().to_string().to_lowercase()
        ))
    }

    /// check if this id was never persisted
    pub fn is_transient(&self) -> bool {
        self.0.starts_with(Self::TRANSIENT_PREFIX)
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated item name (child node or property name).
///
/// Names may carry a namespace prefix (`jcr:content`) but never path
/// syntax: no `/`, no same-name-sibling brackets, no wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name(String);

impl Name {
    const ILLEGAL: &'static [char] = &['/', '[', ']', '*', '|'];

    /// create a new Name, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        if name.trim().is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if name.len() > 255 {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        if name == "." || name == ".." {
            return Err(InvalidNameError::Reserved(name.to_string()));
        }

        for (i, c) in name.chars().enumerate() {
            if Self::ILLEGAL.contains(&c) || c.is_control() {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// Built-in names that are known to be valid.
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self(name.to_string())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a property: owning node plus property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId {
    pub parent: NodeId,
    pub name: Name,
}

impl PropertyId {
    pub fn new(parent: NodeId, name: Name) -> Self {
        Self { parent, name }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Identifier of any item in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl ItemId {
    pub fn is_node(&self) -> bool {
        matches!(self, ItemId::Node(_))
    }

    /// The node itself, or the owner of the property.
    pub fn node_id(&self) -> &NodeId {
        match self {
            ItemId::Node(id) => id,
            ItemId::Property(id) => &id.parent,
        }
    }

    /// check if the id still carries a transient node id
    pub fn is_transient(&self) -> bool {
        self.node_id().is_transient()
    }

    /// The same item under its permanent node id, if one was assigned.
    pub fn remapped(&self, assigned: &HashMap<NodeId, NodeId>) -> ItemId {
        let node = assigned.get(self.node_id()).unwrap_or(self.node_id()).clone();
        match self {
            ItemId::Node(_) => ItemId::Node(node),
            ItemId::Property(id) => ItemId::Property(PropertyId::new(node, id.name.clone())),
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        ItemId::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        ItemId::Property(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Node(id) => write!(f, "{}", id),
            ItemId::Property(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_valid() {
        assert!(NodeId::new("abc123").is_ok());
        assert!(NodeId::new("01arz3ndektsv4rrffq69g5fav").is_ok());
        assert!(NodeId::new("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }

    #[test]
    fn test_node_id_invalid() {
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("a/b").is_err());
        assert!(NodeId::new("~abc").is_err()); // transient prefix is reserved
        assert!(NodeId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_transient_ids() {
        let t1 = NodeId::transient();
        let t2 = NodeId::transient();
        assert!(t1.is_transient());
        assert_ne!(t1, t2);

        let persistent = NodeId::generate();
        assert!(!persistent.is_transient());
        assert_eq!(persistent.as_str().len(), 26);
    }

    #[test]
    fn test_name_validation() {
        assert!(Name::new("content").is_ok());
        assert!(Name::new("jcr:content").is_ok());
        assert!(Name::new("my file.txt").is_ok());

        assert_eq!(Name::new(""), Err(InvalidNameError::Empty));
        assert!(matches!(
            Name::new("a/b"),
            Err(InvalidNameError::InvalidCharacter { char: '/', position: 1 })
        ));
        assert!(Name::new("child[2]").is_err());
        assert!(Name::new("..").is_err());
    }

    #[test]
    fn test_item_id_display() {
        let node = NodeId::new("n1").unwrap();
        let prop = PropertyId::new(node.clone(), Name::new("title").unwrap());
        assert_eq!(ItemId::from(node.clone()).to_string(), "n1");
        assert_eq!(ItemId::from(prop.clone()).to_string(), "n1/title");
        assert_eq!(ItemId::from(prop).node_id(), &node);
    }

    #[test]
    fn test_item_id_remapped() {
        let tmp = NodeId::transient();
        let permanent = NodeId::generate();
        let assigned = HashMap::from([(tmp.clone(), permanent.clone())]);

        let prop = ItemId::from(PropertyId::new(tmp.clone(), Name::new("p").unwrap()));
        let remapped = prop.remapped(&assigned);
        assert!(!remapped.is_transient());
        assert_eq!(remapped.node_id(), &permanent);

        let untouched = ItemId::from(NodeId::generate());
        assert_eq!(untouched.remapped(&assigned), untouched);
    }
}
