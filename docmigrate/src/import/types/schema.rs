//! Collection and relationship-attribute descriptors

use serde::{Deserialize, Serialize};

/// Relationship cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationType {
    /// Whether the parent-side field holds a single reference
    pub fn is_single(&self) -> bool {
        matches!(self, RelationType::OneToOne | RelationType::ManyToOne)
    }

    /// Wire name used by the backend
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::OneToOne => "oneToOne",
            RelationType::OneToMany => "oneToMany",
            RelationType::ManyToOne => "manyToOne",
            RelationType::ManyToMany => "manyToMany",
        }
    }
}

/// Which side of a two-way relationship a descriptor describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationSide {
    #[default]
    Parent,
    Child,
}

/// What happens to related documents when a document is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnDelete {
    #[default]
    SetNull,
    Cascade,
    Restrict,
}

impl OnDelete {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDelete::SetNull => "setNull",
            OnDelete::Cascade => "cascade",
            OnDelete::Restrict => "restrict",
        }
    }
}

/// A schema-level field linking two collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipAttribute {
    /// Attribute key on the owning collection
    pub key: String,
    /// Related collection name
    pub related_collection: String,
    pub relation_type: RelationType,
    #[serde(default)]
    pub two_way: bool,
    /// Key of the mirrored attribute on the related collection
    #[serde(default)]
    pub two_way_key: Option<String>,
    #[serde(default)]
    pub side: RelationSide,
    #[serde(default)]
    pub on_delete: OnDelete,
}

impl RelationshipAttribute {
    pub fn new(
        key: impl Into<String>,
        related_collection: impl Into<String>,
        relation_type: RelationType,
    ) -> Self {
        RelationshipAttribute {
            key: key.into(),
            related_collection: related_collection.into(),
            relation_type,
            two_way: false,
            two_way_key: None,
            side: RelationSide::Parent,
            on_delete: OnDelete::SetNull,
        }
    }

    pub fn two_way(mut self, two_way_key: impl Into<String>, side: RelationSide) -> Self {
        self.two_way = true;
        self.two_way_key = Some(two_way_key.into());
        self.side = side;
        self
    }

    /// Whether the reconciler writes this side.
    ///
    /// The child side of a two-way relationship is derived by the backend.
    /// One-way relationships only have a parent side.
    pub fn is_reconciled_side(&self) -> bool {
        !self.two_way || self.side == RelationSide::Parent
    }
}

/// A collection as described by the upstream schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    /// Backend id; looked up by name when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub relationships: Vec<RelationshipAttribute>,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionDescriptor {
            name: name.into(),
            id: None,
            relationships: Vec::new(),
        }
    }

    pub fn with_relationship(mut self, attribute: RelationshipAttribute) -> Self {
        self.relationships.push(attribute);
        self
    }

    /// Relationship attributes the reconciler fills in
    pub fn reconciled_relationships(&self) -> impl Iterator<Item = &RelationshipAttribute> {
        self.relationships.iter().filter(|r| r.is_reconciled_side())
    }
}
