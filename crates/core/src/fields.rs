//! Endpoint field table: local names, wire names and mutability classes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    /// Fixed at creation and always supplied.
    RequiredImmutable,
    /// Fixed at creation if set.
    OptionalImmutable,
    /// May change after creation.
    Mutable,
    /// Populated only from reads.
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    DisplayName,
    Labels,
    EncryptionSpec,
    MetadataSchemaUri,
    Region,
    Project,
    CreateTime,
    UpdateTime,
}

impl Field {
    /// Declaration order. Planner output and masks follow it.
    pub const ALL: [Field; 9] = [
        Field::Name,
        Field::DisplayName,
        Field::Labels,
        Field::EncryptionSpec,
        Field::MetadataSchemaUri,
        Field::Region,
        Field::Project,
        Field::CreateTime,
        Field::UpdateTime,
    ];

    pub fn local_name(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::DisplayName => "display_name",
            Field::Labels => "labels",
            Field::EncryptionSpec => "encryption_spec",
            Field::MetadataSchemaUri => "metadata_schema_uri",
            Field::Region => "region",
            Field::Project => "project",
            Field::CreateTime => "create_time",
            Field::UpdateTime => "update_time",
        }
    }

    /// Wire (camelCase) name. `None` for address-context fields that never travel in a body.
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            Field::Name => Some("name"),
            Field::DisplayName => Some("displayName"),
            Field::Labels => Some("labels"),
            Field::EncryptionSpec => Some("encryptionSpec"),
            Field::MetadataSchemaUri => Some("metadataSchemaUri"),
            Field::CreateTime => Some("createTime"),
            Field::UpdateTime => Some("updateTime"),
            Field::Region | Field::Project => None,
        }
    }

    pub fn mutability(self) -> Mutability {
        match self {
            Field::MetadataSchemaUri => Mutability::RequiredImmutable,
            Field::EncryptionSpec | Field::Region | Field::Project => Mutability::OptionalImmutable,
            Field::DisplayName | Field::Labels => Mutability::Mutable,
            Field::Name | Field::CreateTime | Field::UpdateTime => Mutability::Computed,
        }
    }

    pub fn is_mutable(self) -> bool { self.mutability() == Mutability::Mutable }

    pub fn is_immutable(self) -> bool {
        matches!(self.mutability(), Mutability::RequiredImmutable | Mutability::OptionalImmutable)
    }

    /// Sent in a create body.
    pub fn is_outbound(self) -> bool {
        self.wire_name().is_some() && self.mutability() != Mutability::Computed
    }

    fn bit(self) -> u16 { 1 << (self as u16) }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.local_name()) }
}

/// Small set of fields, iterated in declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldSet(u16);

impl FieldSet {
    pub const fn new() -> Self { Self(0) }

    pub fn insert(&mut self, field: Field) { self.0 |= field.bit(); }

    pub fn remove(&mut self, field: Field) { self.0 &= !field.bit(); }

    pub fn contains(&self, field: Field) -> bool { self.0 & field.bit() != 0 }

    pub fn is_empty(&self) -> bool { self.0 == 0 }

    pub fn len(&self) -> usize { self.0.count_ones() as usize }

    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        Field::ALL.into_iter().filter(move |f| self.contains(*f))
    }

    /// Keep only fields matching `pred`.
    pub fn filter(&self, pred: impl Fn(Field) -> bool) -> FieldSet {
        self.iter().filter(|f| pred(*f)).collect()
    }
}

impl FromIterator<Field> for FieldSet {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        let mut set = FieldSet::new();
        for f in iter { set.insert(f); }
        set
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Field::local_name).collect();
        f.write_str(&names.join(", "))
    }
}
