//! Model registry.
//!
//! Per-type property and association metadata, built once at startup and
//! passed by reference to everything that needs it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::association::Association;
use crate::error::{ArgumentError, StrataResult};

/// How a model type's ids are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// Signed integers; offline-created ids are random negatives.
    Integer,
    /// Strings; offline-created ids come from the origin's GUID generator.
    Text,
}

/// Declared kind of a model property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Integer,
    Text,
    Float,
    Bool,
    Json,
    Bytes,
    /// Singular reference to a model of the named type.
    One(String),
    /// Collection of models of the named type.
    Many(String),
}

impl FieldKind {
    /// Id-capable kinds: comparable and hashable.
    pub fn is_comparable(&self) -> bool {
        matches!(self, Self::Integer | Self::Text)
    }

    /// The related model type, for reference kinds.
    pub fn related_type(&self) -> Option<&str> {
        match self {
            Self::One(t) | Self::Many(t) => Some(t),
            _ => None,
        }
    }
}

/// Metadata for one model type.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub id_kind: IdKind,
    pub fields: BTreeMap<String, FieldKind>,
    pub associations: BTreeMap<String, Association>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, id_kind: IdKind) -> Self {
        Self {
            name: name.into(),
            id_kind,
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
        }
    }

    /// Declare a property.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Attach an association to an already declared property.
    pub fn association(mut self, property: impl Into<String>, association: Association) -> Self {
        self.associations.insert(property.into(), association);
        self
    }

    /// Declare `property` as a belongs-to reference to `target` via `id_property`.
    pub fn belongs_to(
        self,
        property: impl Into<String>,
        target: impl Into<String>,
        id_property: impl Into<String>,
    ) -> Self {
        let property = property.into();
        self.field(property.clone(), FieldKind::One(target.into()))
            .association(property, Association::belongs_to(id_property))
    }

    /// Declare `property` as a has-many collection of `target` joined on `foreign_id_property`.
    pub fn has_many(
        self,
        property: impl Into<String>,
        target: impl Into<String>,
        foreign_id_property: impl Into<String>,
    ) -> Self {
        let property = property.into();
        self.field(property.clone(), FieldKind::Many(target.into()))
            .association(property, Association::has_many(foreign_id_property))
    }

    /// Declare `property` as a has-one reference to `target` joined on `foreign_id_property`.
    pub fn has_one(
        self,
        property: impl Into<String>,
        target: impl Into<String>,
        foreign_id_property: impl Into<String>,
    ) -> Self {
        let property = property.into();
        self.field(property.clone(), FieldKind::One(target.into()))
            .association(property, Association::has_one(foreign_id_property))
    }

    pub fn field_kind(&self, property: &str) -> Option<&FieldKind> {
        self.fields.get(property)
    }

    /// Look up an association, failing with `UnknownAssociation`.
    pub fn require_association(&self, name: &str) -> StrataResult<&Association> {
        self.associations.get(name).ok_or_else(|| {
            ArgumentError::UnknownAssociation {
                model_type: self.name.clone(),
                association: name.to_string(),
            }
            .into()
        })
    }

    fn require_field(&self, property: &str) -> Result<&FieldKind, ArgumentError> {
        self.fields
            .get(property)
            .ok_or_else(|| ArgumentError::UnknownProperty {
                model_type: self.name.clone(),
                property: property.to_string(),
            })
    }

    fn require_comparable(&self, property: &str) -> Result<(), ArgumentError> {
        if self.require_field(property)?.is_comparable() {
            Ok(())
        } else {
            Err(ArgumentError::NotComparable {
                model_type: self.name.clone(),
                property: property.to_string(),
            })
        }
    }

    fn cardinality(&self, property: &str, reason: &str) -> ArgumentError {
        ArgumentError::CardinalityMismatch {
            model_type: self.name.clone(),
            property: property.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Checks that need only this descriptor.
    fn validate_local(&self) -> Result<(), ArgumentError> {
        for (property, association) in &self.associations {
            let kind = self.require_field(property)?;
            match association {
                Association::BelongsTo { id_property } => {
                    if !matches!(kind, FieldKind::One(_)) {
                        return Err(self.cardinality(property, "belongs-to requires a singular model field"));
                    }
                    self.require_comparable(id_property)?;
                }
                Association::HasMany { .. } => {
                    if !matches!(kind, FieldKind::Many(_)) {
                        return Err(self.cardinality(property, "has-many requires a list field"));
                    }
                }
                Association::HasOne { .. } => {
                    if !matches!(kind, FieldKind::One(_)) {
                        return Err(self.cardinality(property, "has-one requires a singular model field"));
                    }
                }
                Association::FromBlob { path_property, .. } => {
                    if kind.related_type().is_some() {
                        return Err(self.cardinality(property, "from-blob cannot target a model field"));
                    }
                    if self.require_field(path_property)? != &FieldKind::Text {
                        return Err(ArgumentError::NotComparable {
                            model_type: self.name.clone(),
                            property: path_property.clone(),
                        });
                    }
                }
                Association::FromProperty {
                    source_property, ..
                } => {
                    if kind.related_type().is_some() {
                        return Err(self.cardinality(property, "from-property cannot target a model field"));
                    }
                    self.require_field(source_property)?;
                }
            }
        }
        Ok(())
    }
}

/// Registry of all model types known to a store.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    types: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor after validating its own declarations.
    ///
    /// Cross-type checks run in [`ModelRegistry::validate`], since the
    /// related type may be registered later.
    pub fn register(&mut self, descriptor: ModelDescriptor) -> StrataResult<()> {
        descriptor.validate_local()?;
        self.types
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Builder form of [`ModelRegistry::register`].
    pub fn with(mut self, descriptor: ModelDescriptor) -> StrataResult<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    /// Validate every relational association against its target type.
    pub fn validate(&self) -> StrataResult<()> {
        for descriptor in self.types.values() {
            for (property, association) in &descriptor.associations {
                let foreign = match association {
                    Association::HasMany {
                        foreign_id_property,
                    }
                    | Association::HasOne {
                        foreign_id_property,
                    } => Some(foreign_id_property),
                    Association::BelongsTo { .. } => None,
                    _ => continue,
                };

                let target_name = descriptor
                    .fields
                    .get(property)
                    .and_then(FieldKind::related_type)
                    .unwrap_or_default();
                let target = self.require(target_name)?;

                if let Some(foreign_id_property) = foreign {
                    target.require_comparable(foreign_id_property)?;
                }
            }
        }
        Ok(())
    }

    /// Look up a descriptor.
    pub fn get(&self, model_type: &str) -> Option<&Arc<ModelDescriptor>> {
        self.types.get(model_type)
    }

    /// Look up a descriptor, failing with `UnknownModelType`.
    pub fn require(&self, model_type: &str) -> StrataResult<&Arc<ModelDescriptor>> {
        self.types.get(model_type).ok_or_else(|| {
            ArgumentError::UnknownModelType {
                model_type: model_type.to_string(),
            }
            .into()
        })
    }

    /// Registered type names in sorted order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
