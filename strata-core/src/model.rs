//! Model representation.
//!
//! A model is a typed bag of JSON attributes plus an optional id and the
//! associations resolved onto it. Once handed out by the orchestrator a
//! model lives behind an `Arc` and is never mutated; edits are expressed as
//! a [`ChangeSet`] and materialized into a new model on demand.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ArgumentError, StrataResult};
use crate::registry::{FieldKind, ModelDescriptor};

// ============================================================================
// IDENTITY
// ============================================================================

/// Model identifier.
///
/// Integer ids are used by origins with numeric keys; text ids cover GUIDs
/// and natural keys. Locally synthesized integer ids are negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelId {
    Int(i64),
    Text(String),
}

impl ModelId {
    /// Read an id out of a JSON attribute value.
    ///
    /// Returns `None` for `null` and for values that are not integers or strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// JSON form of this id.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Text(s) => Value::from(s.clone()),
        }
    }

    /// True for ids synthesized locally while offline.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Int(i) if *i < 0)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ModelId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

// ============================================================================
// ASSOCIATION VALUES
// ============================================================================

/// A resolved association assigned onto a model.
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationValue {
    /// Singular model reference (belongs-to, has-one).
    One(Option<Arc<Model>>),
    /// Model collection (has-many).
    Many(Vec<Arc<Model>>),
    /// Derived value (from-blob, from-property).
    Value(Value),
}

impl AssociationValue {
    /// The singular model, if this is a populated `One`.
    pub fn as_one(&self) -> Option<&Arc<Model>> {
        match self {
            Self::One(model) => model.as_ref(),
            _ => None,
        }
    }

    /// The collection, if this is `Many`.
    pub fn as_many(&self) -> Option<&[Arc<Model>]> {
        match self {
            Self::Many(models) => Some(models),
            _ => None,
        }
    }

    /// The derived value, if this is `Value`.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// A record of a registered model type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Registered type name.
    pub model_type: String,
    /// Identifier; `None` until assigned by the origin or synthesized offline.
    pub id: Option<ModelId>,
    /// Attribute values keyed by property name.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Associations resolved onto this instance. Never persisted.
    #[serde(skip)]
    pub associations: BTreeMap<String, AssociationValue>,
}

impl Model {
    /// Create an empty model of the given type.
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
            id: None,
            attributes: Map::new(),
            associations: BTreeMap::new(),
        }
    }

    /// Set the id (builder style).
    pub fn with_id(mut self, id: impl Into<ModelId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set an attribute (builder style).
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(property.into(), value.into());
        self
    }

    /// Get an attribute value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.attributes.get(property)
    }

    /// Read an attribute as an id, treating `null` and absence alike.
    pub fn id_property(&self, property: &str) -> Option<ModelId> {
        self.attributes.get(property).and_then(ModelId::from_value)
    }

    /// Get a resolved association.
    pub fn association(&self, name: &str) -> Option<&AssociationValue> {
        self.associations.get(name)
    }

    /// Require an id.
    pub fn require_id(&self) -> StrataResult<&ModelId> {
        self.id.as_ref().ok_or_else(|| {
            ArgumentError::MissingId {
                model_type: self.model_type.clone(),
            }
            .into()
        })
    }

    /// Shallow copy without resolved associations, as stored by cache layers.
    pub fn detached(&self) -> Model {
        Model {
            model_type: self.model_type.clone(),
            id: self.id.clone(),
            attributes: self.attributes.clone(),
            associations: BTreeMap::new(),
        }
    }

    /// Assign an association through the declared field kind.
    ///
    /// This is the single entry point for association write-back. Singular
    /// fields receive the first element of a collection; collection fields
    /// receive a singular value wrapped in a list. Derived values may only
    /// land on scalar or JSON fields.
    pub fn set_association(
        &mut self,
        descriptor: &ModelDescriptor,
        name: &str,
        value: AssociationValue,
    ) -> StrataResult<()> {
        let kind = descriptor
            .fields
            .get(name)
            .ok_or_else(|| ArgumentError::UnknownProperty {
                model_type: descriptor.name.clone(),
                property: name.to_string(),
            })?;

        let mismatch = |reason: &str| ArgumentError::CardinalityMismatch {
            model_type: descriptor.name.clone(),
            property: name.to_string(),
            reason: reason.to_string(),
        };

        let coerced = match (kind, value) {
            (FieldKind::One(_), AssociationValue::One(model)) => AssociationValue::One(model),
            (FieldKind::One(_), AssociationValue::Many(models)) => {
                AssociationValue::One(models.into_iter().next())
            }
            (FieldKind::Many(_), AssociationValue::Many(models)) => AssociationValue::Many(models),
            (FieldKind::Many(_), AssociationValue::One(model)) => {
                AssociationValue::Many(model.into_iter().collect())
            }
            (FieldKind::One(_) | FieldKind::Many(_), AssociationValue::Value(_)) => {
                return Err(mismatch("model field cannot hold a derived value").into());
            }
            (_, AssociationValue::Value(value)) => AssociationValue::Value(value),
            (_, AssociationValue::One(_) | AssociationValue::Many(_)) => {
                return Err(mismatch("scalar field cannot hold a model reference").into());
            }
        };

        self.associations.insert(name.to_string(), coerced);
        Ok(())
    }
}

// ============================================================================
// CHANGE SETS
// ============================================================================

/// Pending attribute edits against a base model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    changes: Map<String, Value>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit (builder style).
    pub fn set(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(property.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterate edits in property order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.changes.iter()
    }

    /// Materialize the edited view of `base`.
    pub fn apply(&self, base: &Model) -> Model {
        let mut edited = base.detached();
        for (property, value) in &self.changes {
            edited.attributes.insert(property.clone(), value.clone());
        }
        edited
    }
}

impl From<Map<String, Value>> for ChangeSet {
    fn from(changes: Map<String, Value>) -> Self {
        Self { changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{IdKind, ModelDescriptor};
    use serde_json::json;

    fn parent_descriptor() -> ModelDescriptor {
        ModelDescriptor::new("Parent", IdKind::Integer)
            .field("name", FieldKind::Text)
            .field("children", FieldKind::Many("Child".to_string()))
            .field("eldest", FieldKind::One("Child".to_string()))
    }

    #[test]
    fn test_model_id_from_value() {
        assert_eq!(ModelId::from_value(&json!(7)), Some(ModelId::Int(7)));
        assert_eq!(
            ModelId::from_value(&json!("abc")),
            Some(ModelId::Text("abc".to_string()))
        );
        assert_eq!(ModelId::from_value(&Value::Null), None);
        assert_eq!(ModelId::from_value(&json!(1.5)), None);
    }

    #[test]
    fn test_model_id_serde_untagged() {
        let ids = vec![ModelId::Int(-4), ModelId::from("x-1")];
        let encoded = serde_json::to_string(&ids).expect("encode");
        assert_eq!(encoded, r#"[-4,"x-1"]"#);
        let decoded: Vec<ModelId> = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, ids);
        assert!(ids[0].is_local());
    }

    #[test]
    fn test_change_set_apply_leaves_base_untouched() {
        let base = Model::new("Parent").with_id(1).with("name", "old");
        let edited = ChangeSet::new().set("name", "new").apply(&base);
        assert_eq!(base.get("name"), Some(&json!("old")));
        assert_eq!(edited.get("name"), Some(&json!("new")));
        assert_eq!(edited.id, Some(ModelId::Int(1)));
    }

    #[test]
    fn test_set_association_coerces_cardinality() {
        let descriptor = parent_descriptor();
        let child = Arc::new(Model::new("Child").with_id(10));
        let mut parent = Model::new("Parent").with_id(1);

        parent
            .set_association(
                &descriptor,
                "children",
                AssociationValue::One(Some(child.clone())),
            )
            .expect("one into many");
        assert_eq!(
            parent.association("children").and_then(|a| a.as_many()).map(|m| m.len()),
            Some(1)
        );

        parent
            .set_association(&descriptor, "eldest", AssociationValue::Many(vec![child.clone()]))
            .expect("many into one");
        assert!(Arc::ptr_eq(
            parent.association("eldest").and_then(|a| a.as_one()).expect("eldest"),
            &child
        ));
    }

    #[test]
    fn test_set_association_rejects_value_into_model_field() {
        let descriptor = parent_descriptor();
        let mut parent = Model::new("Parent");
        let err = parent
            .set_association(&descriptor, "children", AssociationValue::Value(json!(3)))
            .unwrap_err();
        assert_eq!(err.category(), "argument");

        let err = parent
            .set_association(&descriptor, "missing", AssociationValue::Value(json!(3)))
            .unwrap_err();
        assert!(format!("{}", err).contains("missing"));
    }
}
