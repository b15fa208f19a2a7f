//! Association resolution.
//!
//! Populating an association fills a named property on each model from
//! its declared [`Association`]. Relational kinds read related models back
//! through the store, so they benefit from the same cache chain, holds and
//! offline rules as any other read. Related reads for one call share the
//! caller's logical request time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use strata_core::{
    join_collection_key, ArgumentError, Association, AssociationValue, Freshness, Model, ModelDescriptor,
    OpResponse, OpResult, RequestOp, StrataError, StrataResult, TimeMs,
};

use crate::store::LayeredStore;

impl LayeredStore {
    /// Populate `names` on already fetched models.
    ///
    /// Uses the configured populate freshness and the current time.
    /// Returns new instances; the inputs are untouched.
    pub async fn populate(
        &self,
        models: &[Arc<Model>],
        names: &[String],
        freshness: Freshness,
        hold: bool,
    ) -> StrataResult<Vec<Arc<Model>>> {
        let freshness = freshness.resolve(self.config().default_populate_freshness);
        let timestamp = self.now_ms();
        self.populate_models(models, names, freshness, hold, timestamp).await
    }

    /// Populate the models in a read response per its request.
    pub(crate) async fn populate_response(&self, response: OpResponse) -> StrataResult<OpResponse> {
        let request = response.request.clone();
        let populated = self
            .populate_models(
                &response.results(),
                &request.populate,
                request.populate_freshness,
                request.hold,
                request.timestamp,
            )
            .await?;

        let result = match response.result {
            OpResult::Model(_) => populated.into_iter().next().map_or(OpResult::None, OpResult::Model),
            OpResult::Models(_) => OpResult::Models(populated),
            other => other,
        };
        Ok(OpResponse { result, ..response })
    }

    pub(crate) async fn populate_models(
        &self,
        models: &[Arc<Model>],
        names: &[String],
        freshness: Freshness,
        hold: bool,
        timestamp: TimeMs,
    ) -> StrataResult<Vec<Arc<Model>>> {
        if models.is_empty() || names.is_empty() {
            return Ok(models.to_vec());
        }

        // Positions of each model type, so mixed inputs resolve per descriptor.
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (position, model) in models.iter().enumerate() {
            groups.entry(model.model_type.as_str()).or_default().push(position);
        }

        let mut working: Vec<Model> = models.iter().map(|model| (**model).clone()).collect();
        for (model_type, positions) in groups {
            let descriptor = self.registry().require(model_type)?.clone();
            let group: Vec<&Model> = positions.iter().map(|&p| models[p].as_ref()).collect();
            for name in names {
                let association = descriptor.require_association(name)?;
                let values = self
                    .resolve(&descriptor, name, association, &group, freshness, hold, timestamp)
                    .await?;
                for (&position, value) in positions.iter().zip(values) {
                    working[position].set_association(&descriptor, name, value)?;
                }
            }
        }

        tracing::debug!(models = models.len(), names = ?names, "populated associations");
        Ok(working.into_iter().map(Arc::new).collect())
    }

    /// One value per model in `models`, in order.
    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        descriptor: &ModelDescriptor,
        name: &str,
        association: &Association,
        models: &[&Model],
        freshness: Freshness,
        hold: bool,
        timestamp: TimeMs,
    ) -> StrataResult<Vec<AssociationValue>> {
        let related_type = || -> StrataResult<String> {
            descriptor
                .field_kind(name)
                .and_then(|kind| kind.related_type())
                .map(str::to_string)
                .ok_or_else(|| {
                    ArgumentError::CardinalityMismatch {
                        model_type: descriptor.name.clone(),
                        property: name.to_string(),
                        reason: format!("{} needs a model-typed field", association.kind()),
                    }
                    .into()
                })
        };

        match association {
            Association::BelongsTo { id_property } => {
                let related = related_type()?;
                let ids: Vec<_> = models.iter().map(|model| model.id_property(id_property)).collect();
                let present: Vec<_> = ids.iter().flatten().cloned().collect();
                let fetched = self.fetch_ids(&related, &present, freshness, hold, timestamp).await?;

                let mut fetched = fetched.into_iter();
                Ok(ids
                    .iter()
                    .map(|id| AssociationValue::One(id.as_ref().and_then(|_| fetched.next().flatten())))
                    .collect())
            }

            Association::HasMany { foreign_id_property } | Association::HasOne { foreign_id_property } => {
                let related = related_type()?;
                let mut slots = Vec::with_capacity(models.len());
                let mut requests = Vec::new();
                for model in models {
                    match &model.id {
                        Some(id) => {
                            let mut criteria = Map::new();
                            criteria.insert(foreign_id_property.clone(), id.to_value());
                            let key = join_collection_key(&related, foreign_id_property, id);
                            requests.push(
                                RequestOp::query(related.as_str(), Value::Object(criteria), key)
                                    .with_freshness(freshness)
                                    .with_hold(hold)
                                    .at(timestamp),
                            );
                            slots.push(true);
                        }
                        None => slots.push(false),
                    }
                }

                let mut outcomes = self.process_chunked(requests).await.into_iter();
                let mut values = Vec::with_capacity(models.len());
                for queried in slots {
                    let related_models = match queried.then(|| outcomes.next()).flatten() {
                        Some(Ok(response)) => response.results(),
                        Some(Err(err)) if err.is_offline() => Vec::new(),
                        Some(Err(err)) => return Err(err),
                        None => Vec::new(),
                    };
                    // HasOne fields keep the first element on assignment.
                    values.push(AssociationValue::Many(related_models));
                }
                Ok(values)
            }

            Association::FromBlob {
                path_property,
                converter,
            } => {
                let paths: Vec<Option<String>> = models
                    .iter()
                    .map(|model| model.get(path_property).and_then(Value::as_str).map(str::to_string))
                    .collect();
                let requests = paths
                    .iter()
                    .flatten()
                    .map(|path| {
                        RequestOp::blob_get(path.as_str())
                            .with_freshness(freshness)
                            .with_hold(hold)
                            .at(timestamp)
                    })
                    .collect();

                let mut outcomes = self.process_chunked(requests).await.into_iter();
                let mut values = Vec::with_capacity(models.len());
                for path in &paths {
                    let bytes = match path.as_ref().and_then(|_| outcomes.next()) {
                        Some(Ok(response)) => response.bytes().cloned(),
                        Some(Err(err)) if err.is_offline() => None,
                        Some(Err(err)) => return Err(err),
                        None => None,
                    };
                    let value = match bytes {
                        Some(bytes) => converter(bytes.as_slice()).map_err(|reason| ArgumentError::ConversionFailed {
                            model_type: descriptor.name.clone(),
                            property: name.to_string(),
                            reason,
                        })?,
                        None => Value::Null,
                    };
                    values.push(AssociationValue::Value(value));
                }
                Ok(values)
            }

            Association::FromProperty {
                source_property,
                converter,
                args,
            } => models
                .iter()
                .map(|model| {
                    let source = model.get(source_property).cloned().unwrap_or(Value::Null);
                    converter(&source, args)
                        .map(AssociationValue::Value)
                        .map_err(|reason| {
                            StrataError::from(ArgumentError::ConversionFailed {
                                model_type: descriptor.name.clone(),
                                property: name.to_string(),
                                reason,
                            })
                        })
                })
                .collect(),
        }
    }
}
