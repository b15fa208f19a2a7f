//! Layered store orchestration.
//!
//! [`LayeredStore`] routes every request through the cache chain, the
//! origin and, while offline, the pending-change queue.
//!
//! # Reads
//!
//! `Get`, `Query` and `BlobGet` walk the layers fastest first. The first
//! layer holding the key is the candidate. The candidate wins outright
//! when offline or when it satisfies the request's freshness; otherwise
//! the origin is asked, forwarding the candidate's etag. An unreachable
//! origin falls back to the candidate when the fallback freshness allows.
//! The winning value is written back into every faster layer before it
//! is returned.
//!
//! # Writes
//!
//! Online writes go to the origin and the result is stored in every
//! layer. Offline writes are queued, answered with a locally synthesized
//! response, and stored the same way so subsequent offline reads see them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use rand::Rng;
use strata_core::{
    ArgumentError, ChangeSet, ConnectionError, Freshness, IdKind, LayerIndex, Model, ModelId, ModelRegistry,
    OpResponse, OpResult, QueueError, RequestOp, RequestValue, StrataConfig, StrataError, StrataResult,
    TimeMs, Verb,
};

use crate::cache::{CacheLayer, GuardedLayer, LayerStats};
use crate::hold::HoldRegistry;
use crate::origin::Origin;
use crate::pending::PendingQueue;

/// Source name of locally synthesized responses.
pub const OFFLINE_SOURCE: &str = "offline";

/// The orchestrator.
pub struct LayeredStore {
    config: StrataConfig,
    registry: Arc<ModelRegistry>,
    origin: Arc<dyn Origin>,
    layers: Vec<GuardedLayer>,
    holds: HoldRegistry,
    pending: PendingQueue,
    online: AtomicBool,
}

impl LayeredStore {
    /// Open a store over `layers`, fastest first.
    ///
    /// Validates the configuration and the registry, and opens the hold
    /// registry and pending queue under the configured directories.
    pub async fn open(
        config: StrataConfig,
        registry: Arc<ModelRegistry>,
        origin: Arc<dyn Origin>,
        layers: Vec<Arc<dyn CacheLayer>>,
    ) -> StrataResult<Self> {
        config.validate()?;
        registry.validate()?;

        let holds = HoldRegistry::open(&config.hold_dir).await?;
        let pending = PendingQueue::open(&config.pending_dir).await?;
        let layers: Vec<GuardedLayer> = layers
            .into_iter()
            .enumerate()
            .map(|(index, layer)| GuardedLayer::new(layer, index))
            .collect();

        tracing::info!(
            layers = layers.len(),
            types = registry.len(),
            online = config.online,
            "opened layered store"
        );

        Ok(Self {
            online: AtomicBool::new(config.online),
            config,
            registry,
            origin,
            layers,
            holds,
            pending,
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn holds(&self) -> &HoldRegistry {
        &self.holds
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    /// Current time on the origin's clock.
    pub fn now_ms(&self) -> TimeMs {
        self.origin.now_ms()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Flip connectivity. Queued changes stay queued until
    /// [`LayeredStore::upload_changes_pending`] is called.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            tracing::info!(online, "connectivity changed");
        }
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Process any request.
    pub fn process(&self, request: RequestOp) -> BoxFuture<'_, StrataResult<OpResponse>> {
        Box::pin(async move {
            let request = Arc::new(self.stamp(request));
            self.dispatch(request, self.is_online()).await
        })
    }

    /// Fill in the request time and resolve `Default` freshness values.
    fn stamp(&self, mut request: RequestOp) -> RequestOp {
        if request.timestamp == 0 {
            request.timestamp = self.origin.now_ms();
        }
        request.freshness = request.freshness.resolve(self.config.default_freshness);
        request.populate_freshness = request
            .populate_freshness
            .resolve(self.config.default_populate_freshness);
        request.fallback_freshness = match request.fallback_freshness {
            Some(Freshness::Default) => self.config.default_fallback_freshness,
            other => other,
        };
        request
    }

    async fn dispatch(&self, request: Arc<RequestOp>, online: bool) -> StrataResult<OpResponse> {
        self.validate_request(&request)?;
        tracing::trace!(
            verb = ?request.verb,
            model_type = %request.model_type,
            key = %request.key(),
            online,
            "dispatch"
        );
        match request.verb {
            Verb::Get | Verb::Query | Verb::BlobGet => self.read(request, online).await,
            Verb::GetCollection => Ok(self.read_collection(request).await),
            Verb::Execute if !online => self.execute_offline(request).await,
            Verb::Execute => self.execute_online(request).await,
            _ if online => self.write_online(request).await,
            _ => self.write_offline(request).await,
        }
    }

    fn validate_request(&self, request: &RequestOp) -> StrataResult<()> {
        let invalid = |reason: &str| -> StrataError {
            ArgumentError::InvalidPayload {
                verb: request.verb,
                reason: reason.to_string(),
            }
            .into()
        };
        let missing_id = || -> StrataError {
            ArgumentError::MissingId {
                model_type: request.model_type.clone(),
            }
            .into()
        };

        if !request.verb.is_blob() {
            let descriptor = self.registry.require(&request.model_type)?;
            for name in &request.populate {
                descriptor.require_association(name)?;
            }
        }

        match request.verb {
            Verb::Get | Verb::Replace | Verb::Update | Verb::Destroy if request.id.is_none() => {
                Err(missing_id())
            }
            Verb::Query | Verb::GetCollection if request.collection_key.is_none() => {
                Err(invalid("a collection key is required"))
            }
            Verb::Create | Verb::Replace if request.model().is_none() => Err(invalid("a model value is required")),
            Verb::Update if request.value.as_changes().is_none() => Err(invalid("a change set is required")),
            Verb::Execute if request.action.is_none() => Err(invalid("an action is required")),
            Verb::BlobGet | Verb::BlobPut | Verb::BlobDestroy if request.path.is_none() => {
                Err(invalid("a blob path is required"))
            }
            Verb::BlobPut if request.value.as_bytes().is_none() => Err(invalid("blob bytes are required")),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // CONVENIENCE VERBS
    // ========================================================================

    pub async fn get(&self, model_type: &str, id: impl Into<ModelId>) -> StrataResult<OpResponse> {
        self.process(RequestOp::get(model_type, id)).await
    }

    pub async fn query(
        &self,
        model_type: &str,
        criteria: serde_json::Value,
        collection_key: &str,
    ) -> StrataResult<OpResponse> {
        self.process(RequestOp::query(model_type, criteria, collection_key)).await
    }

    pub async fn get_collection(&self, model_type: &str, collection_key: &str) -> StrataResult<OpResponse> {
        self.process(RequestOp::get_collection(model_type, collection_key)).await
    }

    pub async fn create(&self, model: Model) -> StrataResult<OpResponse> {
        self.process(RequestOp::create(model)).await
    }

    pub async fn replace(&self, model: Model) -> StrataResult<OpResponse> {
        self.process(RequestOp::replace(model)).await
    }

    pub async fn update(&self, prior: Arc<Model>, changes: ChangeSet) -> StrataResult<OpResponse> {
        self.process(RequestOp::update(prior, changes)).await
    }

    pub async fn destroy(&self, model: Arc<Model>) -> StrataResult<OpResponse> {
        self.process(RequestOp::destroy(model)).await
    }

    pub async fn execute(
        &self,
        model_type: &str,
        action: &str,
        params: serde_json::Value,
    ) -> StrataResult<OpResponse> {
        self.process(RequestOp::execute(model_type, action, params)).await
    }

    pub async fn blob_get(&self, path: &str) -> StrataResult<OpResponse> {
        self.process(RequestOp::blob_get(path)).await
    }

    pub async fn blob_put(&self, path: &str, bytes: Vec<u8>) -> StrataResult<OpResponse> {
        self.process(RequestOp::blob_put(path, bytes)).await
    }

    pub async fn blob_destroy(&self, path: &str) -> StrataResult<OpResponse> {
        self.process(RequestOp::blob_destroy(path)).await
    }

    // ========================================================================
    // READS
    // ========================================================================

    async fn read(&self, request: Arc<RequestOp>, online: bool) -> StrataResult<OpResponse> {
        let freshness = request.freshness;

        let mut candidate = None;
        if freshness.allows_probe() {
            let probe_freshness = if online && freshness == Freshness::Freshest {
                Freshness::Freshest
            } else {
                Freshness::Any
            };
            let probe = Arc::new(RequestOp {
                freshness: probe_freshness,
                ..(*request).clone()
            });
            for layer in &self.layers {
                let response = layer.fetch(probe.clone()).await;
                if response.exists {
                    candidate = Some(OpResponse {
                        request: request.clone(),
                        ..response
                    });
                    break;
                }
            }
        }

        let (response, refresh) = match candidate {
            Some(hit) if !online || freshness.is_acceptable(hit.arrived_at_ms, request.timestamp) => {
                tracing::trace!(source = %hit.source_name, key = %request.key(), "cache hit");
                let refresh = hit.layer.cache_index().unwrap_or(0);
                (hit, refresh)
            }
            candidate if online => self.read_origin(&request, candidate).await?,
            _ => return Err(StrataError::not_available(request.verb, &request.model_type, request.key())),
        };

        if request.hold && !response.layer.is_fastest() && response.has_value() {
            self.hold_result(&response).await?;
        }

        self.propagate(&response, refresh).await;

        if !request.populate.is_empty() && response.has_value() && request.verb != Verb::BlobGet {
            return self.populate_response(response).await;
        }
        Ok(response)
    }

    /// Ask the origin, returning the winner and how many leading layers to refresh.
    async fn read_origin(
        &self,
        request: &Arc<RequestOp>,
        candidate: Option<OpResponse>,
    ) -> StrataResult<(OpResponse, usize)> {
        let etag = candidate.as_ref().and_then(|hit| hit.etag.clone());
        let origin_request = if etag.is_some() {
            Arc::new((**request).clone().with_etag(etag.clone()))
        } else {
            request.clone()
        };

        let response = self.call_origin(origin_request).await?;
        if response.connected {
            let etag_matched = etag.is_some() && etag == response.etag;
            if let (true, Some(hit)) = (etag_matched, candidate) {
                tracing::debug!(source = %hit.source_name, key = %request.key(), "etag matched, keeping cached value");
                let refresh = hit.layer.cache_index().map_or(0, |k| k + 1);
                return Ok((
                    OpResponse {
                        arrived_at_ms: response.arrived_at_ms,
                        ..hit
                    },
                    refresh,
                ));
            }
            return Ok((
                OpResponse {
                    request: request.clone(),
                    ..response
                },
                self.layers.len(),
            ));
        }

        match (candidate, request.fallback_freshness) {
            (Some(hit), Some(fallback)) if fallback.is_acceptable(hit.arrived_at_ms, request.timestamp) => {
                tracing::warn!(
                    source = %hit.source_name,
                    key = %request.key(),
                    age_ms = request.timestamp.saturating_sub(hit.arrived_at_ms),
                    "origin unreachable, serving cached value"
                );
                let refresh = hit.layer.cache_index().unwrap_or(0);
                Ok((hit, refresh))
            }
            _ => Err(StrataError::not_available(request.verb, &request.model_type, request.key())),
        }
    }

    /// Collections are answered from the cache chain only.
    async fn read_collection(&self, request: Arc<RequestOp>) -> OpResponse {
        for layer in &self.layers {
            let response = layer.fetch(request.clone()).await;
            if response.exists {
                return response;
            }
        }
        OpResponse::missing(request, "cache", LayerIndex::Cache(self.layers.len()))
    }

    async fn call_origin(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let outcome: StrataResult<OpResponse> = async {
            self.origin.ensure_authenticated(&request.model_type).await?;
            self.origin.process_request(request.clone(), true).await
        }
        .await;

        match outcome {
            Ok(mut response) => {
                if response.connected && response.arrived_at_ms == 0 {
                    response.arrived_at_ms = self.origin.now_ms();
                }
                Ok(response.relabel(self.origin.name(), LayerIndex::Origin))
            }
            Err(err) if err.is_connection_failure() => {
                tracing::warn!(key = %request.key(), error = %err, "origin unreachable");
                Ok(OpResponse::disconnected(request, self.origin.name(), LayerIndex::Origin))
            }
            Err(err) => Err(err),
        }
    }

    async fn hold_result(&self, response: &OpResponse) -> StrataResult<()> {
        let request = &response.request;
        match request.verb {
            Verb::Get | Verb::Query => {
                for id in response.result_ids() {
                    self.holds.hold(&request.model_type, &id).await?;
                }
                if let Some(name) = &request.collection_key {
                    self.holds.hold_collection(&request.model_type, name).await?;
                }
            }
            Verb::BlobGet => {
                if let Some(path) = &request.path {
                    self.holds.hold_blob(path).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Store `response` into the first `count` layers.
    async fn propagate(&self, response: &OpResponse, count: usize) {
        for layer in self.layers.iter().take(count) {
            layer.store_response(response).await;
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    async fn write_online(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let response = self.call_origin(request.clone()).await?;
        if !response.connected {
            return Err(ConnectionError::OriginUnreachable {
                model_type: request.model_type.clone(),
                reason: format!("{:?} {} not delivered", request.verb, request.key()),
            }
            .into());
        }

        let bare_update = request.verb == Verb::Update && response.exists && response.result == OpResult::None;
        let response = match updated_model(&request).filter(|_| bare_update) {
            Some(model) => OpResponse {
                result: OpResult::Model(model),
                ..response
            },
            None => response,
        };

        self.propagate(&response, self.layers.len()).await;
        Ok(response)
    }

    async fn write_offline(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let invalid = |reason: &str| -> StrataError {
            ArgumentError::InvalidPayload {
                verb: request.verb,
                reason: reason.to_string(),
            }
            .into()
        };

        let (request, result) = match request.verb {
            Verb::Create => {
                let model = request.model().ok_or_else(|| invalid("a model value is required"))?;
                if model.id.is_some() {
                    (request.clone(), OpResult::Model(model.clone()))
                } else {
                    let id = self.synthesize_id(&request.model_type)?;
                    let mut created = (**model).clone();
                    created.id = Some(id.clone());
                    let created = Arc::new(created);
                    let rewritten = Arc::new(RequestOp {
                        id: Some(id),
                        value: RequestValue::Model(created.clone()),
                        ..(*request).clone()
                    });
                    (rewritten, OpResult::Model(created))
                }
            }
            Verb::Replace => {
                let model = request.model().cloned().ok_or_else(|| invalid("a model value is required"))?;
                (request.clone(), OpResult::Model(model))
            }
            Verb::Update => {
                let model =
                    updated_model(&request).ok_or_else(|| invalid("an offline update needs the prior value"))?;
                (request.clone(), OpResult::Model(model))
            }
            Verb::BlobPut => {
                let bytes = request
                    .value
                    .as_bytes()
                    .cloned()
                    .ok_or_else(|| invalid("blob bytes are required"))?;
                (request.clone(), OpResult::Bytes(bytes))
            }
            Verb::Destroy | Verb::BlobDestroy => (request.clone(), OpResult::None),
            _ => return Err(invalid("not a queueable write")),
        };

        let file = self.pending.enqueue(&request).await?;
        tracing::info!(file = %file, verb = ?request.verb, key = %request.key(), "queued offline write");

        let response = OpResponse {
            connected: false,
            exists: !matches!(request.verb, Verb::Destroy | Verb::BlobDestroy),
            result,
            arrived_at_ms: request.timestamp,
            source_name: OFFLINE_SOURCE.to_string(),
            layer: LayerIndex::Offline,
            etag: None,
            request,
        };
        self.propagate(&response, self.layers.len()).await;
        Ok(response)
    }

    /// Queue the action, then deliver it.
    ///
    /// The queued copy is sent again by the next replay, so an action may
    /// reach the origin twice.
    async fn execute_online(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let file = self.pending.enqueue(&request).await?;
        tracing::debug!(file = %file, action = %request.key(), "queued execute");
        self.write_online(request).await
    }

    /// Queue the action and let the origin answer it locally if it can.
    async fn execute_offline(&self, request: Arc<RequestOp>) -> StrataResult<OpResponse> {
        let file = self.pending.enqueue(&request).await?;
        tracing::info!(file = %file, action = %request.key(), "queued offline execute");

        let response = match self.origin.process_request(request.clone(), false).await {
            Ok(response) => response,
            Err(err) if err.is_connection_failure() || err.is_offline() => {
                OpResponse::disconnected(request, OFFLINE_SOURCE, LayerIndex::Offline)
            }
            Err(err) => return Err(err),
        };
        Ok(response.relabel(OFFLINE_SOURCE, LayerIndex::Offline))
    }

    fn synthesize_id(&self, model_type: &str) -> StrataResult<ModelId> {
        let descriptor = self.registry.require(model_type)?;
        Ok(match descriptor.id_kind {
            IdKind::Integer => ModelId::Int(-rand::rng().random_range(1..=i64::MAX)),
            IdKind::Text => ModelId::Text(self.origin.new_guid()),
        })
    }

    // ========================================================================
    // BATCHES
    // ========================================================================

    /// Run `requests` in chunks of `max_parallelism`, preserving order.
    pub(crate) async fn process_chunked(&self, requests: Vec<RequestOp>) -> Vec<StrataResult<OpResponse>> {
        let chunk_size = self.config.max_parallelism.max(1);
        let mut results = Vec::with_capacity(requests.len());
        let mut requests = requests.into_iter().peekable();
        while requests.peek().is_some() {
            let chunk: Vec<_> = requests
                .by_ref()
                .take(chunk_size)
                .map(|request| self.process(request))
                .collect();
            results.extend(join_all(chunk).await);
        }
        results
    }

    /// Fetch several records of one type, in `ids` order.
    ///
    /// Duplicate ids are fetched once. Ids that are absent, or unavailable
    /// while offline, yield `None`.
    pub async fn get_models_for_ids(
        &self,
        model_type: &str,
        ids: &[ModelId],
        freshness: Freshness,
        hold: bool,
    ) -> StrataResult<Vec<Option<Arc<Model>>>> {
        let timestamp = self.now_ms();
        self.fetch_ids(model_type, ids, freshness, hold, timestamp).await
    }

    pub(crate) async fn fetch_ids(
        &self,
        model_type: &str,
        ids: &[ModelId],
        freshness: Freshness,
        hold: bool,
        timestamp: TimeMs,
    ) -> StrataResult<Vec<Option<Arc<Model>>>> {
        let mut seen = HashSet::new();
        let distinct: Vec<ModelId> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();

        let requests = distinct
            .iter()
            .map(|id| {
                RequestOp::get(model_type, id.clone())
                    .with_freshness(freshness)
                    .with_hold(hold)
                    .at(timestamp)
            })
            .collect();

        let mut found = HashMap::with_capacity(distinct.len());
        for (id, outcome) in distinct.into_iter().zip(self.process_chunked(requests).await) {
            let model = match outcome {
                Ok(response) => response.first_result(),
                Err(err) if err.is_offline() => None,
                Err(err) => return Err(err),
            };
            found.insert(id, model);
        }
        Ok(ids.iter().map(|id| found.get(id).cloned().flatten()).collect())
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Clear every layer. With `except_held`, held entries survive; with
    /// `older_than`, only entries that arrived before the cutoff go.
    pub async fn clear_all(&self, except_held: bool, older_than: Option<TimeMs>) -> u64 {
        let holds = except_held.then_some(&self.holds);
        let mut removed = 0;
        for layer in &self.layers {
            removed += layer.clear_all(holds, older_than).await;
        }
        tracing::info!(removed, except_held, ?older_than, "cleared cache layers");
        removed
    }

    /// Per-layer counters, fastest first.
    pub async fn layer_stats(&self) -> Vec<(String, LayerStats)> {
        let mut stats = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            stats.push((layer.name().to_string(), layer.stats().await));
        }
        stats
    }

    /// Number of queued changes. `None` while online.
    pub async fn pending_count(&self) -> StrataResult<Option<usize>> {
        if self.is_online() {
            return Ok(None);
        }
        Ok(Some(self.pending.len().await?))
    }

    /// Queued envelope file names in replay order.
    pub async fn changes_pending_list(&self) -> StrataResult<Vec<String>> {
        self.pending.list().await
    }

    /// Replay the queue against the origin in order.
    ///
    /// Each change is removed once the origin accepts it. Replay stops at
    /// the first change the origin does not accept, leaving it and
    /// everything after it queued. Returns the number replayed.
    ///
    /// Once a replayed create is assigned an origin id, later changes that
    /// still name the local id are sent under the origin id instead. If
    /// replay stops, the remaining envelopes are rewritten with the ids
    /// learned so far.
    pub async fn upload_changes_pending(&self) -> StrataResult<usize> {
        let files = self.pending.list().await?;
        let mut assigned = IdRemap::new();
        let mut replayed = 0;
        for (position, file) in files.iter().enumerate() {
            let change = self.pending.load(file).await?;
            let request = Arc::new(remap_ids(&change.request, &assigned).unwrap_or(change.request));

            let response = match self.write_online(request.clone()).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(file = %file, error = %err, "pending change rejected, replay stopped");
                    self.persist_remap(&files[position..], &assigned).await?;
                    return Err(QueueError::ReplayFailed {
                        file: file.clone(),
                        reason: err.to_string(),
                    }
                    .into());
                }
            };

            // A locally created record now lives under the origin's id.
            if let (Verb::Create, Some(local)) = (request.verb, request.id.as_ref()) {
                let origin_id = response.result_ids().first().cloned();
                if local.is_local() && origin_id.as_ref() != Some(local) {
                    for layer in &self.layers {
                        layer.evict(&request.model_type, local, request.timestamp).await;
                    }
                    if let Some(origin_id) = origin_id {
                        tracing::debug!(local = %local, assigned = %origin_id, "local id replaced by origin");
                        assigned.insert((request.model_type.clone(), local.clone()), origin_id);
                    }
                }
            }

            self.pending.remove(file).await?;
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(replayed, "uploaded pending changes");
        }
        Ok(replayed)
    }

    /// Rewrite queued envelopes that still name ids in `assigned`.
    async fn persist_remap(&self, files: &[String], assigned: &IdRemap) -> StrataResult<()> {
        if assigned.is_empty() {
            return Ok(());
        }
        for file in files {
            let change = self.pending.load(file).await?;
            if let Some(request) = remap_ids(&change.request, assigned) {
                self.pending.rewrite(file, &request).await?;
            }
        }
        Ok(())
    }
}

/// Origin ids assigned to locally created records, by type and local id.
type IdRemap = HashMap<(String, ModelId), ModelId>;

/// `request` with every local id found in `assigned` replaced, or `None`
/// when nothing changes.
fn remap_ids(request: &RequestOp, assigned: &IdRemap) -> Option<RequestOp> {
    let lookup = |id: Option<&ModelId>| {
        id.and_then(|id| assigned.get(&(request.model_type.clone(), id.clone())))
            .cloned()
    };
    let remap_model = |model: &Arc<Model>| {
        lookup(model.id.as_ref()).map(|id| {
            Arc::new(Model {
                id: Some(id),
                ..(**model).clone()
            })
        })
    };

    let id = lookup(request.id.as_ref());
    let value = match &request.value {
        RequestValue::Model(model) => remap_model(model).map(RequestValue::Model),
        _ => None,
    };
    let extra = request.extra.as_ref().and_then(remap_model);
    if id.is_none() && value.is_none() && extra.is_none() {
        return None;
    }

    Some(RequestOp {
        id: id.or_else(|| request.id.clone()),
        value: value.unwrap_or_else(|| request.value.clone()),
        extra: extra.or_else(|| request.extra.clone()),
        ..request.clone()
    })
}

/// The prior value with the request's edits applied.
fn updated_model(request: &RequestOp) -> Option<Arc<Model>> {
    let prior = request.extra.as_ref()?;
    let changes = request.value.as_changes()?;
    Some(Arc::new(changes.apply(prior)))
}
