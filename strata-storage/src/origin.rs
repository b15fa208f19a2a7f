//! The authoritative data source behind the cache chain.

use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{OpResponse, RequestOp, StrataResult, TimeMs};

/// The system of record.
///
/// Implementations answer every verb. An unreachable origin should return
/// a response with `connected == false` (or a `Connection` error); the
/// orchestrator treats both as a trigger for the fallback path.
///
/// A response whose etag equals the request's `etag` may omit its result:
/// the orchestrator keeps the cached value and refreshes its arrival time.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Name used in responses and logs.
    fn name(&self) -> &str {
        "origin"
    }

    /// Process `request`. `online` is false only for offline `Execute`
    /// calls, which the origin may answer locally.
    async fn process_request(&self, request: Arc<RequestOp>, online: bool) -> StrataResult<OpResponse>;

    /// Clock used to stamp requests.
    fn now_ms(&self) -> TimeMs {
        strata_core::now_ms()
    }

    /// Model types this origin serves.
    fn list_model_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether this origin serves `model_type`. An origin that lists no
    /// types serves all of them.
    fn lookup_model_type(&self, model_type: &str) -> bool {
        let types = self.list_model_types();
        types.is_empty() || types.iter().any(|t| t == model_type)
    }

    /// Called before every origin request.
    async fn ensure_authenticated(&self, _model_type: &str) -> StrataResult<()> {
        Ok(())
    }

    /// Generator for text ids synthesized while offline.
    fn new_guid(&self) -> String {
        strata_core::new_guid()
    }
}
