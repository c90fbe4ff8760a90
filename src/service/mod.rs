//! Retrieval orchestration
//!
//! The one public entry point. Sequences canonicalization, intent
//! classification, cache lookup, parallel adapter fan-out with a join
//! barrier, fusion, optional rerank, passage assembly, deduplication, and
//! a best-effort cache store. Each stage is a pure function of its input
//! plus injected collaborators; the cache is the only cross-request state.
//!
//! Adapter calls run as plain futures under the caller's task, so dropping
//! a `retrieve` future cancels every in-flight backend call; nothing
//! partial is ever cached.

use crate::cache::{CacheKey, CachedResponse, QueryCache};
use crate::config::Config;
use crate::corpus::{RetrievalUnit, UnitStore};
use crate::error::{EvidexError, Result};
use crate::fusion::{BackendResults, FusedResult, FusionEngine};
use crate::passage::{deduplicate_passages, Passage, PassageAssembler};
use crate::query::{CodeRef, Intent, IntentClassifier, Query, QueryCanonicalizer, QueryFilters};
use crate::rerank::Reranker;
use crate::retriever::RetrieverAdapter;
use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

/// One retrieval request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,

    /// Caller-forced intent; skips classification when set
    #[serde(default)]
    pub intent: Option<Intent>,

    #[serde(default)]
    pub filters: QueryFilters,

    /// Requested result count; defaults and caps come from config
    #[serde(default)]
    pub top_k: Option<usize>,

    #[serde(default = "default_true")]
    pub rerank: bool,

    #[serde(default = "default_true")]
    pub explain: bool,

    /// Saved/pinned queries get the longer cache TTL
    #[serde(default)]
    pub pin_cache: bool,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            intent: None,
            filters: QueryFilters::default(),
            top_k: None,
            rerank: true,
            explain: true,
            pin_cache: false,
        }
    }
}

/// Ordered passages with explain scores plus degradation warnings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub passages: Vec<Passage>,
    pub warnings: Vec<String>,
    pub degraded: bool,
}

/// The retrieval pipeline orchestrator
pub struct RetrievalService {
    canonicalizer: QueryCanonicalizer,
    classifier: IntentClassifier,
    adapters: Vec<Arc<dyn RetrieverAdapter>>,
    graph_adapter: Option<Arc<dyn RetrieverAdapter>>,
    fusion: FusionEngine,
    reranker: Option<Reranker>,
    assembler: PassageAssembler,
    store: Arc<dyn UnitStore>,
    cache: Arc<QueryCache>,
    config: Config,
}

impl RetrievalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        canonicalizer: QueryCanonicalizer,
        classifier: IntentClassifier,
        adapters: Vec<Arc<dyn RetrieverAdapter>>,
        graph_adapter: Option<Arc<dyn RetrieverAdapter>>,
        fusion: FusionEngine,
        reranker: Option<Reranker>,
        assembler: PassageAssembler,
        store: Arc<dyn UnitStore>,
        cache: Arc<QueryCache>,
        config: Config,
    ) -> Self {
        Self {
            canonicalizer,
            classifier,
            adapters,
            graph_adapter,
            fusion,
            reranker,
            assembler,
            store,
            cache,
            config,
        }
    }

    /// Run the full pipeline for one request
    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResponse> {
        let request_id = Uuid::new_v4();
        let top_k = self.validate(&request)?;
        let mut warnings: Vec<String> = Vec::new();

        // Canonicalize; concept lookup failure degrades to a warning
        let canonical = self.canonicalizer.canonicalize(&request.query).await;
        if canonical.expansion_skipped {
            warnings.push("concept expansion skipped: catalog unavailable".to_string());
        }

        let intents = match request.intent {
            Some(intent) => vec![(intent, 1.0)],
            None => self.classifier.classify(&canonical.text),
        };

        let mut codes = canonical.codes.clone();
        for code in &request.filters.codes {
            if !codes.contains(code) {
                codes.push(code.clone());
            }
        }

        let query = Query {
            raw: request.query.clone(),
            canonical: canonical.text,
            intents,
            must_terms: canonical.must_terms,
            should_terms: canonical.should_terms,
            negative_terms: canonical.negative_terms,
            expansion_terms: canonical.expansion_terms,
            codes,
            filters: request.filters.clone(),
            top_k,
            rerank: request.rerank,
            explain: request.explain,
        };

        tracing::debug!(
            %request_id,
            canonical = %query.canonical,
            intent = %query.primary_intent(),
            "query canonicalized"
        );

        // The rerank flag changes the final ordering, so it is folded into
        // the version component of the key; explain only strips scores from
        // the response and is applied after the cache
        let cache_version = format!(
            "{}|rerank={}",
            self.cache.version_tag(),
            self.should_rerank(&query)
        );
        let key = CacheKey::build(
            &query.canonical,
            &query.intents,
            &query.filters,
            query.top_k,
            &cache_version,
        );
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(%request_id, "cache hit");
            let mut passages = hit.passages;
            if !request.explain {
                strip_explain_scores(&mut passages);
            }
            return Ok(RetrievalResponse {
                passages,
                warnings: hit.warnings,
                degraded: hit.degraded,
            });
        }

        // Parallel fan-out with a join barrier: fusion starts only after
        // every adapter has returned, timed out, or failed
        let search_limit = query.top_k * self.config.service.fan_out_multiplier;
        let (mut backends, failed_adapters) =
            self.fan_out(&query, search_limit, &mut warnings).await;
        let mut degraded_retrieval = failed_adapters > 0;

        degraded_retrieval |= self
            .run_graph_if_triggered(&query, search_limit, &mut backends, &mut warnings)
            .await;

        if backends.is_empty() {
            tracing::warn!(%request_id, "all retrieval backends failed");
            return Err(EvidexError::RetrievalUnavailable {
                details: warnings.join("; "),
            });
        }

        let mut fused = self.fusion.fuse(query.primary_intent(), &backends);
        tracing::debug!(%request_id, candidates = fused.len(), "fusion complete");

        // Hydrate enough candidates for rerank and assembly, then apply the
        // filters the indexes could not
        let hydrate_limit = search_limit.max(if self.should_rerank(&query) {
            self.config.rerank.top_n
        } else {
            0
        });
        let units = self.hydrate(&fused, hydrate_limit, &query.filters).await?;
        fused.retain(|r| units.contains_key(&r.unit_id));
        fused.truncate(hydrate_limit);

        let mut rerank_degraded = false;
        if self.should_rerank(&query) {
            fused = self
                .rerank(&query, fused, &units, &mut warnings, &mut rerank_degraded)
                .await?;
        }

        // Assemble a margin beyond top_k; dedup can only shrink the list
        fused.truncate(query.top_k * 2);
        let passages = self.assembler.assemble(&fused, &units).await?;
        let mut passages = deduplicate_passages(passages);
        passages.truncate(query.top_k);

        let degraded = degraded_retrieval || rerank_degraded;

        // Best-effort store of the full-fidelity passages; degraded
        // responses are never cached so a recovered backend is picked up
        // immediately
        if !degraded {
            self.cache
                .put(
                    &key,
                    CachedResponse {
                        passages: passages.clone(),
                        warnings: warnings.clone(),
                        degraded,
                    },
                    request.pin_cache,
                )
                .await;
        }

        if !request.explain {
            strip_explain_scores(&mut passages);
        }

        let response = RetrievalResponse {
            passages,
            warnings,
            degraded,
        };
        tracing::info!(
            %request_id,
            results = response.passages.len(),
            degraded = response.degraded,
            "retrieval complete"
        );
        Ok(response)
    }

    /// Reject malformed input before any backend call
    fn validate(&self, request: &RetrievalRequest) -> Result<usize> {
        if request.query.trim().is_empty() {
            return Err(EvidexError::Validation(
                "query text cannot be empty".to_string(),
            ));
        }
        let top_k = request.top_k.unwrap_or(self.config.service.default_top_k);
        if top_k == 0 {
            return Err(EvidexError::Validation("top_k must be at least 1".to_string()));
        }
        if let (Some(from), Some(to)) = (request.filters.date_from, request.filters.date_to) {
            if from > to {
                return Err(EvidexError::Validation(
                    "date_from cannot be after date_to".to_string(),
                ));
            }
        }
        Ok(top_k.min(self.config.service.max_top_k))
    }

    /// Run all primary adapters concurrently and join
    ///
    /// Returns the succeeding backends and the number of failures.
    async fn fan_out(
        &self,
        query: &Query,
        search_limit: usize,
        warnings: &mut Vec<String>,
    ) -> (Vec<BackendResults>, usize) {
        let timeout = Duration::from_millis(self.config.service.adapter_timeout_ms);

        let calls = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            async move {
                let name = adapter.name().to_string();
                let outcome =
                    tokio::time::timeout(timeout, adapter.search(query, search_limit)).await;
                (name, outcome)
            }
        });

        let mut backends = Vec::new();
        let mut failures = 0;
        for (name, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(candidates)) => {
                    tracing::debug!(backend = %name, hits = candidates.len(), "adapter returned");
                    backends.push(BackendResults::new(name, candidates));
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %name, error = %e, "adapter failed");
                    warnings.push(format!("{} adapter failed: {}", name, e));
                    failures += 1;
                }
                Err(_) => {
                    tracing::warn!(backend = %name, "adapter timed out");
                    warnings.push(format!("{} adapter timed out", name));
                    failures += 1;
                }
            }
        }
        (backends, failures)
    }

    /// The graph path runs for configured intents, or as backfill when the
    /// primary adapters came back thin
    ///
    /// Returns true when the graph adapter was triggered but failed.
    async fn run_graph_if_triggered(
        &self,
        query: &Query,
        search_limit: usize,
        backends: &mut Vec<BackendResults>,
        warnings: &mut Vec<String>,
    ) -> bool {
        let Some(graph) = &self.graph_adapter else {
            return false;
        };
        let graph_config = &self.config.adapters.graph;
        if !graph_config.enabled {
            return false;
        }

        let intent_triggered = query
            .intents
            .iter()
            .any(|(intent, _)| graph_config.trigger_intents.contains(intent));
        let unique_candidates: HashSet<&str> = backends
            .iter()
            .flat_map(|b| b.candidates.iter().map(|c| c.unit_id.as_str()))
            .collect();
        let thin = unique_candidates.len() < graph_config.min_primary_candidates;

        if !intent_triggered && !thin {
            return false;
        }

        let timeout = Duration::from_millis(self.config.service.adapter_timeout_ms);
        match tokio::time::timeout(timeout, graph.search(query, search_limit)).await {
            Ok(Ok(candidates)) => {
                tracing::debug!(hits = candidates.len(), "graph adapter returned");
                backends.push(BackendResults::new(graph.name().to_string(), candidates));
                false
            }
            Ok(Err(e)) => {
                warnings.push(format!("{} adapter failed: {}", graph.name(), e));
                true
            }
            Err(_) => {
                warnings.push(format!("{} adapter timed out", graph.name()));
                true
            }
        }
    }

    fn should_rerank(&self, query: &Query) -> bool {
        query.rerank && self.config.rerank.enabled && self.reranker.is_some()
    }

    async fn rerank(
        &self,
        query: &Query,
        fused: Vec<FusedResult>,
        units: &HashMap<String, RetrievalUnit>,
        warnings: &mut Vec<String>,
        rerank_degraded: &mut bool,
    ) -> Result<Vec<FusedResult>> {
        let Some(reranker) = &self.reranker else {
            return Ok(fused);
        };

        let pinned = self.pinned_units(query, units).await?;
        let texts: HashMap<String, String> = units
            .iter()
            .map(|(id, unit)| (id.clone(), unit.text.clone()))
            .collect();

        let outcome = reranker.rerank(&query.canonical, fused, &texts, &pinned).await;
        if outcome.skipped {
            warnings.push("rerank skipped: model unavailable or timed out".to_string());
            *rerank_degraded = true;
        }
        Ok(outcome.results)
    }

    /// Unit ids whose unit metadata or owning document carries a code that
    /// exactly matches one of the query's codes
    async fn pinned_units(
        &self,
        query: &Query,
        units: &HashMap<String, RetrievalUnit>,
    ) -> Result<HashSet<String>> {
        if query.codes.is_empty() {
            return Ok(HashSet::new());
        }

        let mut document_codes: HashMap<String, Vec<CodeRef>> = HashMap::new();
        let mut pinned = HashSet::new();

        for (id, unit) in units {
            if unit_codes(unit).iter().any(|c| query.codes.contains(c)) {
                pinned.insert(id.clone());
                continue;
            }
            if !document_codes.contains_key(&unit.document_id) {
                let codes = self.store.document_codes(&unit.document_id).await?;
                document_codes.insert(unit.document_id.clone(), codes);
            }
            if document_codes[&unit.document_id]
                .iter()
                .any(|c| query.codes.contains(c))
            {
                pinned.insert(id.clone());
            }
        }
        Ok(pinned)
    }

    /// Fetch unit records for the fused head and apply post-index filters
    async fn hydrate(
        &self,
        fused: &[FusedResult],
        limit: usize,
        filters: &QueryFilters,
    ) -> Result<HashMap<String, RetrievalUnit>> {
        let ids: Vec<String> = fused
            .iter()
            .take(limit)
            .map(|r| r.unit_id.clone())
            .collect();
        let units = self.store.get_units(&ids).await?;
        Ok(units
            .into_iter()
            .filter(|u| Self::passes_filters(u, filters))
            .map(|u| (u.id.clone(), u))
            .collect())
    }

    /// Apply filters that the indexes could not evaluate
    fn passes_filters(unit: &RetrievalUnit, filters: &QueryFilters) -> bool {
        if let Some(facet) = filters.facet {
            if unit.facet != facet {
                return false;
            }
        }
        if let Some(source) = &filters.source {
            let unit_source = unit.metadata.get("source").and_then(|v| v.as_str());
            if unit_source != Some(source.as_str()) {
                return false;
            }
        }
        if filters.date_from.is_some() || filters.date_to.is_some() {
            let Some(date) = unit
                .metadata
                .get("date")
                .and_then(|v| v.as_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            else {
                return false;
            };
            if let Some(from) = filters.date_from {
                if date < from {
                    return false;
                }
            }
            if let Some(to) = filters.date_to {
                if date > to {
                    return false;
                }
            }
        }
        if let Some(min_n) = filters.min_sample_size {
            let sample = unit
                .metadata
                .get("sample_size")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if sample < min_n {
                return false;
            }
        }
        true
    }
}

fn unit_codes(unit: &RetrievalUnit) -> Vec<CodeRef> {
    unit.metadata
        .get("codes")
        .and_then(|v| serde_json::from_value::<Vec<CodeRef>>(v.clone()).ok())
        .unwrap_or_default()
}

fn strip_explain_scores(passages: &mut [Passage]) {
    for passage in passages {
        passage.component_scores.clear();
        passage.rerank_score = None;
    }
}
