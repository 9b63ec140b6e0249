//! K-anonymous poll results and demographic breakdowns.
//!
//! Suppression rules, evaluated in order:
//! 1. total votes below k: empty results, metadata reports reality
//! 2. per-option counts below k: replaced by 0, counted in metadata
//! 3. breakdown buckets below k: replaced by the `<suppressed>` sentinel
//! 4. complementary suppression: a lone surviving bucket is inferable by
//!    subtraction from the total, so it is suppressed as well
//! 5. a dimension with fewer than three visible cells is dropped whole
//! 6. differencing defense: a query whose dimension set is a strict
//!    subset of an earlier, richer query is rejected
//!
//! Shaped results are cached per (poll, canonical dimension set); the
//! vote path invalidates on every accepted ballot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::ser::Serializer;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::audit::{AuditChain, AuditError, EventKind};
use crate::model::VoteRow;
use crate::store::{Database, StoreError};

/// Sentinel replacing a suppressed breakdown bucket.
pub const SUPPRESSED_SENTINEL: &str = "<suppressed>";

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Poll not found")]
    NotFound,

    /// The query's dimension set differences against an earlier query.
    #[error("Query rejected: suspected inference attack")]
    InferenceAttackSuspected,

    #[error("Aggregation store error: {0}")]
    Store(#[from] StoreError),

    #[error("Aggregation audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Breakdown dimensions recognized on ingress; anything else is rejected
/// at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dimension {
    Gender,
    AgeBucket,
    Region,
}

impl Dimension {
    pub fn key(&self) -> &'static str {
        match self {
            Dimension::Gender => "gender",
            Dimension::AgeBucket => "age_bucket",
            Dimension::Region => "region",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gender" => Some(Dimension::Gender),
            "age_bucket" => Some(Dimension::AgeBucket),
            "region" => Some(Dimension::Region),
            _ => None,
        }
    }

    fn value_of(&self, vote: &VoteRow) -> String {
        match self {
            Dimension::Gender => vote.demographics.gender.as_str().to_string(),
            Dimension::AgeBucket => vote.demographics.age_bucket.as_str().to_string(),
            Dimension::Region => vote.demographics.region.clone(),
        }
    }
}

/// One requested breakdown: a single dimension or a cross of several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakdownSpec(pub Vec<Dimension>);

impl BreakdownSpec {
    /// Stable name: dimension keys sorted and joined, e.g.
    /// `age_bucket+gender`.
    pub fn canonical(&self) -> String {
        let mut keys: Vec<&str> = self.0.iter().map(Dimension::key).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.join("+")
    }

    fn bucket_key(&self, vote: &VoteRow) -> String {
        let mut dims: Vec<Dimension> = self.0.clone();
        dims.sort_unstable();
        dims.dedup();
        dims.iter()
            .map(|d| d.value_of(vote))
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Canonical name for a whole query (set of breakdowns).
fn canonical_query(breakdowns: &[BreakdownSpec]) -> String {
    let mut names: Vec<String> = breakdowns.iter().map(BreakdownSpec::canonical).collect();
    names.sort_unstable();
    names.dedup();
    names.join(";")
}

/// A published cell: a count, or the suppression sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValue {
    Count(u64),
    Suppressed,
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Count(n) => serializer.serialize_u64(*n),
            CellValue::Suppressed => serializer.serialize_str(SUPPRESSED_SENTINEL),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionResult {
    pub option_id: String,
    pub label: String,
    /// Below-k counts are published as 0 and counted in metadata.
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsMeta {
    pub k_threshold: u32,
    pub suppressed_cells: u32,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResults {
    pub total_votes: u64,
    pub results: Vec<OptionResult>,
    /// breakdown name -> bucket -> cell.
    pub breakdowns: BTreeMap<String, BTreeMap<String, CellValue>>,
    pub meta: ResultsMeta,
}

/// Shaped-result cache keyed by (poll, canonical query). Shared with the
/// vote path, which invalidates a poll's entries on every accepted vote.
#[derive(Default)]
pub struct ResultCache {
    inner: Mutex<HashMap<String, HashMap<String, PollResults>>>,
}

impl ResultCache {
    pub async fn get(&self, poll_id: &str, query: &str) -> Option<PollResults> {
        self.inner
            .lock()
            .await
            .get(poll_id)
            .and_then(|per_poll| per_poll.get(query))
            .cloned()
    }

    pub async fn insert(&self, poll_id: &str, query: String, results: PollResults) {
        self.inner
            .lock()
            .await
            .entry(poll_id.to_string())
            .or_default()
            .insert(query, results);
    }

    /// Drop a poll's cached shapes (new vote or admin invalidation).
    pub async fn invalidate(&self, poll_id: &str) {
        self.inner.lock().await.remove(poll_id);
    }
}

#[derive(Debug, Clone)]
struct QueryRecord {
    dims: BTreeSet<&'static str>,
    visible_cells: usize,
}

/// Serves k-anonymous results; single instance per process.
pub struct AggregationService {
    db: Database,
    audit: AuditChain,
    cache: Arc<ResultCache>,
    hasher_name: &'static str,
    query_log: Mutex<HashMap<String, Vec<QueryRecord>>>,
}

impl AggregationService {
    pub fn new(
        db: Database,
        audit: AuditChain,
        cache: Arc<ResultCache>,
        hasher_name: &'static str,
    ) -> Self {
        Self {
            db,
            audit,
            cache,
            hasher_name,
            query_log: Mutex::new(HashMap::new()),
        }
    }

    /// Poll results with optional demographic breakdowns, shaped by the
    /// poll's k floor.
    pub async fn get_results(
        &self,
        poll_id: &str,
        breakdowns: &[BreakdownSpec],
    ) -> Result<PollResults, AggregationError> {
        let poll = self
            .db
            .get_poll(poll_id)
            .await?
            .ok_or(AggregationError::NotFound)?;
        let k = poll.min_k_anonymity as u64;
        let query = canonical_query(breakdowns);

        // Identical repeats are idempotent reads; serve them from cache
        // before the differencing check.
        if let Some(cached) = self.cache.get(poll_id, &query).await {
            return Ok(cached);
        }

        let votes = self.db.list_votes(poll_id).await?;
        let options = self.db.list_options(poll_id).await?;
        let total = votes.len() as u64;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut suppressed_cells = 0u32;

        // Rule 1: total-suppression floor.
        if total < k {
            suppressed_cells += 1 + options.len() as u32;
            self.audit_suppression(poll_id, suppressed_cells).await?;
            let shaped = PollResults {
                total_votes: 0,
                results: Vec::new(),
                breakdowns: BTreeMap::new(),
                meta: ResultsMeta {
                    k_threshold: k as u32,
                    suppressed_cells,
                    last_updated: now,
                },
            };
            self.cache
                .insert(poll_id, query.clone(), shaped.clone())
                .await;
            self.log_query(poll_id, breakdowns, 0).await;
            return Ok(shaped);
        }

        // Rule 2: per-option suppression.
        let mut option_counts: HashMap<&str, u64> = HashMap::new();
        for vote in &votes {
            *option_counts.entry(vote.option_id.as_str()).or_default() += 1;
        }
        let results: Vec<OptionResult> = options
            .iter()
            .map(|option| {
                let count = option_counts.get(option.id.as_str()).copied().unwrap_or(0);
                let published = if count > 0 && count < k {
                    suppressed_cells += 1;
                    0
                } else {
                    count
                };
                OptionResult {
                    option_id: option.id.clone(),
                    label: option.label.clone(),
                    count: published,
                }
            })
            .collect();

        // Rules 3-5 per requested breakdown.
        let mut shaped_breakdowns = BTreeMap::new();
        let mut visible_total = 0usize;
        for spec in breakdowns {
            let name = spec.canonical();
            if name.is_empty() || shaped_breakdowns.contains_key(&name) {
                continue;
            }

            let mut buckets: BTreeMap<String, u64> = BTreeMap::new();
            for vote in &votes {
                *buckets.entry(spec.bucket_key(vote)).or_default() += 1;
            }

            let mut cells: BTreeMap<String, CellValue> = BTreeMap::new();
            let mut visible: Vec<(String, u64)> = Vec::new();
            for (bucket, count) in buckets {
                if count < k {
                    suppressed_cells += 1;
                    cells.insert(bucket, CellValue::Suppressed);
                } else {
                    visible.push((bucket.clone(), count));
                    cells.insert(bucket, CellValue::Count(count));
                }
            }

            // Rule 4: a single surviving bucket is inferable by
            // subtraction; suppress it too.
            if visible.len() == 1 {
                let (bucket, _) = visible.pop().expect("one visible cell");
                cells.insert(bucket, CellValue::Suppressed);
                suppressed_cells += 1;
            }

            // Rule 5: drop dimensions with fewer than three visible cells.
            if visible.len() < 3 {
                suppressed_cells += visible.len() as u32;
                debug!(poll_id, breakdown = %name, "dimension dropped below minimum cells");
                continue;
            }

            visible_total += visible.len();
            shaped_breakdowns.insert(name, cells);
        }

        // Rule 6: differencing defense against earlier, richer queries.
        self.check_inference(poll_id, breakdowns, visible_total)
            .await?;

        if suppressed_cells > 0 {
            self.audit_suppression(poll_id, suppressed_cells).await?;
        }

        let shaped = PollResults {
            total_votes: total,
            results,
            breakdowns: shaped_breakdowns,
            meta: ResultsMeta {
                k_threshold: k as u32,
                suppressed_cells,
                last_updated: now,
            },
        };
        self.cache
            .insert(poll_id, query.clone(), shaped.clone())
            .await;
        self.log_query(poll_id, breakdowns, visible_total).await;
        Ok(shaped)
    }

    /// Audit-event counts under the same k floor, for the security
    /// events summary surface.
    pub async fn security_events_summary(
        &self,
        k: u64,
    ) -> Result<BTreeMap<String, CellValue>, AggregationError> {
        let counts = self.audit.counts_by_kind().await?;
        Ok(counts
            .into_iter()
            .map(|(kind, count)| {
                let cell = if (count as u64) < k {
                    CellValue::Suppressed
                } else {
                    CellValue::Count(count as u64)
                };
                (kind, cell)
            })
            .collect())
    }

    fn dims_of(breakdowns: &[BreakdownSpec]) -> BTreeSet<&'static str> {
        breakdowns
            .iter()
            .flat_map(|spec| spec.0.iter().map(Dimension::key))
            .collect()
    }

    async fn check_inference(
        &self,
        poll_id: &str,
        breakdowns: &[BreakdownSpec],
        visible_cells: usize,
    ) -> Result<(), AggregationError> {
        let dims = Self::dims_of(breakdowns);
        if dims.is_empty() {
            return Ok(());
        }
        let log = self.query_log.lock().await;
        if let Some(records) = log.get(poll_id) {
            for record in records {
                let strict_subset = dims.is_subset(&record.dims) && dims != record.dims;
                if strict_subset && record.visible_cells > visible_cells {
                    return Err(AggregationError::InferenceAttackSuspected);
                }
            }
        }
        Ok(())
    }

    async fn log_query(&self, poll_id: &str, breakdowns: &[BreakdownSpec], visible_cells: usize) {
        let dims = Self::dims_of(breakdowns);
        if dims.is_empty() {
            return;
        }
        let mut log = self.query_log.lock().await;
        log.entry(poll_id.to_string()).or_default().push(QueryRecord {
            dims,
            visible_cells,
        });
    }

    async fn audit_suppression(
        &self,
        poll_id: &str,
        cells: u32,
    ) -> Result<(), AggregationError> {
        self.audit
            .append(
                EventKind::SuppressionTriggered,
                json!({
                    "poll_id": poll_id,
                    "cells": cells,
                    "hasher": self.hasher_name,
                }),
            )
            .await?;
        Ok(())
    }
}
