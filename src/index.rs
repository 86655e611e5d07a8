//! Index writer: paged bulk upserts and the dual-slot alias swap.
//!
//! Every role (POIs, highways, cached source features) owns two physical
//! indices and one alias.
//! Readers only ever address the alias. A rebuild fills the slot the alias
//! does not point at, then moves the alias in a single request:
//!
//! ```text
//! First live  --begin--> Second created --upsert--> Second filled --commit--> Second live
//! ```
//!
//! If anything fails before the alias moves, the new slot is dropped and the
//! old one keeps serving.

use crate::config::{
    PipelineConfig, EXTERNAL_POIS_ALIAS, EXTERNAL_POIS_SLOTS, HIGHWAYS_ALIAS, HIGHWAYS_SLOTS,
    INDEX_TOTAL_FIELDS_LIMIT, POIS_ALIAS, POIS_SLOTS, SCROLL_PAGE_SIZE, SCROLL_TTL,
};
use crate::models::{Feature, FeatureError, Source};
use crate::queries;
use crate::search::{AliasAction, BulkItemFailure, BulkResponse, EngineError, SearchEngine};
use crate::stats::IndexStats;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexRole {
    PointsOfInterest,
    Highways,
    ExternalPois,
}

impl IndexRole {
    pub const ALL: [IndexRole; 3] = [
        IndexRole::PointsOfInterest,
        IndexRole::Highways,
        IndexRole::ExternalPois,
    ];

    pub fn alias(&self) -> &'static str {
        match self {
            Self::PointsOfInterest => POIS_ALIAS,
            Self::Highways => HIGHWAYS_ALIAS,
            Self::ExternalPois => EXTERNAL_POIS_ALIAS,
        }
    }

    pub fn slot_name(&self, slot: Slot) -> &'static str {
        let slots = match self {
            Self::PointsOfInterest => POIS_SLOTS,
            Self::Highways => HIGHWAYS_SLOTS,
            Self::ExternalPois => EXTERNAL_POIS_SLOTS,
        };
        match slot {
            Slot::First => slots[0],
            Slot::Second => slots[1],
        }
    }

    pub fn slot_of(&self, index: &str) -> Option<Slot> {
        [Slot::First, Slot::Second]
            .into_iter()
            .find(|&slot| self.slot_name(slot) == index)
    }

    /// Index body: POIs get a point and a shape, highways only the shape,
    /// cached source features a shape and an exact source.
    pub fn mapping(&self) -> Value {
        let mut fields = json!({
            "geometry": { "type": "geo_shape" }
        });
        match self {
            Self::PointsOfInterest => {
                fields["properties"] = json!({
                    "properties": {
                        "identifier": { "type": "keyword" },
                        "poiGeolocation": { "type": "geo_point" },
                        "poiLastModified": { "type": "date" },
                        "poiDeleted": { "type": "boolean" },
                        "poiContainer": { "type": "boolean" },
                        "poiCombinedIds": { "type": "keyword" },
                        "poiNames": {
                            "properties": {
                                "all": {
                                    "type": "text",
                                    "fields": { "keyword": { "type": "keyword" } }
                                }
                            }
                        }
                    }
                });
            }
            Self::ExternalPois => {
                fields["properties"] = json!({
                    "properties": {
                        "identifier": { "type": "keyword" },
                        "poiSource": { "type": "keyword" }
                    }
                });
            }
            Self::Highways => {}
        }
        json!({
            "settings": { "index.mapping.total_fields.limit": INDEX_TOTAL_FIELDS_LIMIT },
            "mappings": { "properties": fields }
        })
    }
}

impl fmt::Display for IndexRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// A write target: either the role's alias or one of its physical slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    pub role: IndexRole,
    pub name: String,
    pub slot: Option<Slot>,
}

impl IndexHandle {
    pub fn alias(role: IndexRole) -> Self {
        Self {
            role,
            name: role.alias().to_string(),
            slot: None,
        }
    }

    pub fn slot(role: IndexRole, slot: Slot) -> Self {
        Self {
            role,
            name: role.slot_name(slot).to_string(),
            slot: Some(slot),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub batches: usize,
    pub written: usize,
    pub failures: Vec<BulkItemFailure>,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("batch {batch} timed out after {timeout:?}")]
    BatchTimeout { batch: usize, timeout: Duration },

    #[error("batch {batch} failed after {attempts} attempts")]
    BatchFailed {
        batch: usize,
        attempts: u32,
        #[source]
        source: Box<IndexError>,
    },

    #[error("{index} is not a slot of {role}")]
    RoleMismatch { role: IndexRole, index: String },

    #[error("swap of {role} aborted, {live} stays live")]
    SwapAborted {
        role: IndexRole,
        live: String,
        #[source]
        source: Box<IndexError>,
    },

    #[error(transparent)]
    Document(#[from] FeatureError),
}

pub struct IndexWriter<E: SearchEngine> {
    engine: E,
    config: PipelineConfig,
    stats: IndexStats,
    show_progress: bool,
}

impl<E: SearchEngine> IndexWriter<E> {
    pub fn new(engine: E, config: &PipelineConfig) -> Self {
        Self {
            engine,
            config: config.clone(),
            stats: IndexStats::new(),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    /// Creates the first slot and its alias for every role that has neither slot.
    pub async fn initialize(&self) -> Result<(), IndexError> {
        for role in IndexRole::ALL {
            let first = role.slot_name(Slot::First);
            let second = role.slot_name(Slot::Second);
            if self.engine.index_exists(first).await? || self.engine.index_exists(second).await? {
                debug!(%role, "Index already initialized");
                continue;
            }
            self.engine.create_index(first, &role.mapping()).await?;
            self.engine
                .update_aliases(&[AliasAction::Add {
                    index: first.to_string(),
                    alias: role.alias().to_string(),
                }])
                .await?;
            info!(%role, index = first, "Initialized index");
        }
        Ok(())
    }

    /// Slot the role's alias currently points at, `None` before the first commit.
    pub async fn live_slot(&self, role: IndexRole) -> Result<Option<Slot>, IndexError> {
        let targets = self.engine.get_alias(role.alias()).await?;
        match targets.as_slice() {
            [] => Ok(None),
            [index] => role
                .slot_of(index)
                .map(Some)
                .ok_or_else(|| IndexError::RoleMismatch {
                    role,
                    index: index.clone(),
                }),
            _ => Err(IndexError::RoleMismatch {
                role,
                index: targets.join(","),
            }),
        }
    }

    pub async fn current_index(&self, role: IndexRole) -> Result<Option<IndexHandle>, IndexError> {
        Ok(self
            .live_slot(role)
            .await?
            .map(|slot| IndexHandle::slot(role, slot)))
    }

    /// Recreates the slot that is not live and returns it, empty and unaliased.
    pub async fn begin_zero_downtime_swap(
        &self,
        role: IndexRole,
    ) -> Result<IndexHandle, IndexError> {
        let next = self
            .live_slot(role)
            .await?
            .map(Slot::other)
            .unwrap_or(Slot::First);
        let handle = IndexHandle::slot(role, next);

        if self.engine.index_exists(&handle.name).await? {
            debug!(index = %handle.name, "Removing stale slot");
            self.engine.delete_index(&handle.name).await?;
        }
        self.engine.create_index(&handle.name, &role.mapping()).await?;
        info!(%role, index = %handle.name, "Created slot for rebuild");
        Ok(handle)
    }

    /// Moves the alias from `previous` to `next` in one request, then drops `previous`.
    pub async fn commit_swap(
        &self,
        previous: Option<&IndexHandle>,
        next: &IndexHandle,
        role: IndexRole,
    ) -> Result<(), IndexError> {
        for handle in previous.into_iter().chain(std::iter::once(next)) {
            if handle.role != role || handle.slot.is_none() {
                return Err(IndexError::RoleMismatch {
                    role,
                    index: handle.name.clone(),
                });
            }
        }
        let live = previous
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "nothing".to_string());

        let mut actions = Vec::with_capacity(2);
        if let Some(previous) = previous {
            actions.push(AliasAction::Remove {
                index: previous.name.clone(),
                alias: role.alias().to_string(),
            });
        }
        actions.push(AliasAction::Add {
            index: next.name.clone(),
            alias: role.alias().to_string(),
        });

        let flipped = async {
            self.engine.refresh(&next.name).await?;
            self.engine.update_aliases(&actions).await
        };
        if let Err(e) = flipped.await {
            return Err(IndexError::SwapAborted {
                role,
                live,
                source: Box::new(e.into()),
            });
        }
        info!(%role, from = %live, to = %next.name, "Alias switched");

        if let Some(previous) = previous {
            if let Err(e) = self.engine.delete_index(&previous.name).await {
                warn!(error = %e, index = %previous.name, "Failed to delete previous index");
            }
        }
        Ok(())
    }

    /// Full replacement of a role's data without readers seeing a partial set.
    pub async fn rebuild_zero_downtime(
        &self,
        role: IndexRole,
        features: &[Feature],
    ) -> Result<UpsertSummary, IndexError> {
        let previous = self.current_index(role).await?;
        let next = self.begin_zero_downtime_swap(role).await?;

        let result = async {
            let summary = self.upsert(features, &next).await?;
            self.commit_swap(previous.as_ref(), &next, role).await?;
            Ok::<_, IndexError>(summary)
        }
        .await;

        match result {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.discard(&next).await;
                Err(match e {
                    IndexError::SwapAborted { .. } => e,
                    other => IndexError::SwapAborted {
                        role,
                        live: previous
                            .map(|p| p.name)
                            .unwrap_or_else(|| "nothing".to_string()),
                        source: Box::new(other),
                    },
                })
            }
        }
    }

    /// Drops an unaliased slot left behind by an aborted swap.
    async fn discard(&self, handle: &IndexHandle) {
        match self.engine.get_alias(handle.role.alias()).await {
            Ok(targets) if targets.contains(&handle.name) => {
                warn!(index = %handle.name, "Slot is live, not discarding");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, index = %handle.name, "Cannot verify alias, keeping slot");
                return;
            }
        }
        match self.engine.delete_index(&handle.name).await {
            Ok(()) => info!(index = %handle.name, "Discarded unfinished slot"),
            Err(e) => warn!(error = %e, index = %handle.name, "Failed to discard slot"),
        }
    }

    /// Writes `features` in pages keyed by id. Rejected items are logged and
    /// collected; a batch that keeps failing stops the upsert.
    pub async fn upsert(
        &self,
        features: &[Feature],
        target: &IndexHandle,
    ) -> Result<UpsertSummary, IndexError> {
        let page_size = self.config.page_size.max(1);
        let pb = if self.show_progress {
            make_progress_bar(features.len() as u64, target.role.alias())
        } else {
            ProgressBar::hidden()
        };

        let mut summary = UpsertSummary::default();
        for (batch, page) in features.chunks(page_size).enumerate() {
            let documents = page
                .iter()
                .map(|f| Ok((f.id.clone(), f.to_document()?)))
                .collect::<Result<Vec<_>, FeatureError>>()?;

            let response = self.write_batch(&target.name, batch, &documents).await?;
            for failure in &response.failures {
                warn!(
                    id = %failure.id,
                    status = failure.status,
                    reason = %failure.reason,
                    "Document rejected"
                );
            }

            self.stats.inc_batches();
            self.stats.add_documents(response.succeeded as u64);
            self.stats.add_failed(response.failures.len() as u64);
            summary.batches += 1;
            summary.written += response.succeeded;
            summary.failures.extend(response.failures);
            pb.inc(page.len() as u64);
        }
        pb.finish_and_clear();

        info!(
            index = %target.name,
            batches = summary.batches,
            written = summary.written,
            failed = summary.failures.len(),
            "Upsert complete"
        );
        Ok(summary)
    }

    async fn write_batch(
        &self,
        index: &str,
        batch: usize,
        documents: &[(String, Value)],
    ) -> Result<BulkResponse, IndexError> {
        let attempts = self.config.max_attempts.max(1);
        let timeout = self.config.batch_timeout;

        let mut attempt = 1;
        loop {
            match tokio::time::timeout(timeout, self.engine.bulk_index(index, documents)).await {
                Ok(Ok(response)) => return Ok(response),
                Err(_) => return Err(IndexError::BatchTimeout { batch, timeout }),
                Ok(Err(e)) if attempt < attempts => {
                    warn!(batch, attempt, error = %e, "Bulk request failed, retrying");
                    self.stats.inc_retries();
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Ok(Err(e)) => {
                    return Err(IndexError::BatchFailed {
                        batch,
                        attempts,
                        source: Box::new(e.into()),
                    })
                }
            }
        }
    }

    pub async fn get_by_id(
        &self,
        role: IndexRole,
        id: &str,
    ) -> Result<Option<Feature>, IndexError> {
        match self.engine.get_document(role.alias(), id).await? {
            Some(document) => Ok(Some(Feature::from_document(document)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_by_id(&self, role: IndexRole, id: &str) -> Result<bool, IndexError> {
        let deleted = self.engine.delete_document(role.alias(), id).await?;
        debug!(%role, id, deleted, "Delete by id");
        Ok(deleted)
    }

    /// Soft delete: flags the POI and bumps its modification time.
    pub async fn mark_deleted(&self, id: &str, timestamp: DateTime<Utc>) -> Result<bool, IndexError> {
        let role = IndexRole::PointsOfInterest;
        let Some(mut feature) = self.get_by_id(role, id).await? else {
            return Ok(false);
        };
        feature.set_deleted();
        feature.set_last_modified(timestamp);
        let summary = self
            .upsert(std::slice::from_ref(&feature), &IndexHandle::alias(role))
            .await?;
        Ok(summary.failures.is_empty())
    }

    pub async fn get_all(
        &self,
        role: IndexRole,
        with_deleted: bool,
    ) -> Result<Vec<Feature>, IndexError> {
        let query = json!({ "match_all": {} });
        let query = if with_deleted {
            query
        } else {
            queries::exclude_deleted(query)
        };
        self.scan(role.alias(), query).await
    }

    /// POIs modified after `since`, soft-deleted ones included.
    pub async fn get_updates_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Feature>, IndexError> {
        self.scan(POIS_ALIAS, queries::modified_since(since)).await
    }

    /// Live POIs whose combined ids list any of `ids`, i.e. the survivors
    /// that absorbed those features.
    pub async fn find_absorbing(&self, ids: &[&str]) -> Result<Vec<Feature>, IndexError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = queries::exclude_deleted(queries::combined_ids_filter(ids));
        self.scan(POIS_ALIAS, query).await
    }

    /// Live POIs carrying any of `titles` verbatim in any language.
    pub async fn find_by_titles(
        &self,
        titles: &BTreeSet<String>,
    ) -> Result<Vec<Feature>, IndexError> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }
        let query = queries::exclude_deleted(queries::titles_filter(titles));
        self.scan(POIS_ALIAS, query).await
    }

    /// Caches raw source features; ids are unique across sources.
    pub async fn add_external_pois(
        &self,
        features: &[Feature],
    ) -> Result<UpsertSummary, IndexError> {
        self.upsert(features, &IndexHandle::alias(IndexRole::ExternalPois))
            .await
    }

    pub async fn get_external_pois_by_source(
        &self,
        source: &Source,
    ) -> Result<Vec<Feature>, IndexError> {
        self.scan(EXTERNAL_POIS_ALIAS, queries::source_filter(source))
            .await
    }

    pub async fn get_external_poi_by_id(&self, id: &str) -> Result<Option<Feature>, IndexError> {
        self.get_by_id(IndexRole::ExternalPois, id).await
    }

    /// Drops every cached feature of `source`, returning how many went.
    pub async fn delete_external_pois_by_source(&self, source: &Source) -> Result<usize, IndexError> {
        let cached = self.get_external_pois_by_source(source).await?;
        let mut deleted = 0;
        for feature in &cached {
            if self
                .engine
                .delete_document(EXTERNAL_POIS_ALIAS, &feature.id)
                .await?
            {
                deleted += 1;
            }
        }
        info!(%source, deleted, "Cleared cached source features");
        Ok(deleted)
    }

    async fn scan(&self, index: &str, query: Value) -> Result<Vec<Feature>, IndexError> {
        let body = json!({ "size": SCROLL_PAGE_SIZE, "query": query });
        let mut page = self.engine.search(index, &body, Some(SCROLL_TTL)).await?;
        let mut scroll_id = page.scroll_id.take();
        let mut features = Vec::new();

        while !page.hits.is_empty() {
            for hit in std::mem::take(&mut page.hits) {
                features.push(Feature::from_document(hit.source)?);
            }
            let Some(id) = scroll_id.as_deref() else {
                break;
            };
            page = self.engine.scroll(id, SCROLL_TTL).await?;
            if let Some(next) = page.scroll_id.take() {
                scroll_id = Some(next);
            }
        }

        if let Some(id) = scroll_id {
            if let Err(e) = self.engine.clear_scroll(&id).await {
                warn!(error = %e, "Failed to clear scroll");
            }
        }
        debug!(index, count = features.len(), "Scan complete");
        Ok(features)
    }
}

fn make_progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "    {{spinner:.cyan}} {label:<14} [{{bar:30.cyan/blue}}] {{pos}}/{{len}} documents"
        ))
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
