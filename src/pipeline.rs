//! Source → validate → merge → index, for full rebuilds and incremental updates.

use crate::config::PipelineConfig;
use crate::index::{IndexError, IndexHandle, IndexRole, IndexWriter, UpsertSummary};
use crate::merge::{feature_ids, merge_features, simplify_geometries, FeaturesMerger};
use crate::models::{validate_features, Feature, FeatureError, Source};
use crate::report::{MergeDecision, ReportSink};
use crate::search::SearchEngine;
use crate::sources::{self, SourceGateway};
use crate::stats::MergeStats;
use crate::sync_state::SyncState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct RebuildSummary {
    pub merge: MergeStats,
    pub pois: UpsertSummary,
    pub highways: Option<UpsertSummary>,
}

/// Validates every feature, then merges. The first contract violation aborts.
pub fn merge_checked(
    features: Vec<Feature>,
    config: &PipelineConfig,
    report: &dyn ReportSink,
) -> Result<(Vec<Feature>, MergeStats), FeatureError> {
    validate_features(&features)?;
    Ok(FeaturesMerger::new(config.merge_threshold, report).merge_with_stats(features))
}

/// The indexed copy of a feature, or its pending replacement when this run
/// already changed it.
fn take_pending(outgoing: &mut Vec<Feature>, indexed: Feature) -> Feature {
    match outgoing.iter().position(|f| f.id == indexed.id) {
        Some(position) => outgoing.swap_remove(position),
        None => indexed,
    }
}

/// Gives features without a modification time the run's timestamp.
fn stamp(features: &mut [Feature], now: DateTime<Utc>) {
    for feature in features.iter_mut().filter(|f| f.last_modified().is_none()) {
        feature.set_last_modified(now);
    }
}

pub struct Pipeline<'a, E: SearchEngine> {
    writer: &'a IndexWriter<E>,
    config: &'a PipelineConfig,
    report: &'a dyn ReportSink,
}

impl<'a, E: SearchEngine> Pipeline<'a, E> {
    pub fn new(
        writer: &'a IndexWriter<E>,
        config: &'a PipelineConfig,
        report: &'a dyn ReportSink,
    ) -> Self {
        Self {
            writer,
            config,
            report,
        }
    }

    /// Replaces both roles' data; highways are left alone when `None`.
    pub async fn rebuild_indices(
        &self,
        features: Vec<Feature>,
        highways: Option<Vec<Feature>>,
        now: DateTime<Utc>,
    ) -> Result<RebuildSummary> {
        let (mut merged, merge) = merge_checked(features, self.config, self.report)
            .context("Source data failed validation")?;
        stamp(&mut merged, now);

        let pois = self
            .writer
            .rebuild_zero_downtime(IndexRole::PointsOfInterest, &merged)
            .await
            .context("Failed to rebuild points of interest")?;

        let highways = match highways {
            Some(mut highways) => {
                stamp(&mut highways, now);
                Some(
                    self.writer
                        .rebuild_zero_downtime(IndexRole::Highways, &highways)
                        .await
                        .context("Failed to rebuild highways")?,
                )
            }
            None => None,
        };

        info!(
            merged = merge.total_merged(),
            pois = pois.written,
            failed = pois.failures.len(),
            "Rebuild complete"
        );
        Ok(RebuildSummary {
            merge,
            pois,
            highways,
        })
    }

    /// Merges a batch of changed features, then folds each one into the
    /// indexed POIs before upserting through the alias.
    ///
    /// An update some indexed survivor already absorbed refreshes that
    /// survivor instead of reappearing on its own. An update sharing a title
    /// with a mergeable indexed POI joins it. Only survivors are written, and
    /// features absorbed here lose their standalone documents.
    pub async fn incremental_update(
        &self,
        updates: Vec<Feature>,
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let incoming = feature_ids(&updates);
        let (mut merged, _) = merge_checked(updates, self.config, self.report)
            .context("Updated data failed validation")?;
        stamp(&mut merged, now);

        let mut absorbed: BTreeSet<String> = incoming
            .difference(&feature_ids(&merged))
            .cloned()
            .collect();
        let merger = FeaturesMerger::new(self.config.merge_threshold, self.report);
        let mut outgoing: Vec<Feature> = Vec::with_capacity(merged.len());
        for update in merged {
            self.fold_update(&merger, update, now, &mut outgoing, &mut absorbed)
                .await
                .context("Failed to look up indexed points of interest")?;
        }
        simplify_geometries(&mut outgoing);
        outgoing.retain(|f| !absorbed.contains(&f.id));

        let role = IndexRole::PointsOfInterest;
        let summary = self
            .writer
            .upsert(&outgoing, &IndexHandle::alias(role))
            .await
            .context("Failed to upsert updates")?;
        for id in &absorbed {
            self.writer
                .delete_by_id(role, id)
                .await
                .with_context(|| format!("Failed to remove absorbed {id}"))?;
        }

        info!(
            written = summary.written,
            absorbed = absorbed.len(),
            "Incremental update complete"
        );
        Ok(summary)
    }

    async fn fold_update(
        &self,
        merger: &FeaturesMerger<'_>,
        mut update: Feature,
        now: DateTime<Utc>,
        outgoing: &mut Vec<Feature>,
        absorbed: &mut BTreeSet<String>,
    ) -> Result<(), IndexError> {
        // A survivor keeps what it absorbed when its own source data changes.
        if let Some(indexed) = self
            .writer
            .get_by_id(IndexRole::PointsOfInterest, &update.id)
            .await?
        {
            update.add_combined_ids(indexed.combined_ids());
        }

        let ids = update.absorbed_ids();
        let pending = outgoing.iter().position(|f| {
            f.id != update.id && f.combined_ids().iter().any(|id| ids.contains(id))
        });
        let holder = match pending {
            Some(position) => Some(outgoing.swap_remove(position)),
            None => {
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                self.writer
                    .find_absorbing(&refs)
                    .await?
                    .into_iter()
                    .find(|indexed| indexed.id != update.id)
                    .map(|indexed| take_pending(outgoing, indexed))
            }
        };
        if let Some(holder) = holder {
            debug!(id = %update.id, survivor = %holder.id, "Update refreshes its survivor");
            absorbed.insert(update.id.clone());
            outgoing.push(self.absorb_into(holder, &update, now));
            return Ok(());
        }

        let titles = update.titles();
        let mut candidates: Vec<Feature> = outgoing
            .iter()
            .filter(|f| f.id != update.id && !f.titles().is_disjoint(&titles))
            .cloned()
            .collect();
        for indexed in self.writer.find_by_titles(&titles).await? {
            if indexed.id != update.id
                && !absorbed.contains(&indexed.id)
                && !candidates.iter().any(|c| c.id == indexed.id)
            {
                candidates.push(indexed);
            }
        }
        // Same precedence as the title merge: OSM first, then by id.
        candidates.sort_by(|a, b| {
            (a.source != Source::Osm, &a.id).cmp(&(b.source != Source::Osm, &b.id))
        });

        let Some(target) = candidates
            .into_iter()
            .find(|candidate| merger.can_merge(candidate, &update))
        else {
            outgoing.retain(|f| f.id != update.id);
            outgoing.push(update);
            return Ok(());
        };

        let target = take_pending(outgoing, target);
        let survivor = if update.source == Source::Osm && target.source != Source::Osm {
            absorbed.insert(target.id.clone());
            self.absorb_into(update, &target, now)
        } else {
            absorbed.insert(update.id.clone());
            self.absorb_into(target, &update, now)
        };
        outgoing.retain(|f| f.id != survivor.id);
        outgoing.push(survivor);
        Ok(())
    }

    fn absorb_into(&self, survivor: Feature, loser: &Feature, now: DateTime<Utc>) -> Feature {
        let mut merged = merge_features(&survivor, loser);
        self.report.record(&MergeDecision::new(loser, &merged));
        merged.set_last_modified(now);
        merged
    }

    /// Full rebuild from gateways, recorded in the sync state at `state_path`.
    pub async fn sync_rebuild(
        &self,
        gateways: &[Box<dyn SourceGateway>],
        highways: Option<&dyn SourceGateway>,
        state_path: &Path,
    ) -> Result<RebuildSummary> {
        let started = Utc::now();
        let features = sources::fetch_all(gateways).await?;
        let highways = match highways {
            Some(gateway) => Some(gateway.get_all().await.context("Failed to fetch highways")?),
            None => None,
        };

        let summary = self.rebuild_indices(features, highways, started).await?;

        let mut state = SyncState::load(state_path)?.unwrap_or_default();
        state.record_rebuild(started, summary.pois.written as u64);
        state.save(state_path)?;
        Ok(summary)
    }

    /// Upserts what changed since the last recorded sync, then records it.
    pub async fn sync_update(
        &self,
        gateways: &[Box<dyn SourceGateway>],
        state_path: &Path,
    ) -> Result<UpsertSummary> {
        let (mut state, started, summary) = self.update_since_last_sync(gateways, state_path).await?;
        state.record_update(started, summary.written as u64);
        state.save(state_path)?;
        Ok(summary)
    }

    /// Same as [`Self::sync_update`] but leaves the sync state untouched.
    pub async fn preview_update(
        &self,
        gateways: &[Box<dyn SourceGateway>],
        state_path: &Path,
    ) -> Result<UpsertSummary> {
        let (_, _, summary) = self.update_since_last_sync(gateways, state_path).await?;
        Ok(summary)
    }

    async fn update_since_last_sync(
        &self,
        gateways: &[Box<dyn SourceGateway>],
        state_path: &Path,
    ) -> Result<(SyncState, DateTime<Utc>, UpsertSummary)> {
        let state = SyncState::load(state_path)?.unwrap_or_default();
        let since = state
            .last_sync()
            .with_context(|| format!("No previous sync recorded in {:?}, run rebuild first", state_path))?;

        let started = Utc::now();
        let updates = sources::fetch_updates_since(gateways, since).await?;
        let summary = self.incremental_update(updates, started).await?;
        Ok((state, started, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use crate::models::{keys, Source, Titles};
    use crate::report::MemoryReportSink;
    use geo::{point, Geometry};

    fn poi(id: &str, source: Source, title: &str) -> Feature {
        let mut feature = Feature::new(id, source, Geometry::Point(point!(x: 35.0, y: 31.0)))
            .with_attribute(keys::CATEGORY, "Historic")
            .with_attribute(keys::ICON, "icon-ruins")
            .with_attribute(keys::SEARCH_FACTOR, 1.0);
        let mut titles = Titles::new();
        titles.insert("en".to_string(), vec![title.to_string()]);
        feature.set_titles(&titles);
        feature
    }

    #[test]
    fn merge_checked_stops_at_first_violation() {
        let report = MemoryReportSink::new();
        let broken = Feature::new("node_2", Source::Osm, Geometry::Point(point!(x: 35.0, y: 31.0)));
        let result = merge_checked(
            vec![poi("node_1", Source::Osm, "A"), broken],
            &PipelineConfig::default(),
            &report,
        );
        match result {
            Err(FeatureError::MissingAttribute { id, key }) => {
                assert_eq!(id, "node_2");
                assert_eq!(key, keys::CATEGORY);
            }
            other => panic!("expected missing attribute, got {other:?}"),
        }
        assert!(report.decisions().is_empty());
    }

    #[tokio::test]
    async fn rebuild_merges_and_stamps() -> Result<()> {
        let engine = MemoryEngine::new();
        let config = PipelineConfig::default();
        let writer = IndexWriter::new(engine.clone(), &config);
        let report = MemoryReportSink::new();
        let pipeline = Pipeline::new(&writer, &config, &report);

        let now = Utc::now();
        let summary = pipeline
            .rebuild_indices(
                vec![
                    poi("node_1", Source::Osm, "Tel Arad"),
                    poi("w1", Source::Wikipedia, "Tel Arad"),
                ],
                None,
                now,
            )
            .await?;
        assert_eq!(summary.merge.title_merged, 1);
        assert_eq!(summary.pois.written, 1);
        assert!(summary.highways.is_none());

        let stored = writer
            .get_by_id(IndexRole::PointsOfInterest, "node_1")
            .await?
            .context("node_1 missing")?;
        assert_eq!(stored.combined_ids(), vec!["w1"]);
        assert!(stored.last_modified().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn update_joins_indexed_poi_with_same_title() -> Result<()> {
        let engine = MemoryEngine::new();
        let config = PipelineConfig::default();
        let writer = IndexWriter::new(engine.clone(), &config);
        let report = MemoryReportSink::new();
        let pipeline = Pipeline::new(&writer, &config, &report);
        let now = Utc::now();
        pipeline
            .rebuild_indices(
                vec![
                    poi("w1", Source::Wikipedia, "Tel Arad"),
                    poi("node_2", Source::Osm, "Tel Lachish"),
                ],
                None,
                now,
            )
            .await?;

        // a new wikipedia article joins the indexed one
        pipeline
            .incremental_update(vec![poi("w2", Source::Wikipedia, "Tel Arad")], now)
            .await?;
        let role = IndexRole::PointsOfInterest;
        assert!(writer.get_by_id(role, "w2").await?.is_none());
        let arad = writer.get_by_id(role, "w1").await?.context("w1 missing")?;
        assert_eq!(arad.combined_ids(), vec!["w2"]);

        // an OSM node takes over the indexed non-OSM survivor and its ids
        pipeline
            .incremental_update(vec![poi("node_1", Source::Osm, "Tel Arad")], now)
            .await?;
        assert!(writer.get_by_id(role, "w1").await?.is_none());
        let arad = writer.get_by_id(role, "node_1").await?.context("node_1 missing")?;
        assert_eq!(arad.combined_ids(), vec!["w1", "w2"]);
        assert_eq!(writer.get_all(role, false).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn updated_survivor_keeps_absorbed_ids() -> Result<()> {
        let engine = MemoryEngine::new();
        let config = PipelineConfig::default();
        let writer = IndexWriter::new(engine.clone(), &config);
        let report = MemoryReportSink::new();
        let pipeline = Pipeline::new(&writer, &config, &report);
        let now = Utc::now();
        pipeline
            .rebuild_indices(
                vec![
                    poi("node_1", Source::Osm, "Tel Arad"),
                    poi("w1", Source::Wikipedia, "Tel Arad"),
                ],
                None,
                now,
            )
            .await?;

        let renamed = poi("node_1", Source::Osm, "Tel Arad National Park");
        let summary = pipeline.incremental_update(vec![renamed], now).await?;
        assert_eq!(summary.written, 1);
        let stored = writer
            .get_by_id(IndexRole::PointsOfInterest, "node_1")
            .await?
            .context("node_1 missing")?;
        assert_eq!(stored.combined_ids(), vec!["w1"]);
        assert!(stored.titles().contains("Tel Arad National Park"));
        Ok(())
    }

    #[tokio::test]
    async fn preview_update_leaves_sync_state_alone() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let dump = dir.path().join("osm.geojson");
        let state = crate::sync_state::state_path(dir.path());

        let engine = MemoryEngine::new();
        let config = PipelineConfig::default();
        let writer = IndexWriter::new(engine.clone(), &config);
        writer.initialize().await?;
        let report = MemoryReportSink::new();
        let pipeline = Pipeline::new(&writer, &config, &report);
        let gateways: Vec<Box<dyn SourceGateway>> =
            vec![Box::new(sources::GeoJsonFileGateway::new(Source::Osm, &dump))];

        let mut changed = poi("node_1", Source::Osm, "Tel Arad");
        changed.set_last_modified(Utc::now() + chrono::Duration::hours(1));
        sources::write_feature_collection(&dump, &[changed])?;

        // no recorded sync yet
        assert!(pipeline.preview_update(&gateways, &state).await.is_err());
        assert!(!state.exists());

        let mut recorded = SyncState::default();
        recorded.record_rebuild(Utc::now() - chrono::Duration::days(1), 0);
        recorded.save(&state)?;
        let before = std::fs::read(&state)?;

        let summary = pipeline.preview_update(&gateways, &state).await?;
        assert_eq!(summary.written, 1);
        assert_eq!(std::fs::read(&state)?, before);
        assert_eq!(SyncState::load(&state)?, Some(recorded));
        Ok(())
    }
}
