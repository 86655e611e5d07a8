//! Tests for the dual-slot rebuild protocol against the in-memory engine.
//!
//! These cover what readers of the alias observe while a rebuild runs:
//!
//! - **Atomic flip** -- a concurrent reader sees the old count or the new count
//! - **Aborted populate** -- the previous slot stays live and the new one is dropped
//! - **Retries** -- transient bulk failures are retried, rejected items collected
//! - **Sync cycle** -- rebuild from files, then an incremental update
//! - **Survivors** -- an updated feature folds back into the POI that absorbed it

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use geo::{point, Geometry};
use poi_fusion::config::PipelineConfig;
use poi_fusion::index::{IndexError, IndexRole, IndexWriter, Slot};
use poi_fusion::memory::MemoryEngine;
use poi_fusion::models::{keys, Feature, Source, Titles};
use poi_fusion::pipeline::Pipeline;
use poi_fusion::report::MemoryReportSink;
use poi_fusion::search::SearchEngine;
use poi_fusion::sources::{self, GeoJsonFileGateway, SourceGateway};
use poi_fusion::sync_state::{state_path, SyncState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const POIS: &str = "osm_names";

fn poi(n: usize) -> Feature {
    let mut feature = Feature::new(
        format!("node_{n}"),
        Source::Osm,
        Geometry::Point(point!(x: 35.0 + n as f64, y: 31.0)),
    )
    .with_attribute(keys::CATEGORY, "Historic")
    .with_attribute(keys::ICON, "icon-ruins")
    .with_attribute(keys::SEARCH_FACTOR, 1.0);
    let mut titles = Titles::new();
    titles.insert("en".to_string(), vec![format!("Place {n}")]);
    feature.set_titles(&titles);
    feature
}

fn pois(range: std::ops::Range<usize>) -> Vec<Feature> {
    range.map(poi).collect()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        page_size: 2,
        max_attempts: 2,
        retry_delay: Duration::from_millis(1),
        batch_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn seeded(engine: &MemoryEngine, config: &PipelineConfig) -> Result<IndexWriter<MemoryEngine>> {
    let writer = IndexWriter::new(engine.clone(), config);
    writer.initialize().await?;
    writer
        .rebuild_zero_downtime(IndexRole::PointsOfInterest, &pois(0..5))
        .await?;
    Ok(writer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_reader_sees_old_or_new_count() -> Result<()> {
    let engine = MemoryEngine::new();
    let writer = seeded(&engine, &config()).await?;
    assert_eq!(engine.count(POIS).await?, 5);

    engine.set_bulk_delay(Duration::from_millis(10));
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let engine = engine.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut observed = Vec::new();
            while !done.load(Ordering::SeqCst) {
                observed.push(engine.count(POIS).await?);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            observed.push(engine.count(POIS).await?);
            Ok::<_, poi_fusion::search::EngineError>(observed)
        })
    };

    let summary = writer
        .rebuild_zero_downtime(IndexRole::PointsOfInterest, &pois(0..9))
        .await?;
    done.store(true, Ordering::SeqCst);
    let observed = reader.await??;

    assert_eq!(summary.written, 9);
    assert_eq!(summary.batches, 5);
    assert!(observed.len() > 1);
    assert!(observed.iter().all(|&c| c == 5 || c == 9), "{observed:?}");
    assert_eq!(observed.last(), Some(&9));
    Ok(())
}

#[tokio::test]
async fn failed_populate_keeps_previous_slot_live() -> Result<()> {
    let engine = MemoryEngine::new();
    let config = config();
    let writer = seeded(&engine, &config).await?;
    assert_eq!(
        writer.live_slot(IndexRole::PointsOfInterest).await?,
        Some(Slot::Second)
    );

    engine.inject_bulk_failures(config.max_attempts as usize);
    let err = writer
        .rebuild_zero_downtime(IndexRole::PointsOfInterest, &pois(10..20))
        .await
        .err()
        .expect("rebuild should fail");

    match err {
        IndexError::SwapAborted { live, source, .. } => {
            assert_eq!(live, "osm_names2");
            assert!(matches!(*source, IndexError::BatchFailed { attempts: 2, .. }));
        }
        other => panic!("expected aborted swap, got {other:?}"),
    }
    assert_eq!(
        writer.live_slot(IndexRole::PointsOfInterest).await?,
        Some(Slot::Second)
    );
    assert_eq!(engine.count(POIS).await?, 5);
    assert!(!engine.indices().contains(&"osm_names1".to_string()));
    Ok(())
}

#[tokio::test]
async fn slow_batch_aborts_without_retry() -> Result<()> {
    let engine = MemoryEngine::new();
    let config = PipelineConfig {
        batch_timeout: Duration::from_millis(20),
        ..config()
    };
    let writer = seeded(&engine, &config).await?;

    engine.set_bulk_delay(Duration::from_millis(200));
    let err = writer
        .rebuild_zero_downtime(IndexRole::PointsOfInterest, &pois(0..3))
        .await
        .err()
        .expect("rebuild should time out");

    match err {
        IndexError::SwapAborted { source, .. } => {
            assert!(matches!(*source, IndexError::BatchTimeout { batch: 0, .. }));
        }
        other => panic!("expected aborted swap, got {other:?}"),
    }
    assert_eq!(writer.stats().retries(), 0);
    assert_eq!(engine.count(POIS).await?, 5);
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried() -> Result<()> {
    let engine = MemoryEngine::new();
    let config = config();
    let writer = seeded(&engine, &config).await?;

    engine.inject_bulk_failures(1);
    let summary = writer
        .rebuild_zero_downtime(IndexRole::PointsOfInterest, &pois(0..4))
        .await?;
    assert_eq!(summary.written, 4);
    assert_eq!(writer.stats().retries(), 1);
    assert_eq!(
        writer.live_slot(IndexRole::PointsOfInterest).await?,
        Some(Slot::First)
    );
    Ok(())
}

#[tokio::test]
async fn rejected_items_do_not_block_the_swap() -> Result<()> {
    let engine = MemoryEngine::new();
    let writer = seeded(&engine, &config()).await?;

    engine.reject_document("node_2");
    let summary = writer
        .rebuild_zero_downtime(IndexRole::PointsOfInterest, &pois(0..6))
        .await?;
    assert_eq!(summary.written, 5);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].id, "node_2");
    assert_eq!(summary.failures[0].status, 400);
    assert_eq!(engine.count(POIS).await?, 5);
    assert!(writer
        .get_by_id(IndexRole::PointsOfInterest, "node_2")
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn rebuild_then_incremental_update_from_files() -> Result<()> {
    let dir = TempDir::new()?;
    let dump = dir.path().join("osm.geojson");
    let state = state_path(dir.path());

    let old = Utc::now() - ChronoDuration::days(1);
    let mut initial = pois(0..4);
    for feature in &mut initial {
        feature.set_last_modified(old);
    }
    sources::write_feature_collection(&dump, &initial)?;

    let engine = MemoryEngine::new();
    let config = config();
    let writer = IndexWriter::new(engine.clone(), &config);
    writer.initialize().await?;
    let report = MemoryReportSink::new();
    let pipeline = Pipeline::new(&writer, &config, &report);
    let gateways: Vec<Box<dyn SourceGateway>> =
        vec![Box::new(GeoJsonFileGateway::new(Source::Osm, &dump))];

    // nothing to update from yet
    assert!(pipeline.sync_update(&gateways, &state).await.is_err());

    let summary = pipeline.sync_rebuild(&gateways, None, &state).await?;
    assert_eq!(summary.pois.written, 4);
    let recorded = SyncState::load(&state)?.expect("state saved");
    assert_eq!(recorded.pois_indexed, 4);
    assert!(recorded.last_update.is_none());

    let mut changed = poi(9);
    changed.set_last_modified(Utc::now() + ChronoDuration::hours(1));
    initial.push(changed);
    sources::write_feature_collection(&dump, &initial)?;

    let update = pipeline.sync_update(&gateways, &state).await?;
    assert_eq!(update.written, 1);
    assert_eq!(engine.count(POIS).await?, 5);
    assert!(SyncState::load(&state)?
        .and_then(|s| s.last_update)
        .is_some());
    Ok(())
}

fn masada(id: &str, source: Source, x: f64) -> Feature {
    let mut feature = Feature::new(id, source, Geometry::Point(point!(x: x, y: 31.31)))
        .with_attribute(keys::CATEGORY, "Historic")
        .with_attribute(keys::ICON, "icon-ruins")
        .with_attribute(keys::SEARCH_FACTOR, 1.0)
        .with_attribute("wikipedia:en", "Masada");
    let mut titles = Titles::new();
    titles.insert("en".to_string(), vec!["Masada".to_string()]);
    feature.set_titles(&titles);
    feature
}

#[tokio::test]
async fn updated_article_stays_inside_its_survivor() -> Result<()> {
    let engine = MemoryEngine::new();
    let config = config();
    let writer = IndexWriter::new(engine.clone(), &config);
    writer.initialize().await?;
    let report = MemoryReportSink::new();
    let pipeline = Pipeline::new(&writer, &config, &report);

    let now = Utc::now();
    pipeline
        .rebuild_indices(
            vec![
                masada("node_1", Source::Osm, 35.35),
                masada("Wikipedia_en_Masada", Source::Wikipedia, 35.36),
            ],
            None,
            now,
        )
        .await?;
    assert_eq!(engine.count(POIS).await?, 1);

    // the article was edited upstream and comes back as an update
    let mut edited = masada("Wikipedia_en_Masada", Source::Wikipedia, 35.36);
    edited.set_last_modified(now + ChronoDuration::hours(1));
    let summary = pipeline
        .incremental_update(vec![edited], now + ChronoDuration::hours(1))
        .await?;
    assert_eq!(summary.written, 1);

    let live = writer.get_all(IndexRole::PointsOfInterest, false).await?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "node_1");
    assert_eq!(live[0].combined_ids(), vec!["Wikipedia_en_Masada"]);
    assert!(writer
        .get_by_id(IndexRole::PointsOfInterest, "Wikipedia_en_Masada")
        .await?
        .is_none());
    Ok(())
}
