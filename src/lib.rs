//! POI Fusion: cross-source point-of-interest merging and zero-downtime indexing
//!
//! This crate takes the features produced by several independent sources (OSM,
//! Wikipedia, biblical archaeology sites, off-road trails), decides which ones
//! describe the same place, and publishes the merged set to Elasticsearch:
//!
//! 1. **Fetch** -- Read each source adapter's GeoJSON dump through a [`sources::SourceGateway`]
//! 2. **Validate** -- Reject the run on the first feature missing a required attribute
//! 3. **Merge** -- Wikipedia join, KKL route join and title-based merge, then
//!    geometry collections are collapsed
//! 4. **Index** -- Bulk write into the idle slot of a dual-index pair and flip the
//!    alias in one request, so readers see either the old or the new dataset
//!
//! # Architecture
//!
//! - **Pure merge** -- The merge engine performs no I/O; decisions go to a
//!   [`report::ReportSink`] that never fails the merge
//! - **Indexed arena** -- Title buckets hold positions into one `Vec<Feature>`,
//!   survivors are replaced by value
//! - **Engine trait** -- [`search::SearchEngine`] is implemented over HTTP and in
//!   memory; the in-memory engine drives `--dry-run` and the swap tests
//! - **Retrying batches** -- Bulk pages are retried with a fixed delay and bounded
//!   by a per-batch timeout; rejected items are collected, not fatal
//! - **Incremental sync** -- The last sync time is persisted atomically for `update`
//!
//! # Key Modules
//!
//! - [`models`] -- Feature type, attribute keys, validation and GeoJSON documents
//! - [`geometry`] -- Distance, containment, collections and their simplification
//! - [`merge`] -- The three merge passes
//! - [`report`] -- Merge decision sinks (tracing, CSV, memory)
//! - [`search`] -- Search engine capability and its error type
//! - [`elastic`] -- Elasticsearch REST client
//! - [`memory`] -- In-process search engine
//! - [`index`] -- Paged upserts and the alias swap protocol
//! - [`queries`] -- Query builders and the read facade
//! - [`sources`] -- Source gateways and GeoJSON output
//! - [`sync_state`] -- Last sync bookkeeping
//! - [`pipeline`] -- Rebuild and update orchestration
//! - [`stats`] -- Merge and indexing counters
//! - [`config`] -- Defaults and tunables
//!
//! # Example Usage
//!
//! ```bash
//! # Merge dumps into one file with an audit report
//! poi-fusion merge -i osm=osm.geojson -i wikipedia=wiki.geojson -o merged.geojson --report merges.csv
//!
//! # Rebuild the live indices
//! poi-fusion rebuild -i osm=osm.geojson -i wikipedia=wiki.geojson --highways highways.geojson
//!
//! # Push changes since the last rebuild
//! poi-fusion update -i osm=osm.geojson -i wikipedia=wiki.geojson
//! ```

pub mod config;
pub mod elastic;
pub mod geometry;
pub mod index;
pub mod memory;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod queries;
pub mod report;
pub mod search;
pub mod sources;
pub mod stats;
pub mod sync_state;
