use std::time::Duration;

/// Number of documents sent per bulk request
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

/// Maximum distance for two features to be considered the same place.
/// Same units as the geometry distance (WGS84 degrees, roughly 1km)
pub const DEFAULT_MERGE_THRESHOLD: f64 = 0.01;

/// Keep-alive for scroll cursors, reset on every page fetch
pub const SCROLL_TTL: &str = "10s";

/// Documents fetched per scroll page
pub const SCROLL_PAGE_SIZE: usize = 10_000;

/// Default time allowed for a single bulk request
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 60;

/// Attempts per bulk batch before the batch is reported as failed
pub const BULK_MAX_ATTEMPTS: u32 = 3;

/// Pause between bulk batch attempts
pub const BULK_RETRY_DELAY_MILLIS: u64 = 500;

pub const DEFAULT_ES_URL: &str = "http://localhost:9200";

/// Alias readers use for points of interest, backed by two physical slots
pub const POIS_ALIAS: &str = "osm_names";
pub const POIS_SLOTS: [&str; 2] = ["osm_names1", "osm_names2"];

pub const HIGHWAYS_ALIAS: &str = "osm_highways";
pub const HIGHWAYS_SLOTS: [&str; 2] = ["osm_highways1", "osm_highways2"];

/// Raw per-source features, cached between adapter runs and never merged
pub const EXTERNAL_POIS_ALIAS: &str = "external_pois";
pub const EXTERNAL_POIS_SLOTS: [&str; 2] = ["external_pois1", "external_pois2"];

/// Raise the default field limit, the attribute bag is wide
pub const INDEX_TOTAL_FIELDS_LIMIT: u32 = 10_000;

/// Number of results returned by name searches
pub const SEARCH_RESULTS: usize = 10;

/// Bump when `SyncState` layout changes
pub const SYNC_STATE_VERSION: u32 = 1;

/// Numeric knobs shared by the merge engine and the index writer
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub merge_threshold: f64,
    pub page_size: usize,
    pub batch_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            page_size: DEFAULT_PAGE_SIZE,
            batch_timeout: Duration::from_secs(DEFAULT_BATCH_TIMEOUT_SECS),
            max_attempts: BULK_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(BULK_RETRY_DELAY_MILLIS),
        }
    }
}
