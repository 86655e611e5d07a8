//! Source gateways: where merge input comes from.
//!
//! Each adapter dump is a GeoJSON feature collection; the adapters themselves
//! (OSM, Wikipedia, biblical sites, off-road) run elsewhere.

use crate::models::{Feature, Source};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geojson::GeoJson;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[async_trait]
pub trait SourceGateway: Send + Sync {
    fn source(&self) -> Source;

    async fn get_all(&self) -> Result<Vec<Feature>>;

    /// Features modified after `since`. Features without a timestamp are skipped.
    async fn get_updates_since(&self, since: DateTime<Utc>) -> Result<Vec<Feature>> {
        let all = self.get_all().await?;
        Ok(all
            .into_iter()
            .filter(|f| f.last_modified().is_some_and(|t| t > since))
            .collect())
    }
}

/// Reads one adapter's GeoJSON dump.
pub struct GeoJsonFileGateway {
    source: Source,
    path: PathBuf,
}

impl GeoJsonFileGateway {
    pub fn new(source: Source, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
        }
    }

    /// Parses `SOURCE=PATH` as given on the command line.
    pub fn from_arg(arg: &str) -> Result<Self> {
        let Some((source, path)) = arg.split_once('=') else {
            bail!("Expected SOURCE=PATH, got '{arg}'");
        };
        if source.trim().is_empty() || path.trim().is_empty() {
            bail!("Expected SOURCE=PATH, got '{arg}'");
        }
        Ok(Self::new(Source::from(source.trim()), path.trim()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceGateway for GeoJsonFileGateway {
    fn source(&self) -> Source {
        self.source.clone()
    }

    async fn get_all(&self) -> Result<Vec<Feature>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read source file: {:?}", self.path))?;
        let geojson: GeoJson = content
            .parse()
            .with_context(|| format!("Invalid GeoJSON in {:?}", self.path))?;

        let raw = match geojson {
            GeoJson::FeatureCollection(collection) => collection.features,
            GeoJson::Feature(feature) => vec![feature],
            GeoJson::Geometry(_) => bail!("{:?} holds a bare geometry", self.path),
        };

        let mut features = Vec::with_capacity(raw.len());
        for (position, item) in raw.into_iter().enumerate() {
            let mut feature = Feature::from_geojson(item, Some(&self.source)).with_context(|| {
                format!("Invalid feature #{position} in {:?}", self.path)
            })?;
            if feature.titles().is_empty() {
                feature.set_titles_from_names();
            }
            feature.set_location();
            features.push(feature);
        }

        debug!(source = %self.source, count = features.len(), "Read source file");
        Ok(features)
    }
}

/// Concatenates every gateway's features in the order given.
pub async fn fetch_all(gateways: &[Box<dyn SourceGateway>]) -> Result<Vec<Feature>> {
    let mut features = Vec::new();
    for gateway in gateways {
        let batch = gateway
            .get_all()
            .await
            .with_context(|| format!("Failed to fetch {}", gateway.source()))?;
        info!(source = %gateway.source(), count = batch.len(), "Fetched features");
        features.extend(batch);
    }
    Ok(features)
}

pub async fn fetch_updates_since(
    gateways: &[Box<dyn SourceGateway>],
    since: DateTime<Utc>,
) -> Result<Vec<Feature>> {
    let mut features = Vec::new();
    for gateway in gateways {
        let batch = gateway
            .get_updates_since(since)
            .await
            .with_context(|| format!("Failed to fetch updates from {}", gateway.source()))?;
        info!(source = %gateway.source(), count = batch.len(), %since, "Fetched updates");
        features.extend(batch);
    }
    Ok(features)
}

/// Writes `features` as one GeoJSON feature collection, replacing `path` atomically.
pub fn write_feature_collection(path: &Path, features: &[Feature]) -> Result<()> {
    let documents = features
        .iter()
        .map(Feature::to_document)
        .collect::<Result<Vec<Value>, _>>()?;
    let collection = json!({ "type": "FeatureCollection", "features": documents });

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let tmp_path = path.with_extension("geojson.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create output file: {:?}", tmp_path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &collection)
        .context("Failed to write feature collection")?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush output file: {:?}", tmp_path))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename output file: {:?}", path))?;

    info!(path = ?path, count = features.len(), "Wrote feature collection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::keys;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const DUMP: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [35.35, 31.31] },
                "properties": {
                    "identifier": "Wikipedia_en_Masada",
                    "name": "Masada",
                    "name:he": "מצדה",
                    "poiCategory": "Historic",
                    "poiIcon": "icon-ruins",
                    "poiSearchFactor": 1.0,
                    "poiLastModified": "2024-03-01T00:00:00+00:00"
                }
            },
            {
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [35.0, 31.0] },
                "properties": {
                    "identifier": "Wikipedia_en_Arad",
                    "poiSource": "OSM",
                    "name": "Arad"
                }
            }
        ]
    }"#;

    fn write_dump(dir: &TempDir) -> Result<PathBuf> {
        let path = dir.path().join("wikipedia.geojson");
        fs::write(&path, DUMP)?;
        Ok(path)
    }

    #[tokio::test]
    async fn reads_features_with_default_source() -> Result<()> {
        let dir = TempDir::new()?;
        let gateway = GeoJsonFileGateway::new(Source::Wikipedia, write_dump(&dir)?);
        let features = gateway.get_all().await?;

        assert_eq!(features.len(), 2);
        assert_eq!(features[0].source, Source::Wikipedia);
        assert_eq!(features[1].source, Source::Osm);
        assert!(features[0].titles().contains("מצדה"));
        assert_eq!(features[0].geolocation(), Some((31.31, 35.35)));
        assert!(features[0].attribute(keys::ID).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn updates_skip_features_without_timestamp() -> Result<()> {
        let dir = TempDir::new()?;
        let gateway = GeoJsonFileGateway::new(Source::Wikipedia, write_dump(&dir)?);
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let updates = gateway.get_updates_since(since).await?;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "Wikipedia_en_Masada");
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_reports_path() -> Result<()> {
        let gateway = GeoJsonFileGateway::new(Source::Osm, "/nonexistent/osm.geojson");
        let err = match gateway.get_all().await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(format!("{err:#}").contains("osm.geojson"));
        Ok(())
    }

    #[test]
    fn parses_source_argument() -> Result<()> {
        let gateway = GeoJsonFileGateway::from_arg("off-road=/data/offroad.geojson")?;
        assert_eq!(gateway.source(), Source::OffRoad);
        assert_eq!(gateway.path(), Path::new("/data/offroad.geojson"));
        assert!(GeoJsonFileGateway::from_arg("no-separator").is_err());
        assert!(GeoJsonFileGateway::from_arg("=path").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn written_collection_reads_back() -> Result<()> {
        let dir = TempDir::new()?;
        let gateway = GeoJsonFileGateway::new(Source::Wikipedia, write_dump(&dir)?);
        let features = gateway.get_all().await?;

        let out = dir.path().join("out").join("merged.geojson");
        write_feature_collection(&out, &features)?;
        let again = GeoJsonFileGateway::new(Source::Other("x".into()), &out)
            .get_all()
            .await?;
        assert_eq!(again, features);
        Ok(())
    }

    #[test]
    fn overwrite_is_complete_and_leaves_no_temp_file() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("merged.geojson");
        fs::write(&out, "stale")?;

        let features: Vec<Feature> = (0..500)
            .map(|i| {
                Feature::new(
                    format!("node_{i}"),
                    Source::Osm,
                    geo::Geometry::Point(geo::point!(x: 35.0, y: 31.0)),
                )
                .with_attribute(keys::NAME, "x".repeat(64))
            })
            .collect();
        write_feature_collection(&out, &features)?;

        assert!(!out.with_extension("geojson.tmp").exists());
        let written: Value = serde_json::from_str(&fs::read_to_string(&out)?)?;
        assert_eq!(written["features"].as_array().map(Vec::len), Some(500));
        Ok(())
    }
}
