use chrono::{DateTime, Utc};
use geo::{Centroid, Geometry};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Attribute keys with a meaning to the pipeline
pub mod keys {
    pub const ID: &str = "identifier";
    pub const SOURCE: &str = "poiSource";
    pub const CATEGORY: &str = "poiCategory";
    pub const ICON: &str = "poiIcon";
    pub const ICON_COLOR: &str = "poiIconColor";
    pub const SEARCH_FACTOR: &str = "poiSearchFactor";
    pub const NAMES: &str = "poiNames";
    pub const LAST_MODIFIED: &str = "poiLastModified";
    pub const COMBINED_IDS: &str = "poiCombinedIds";
    pub const DELETED: &str = "poiDeleted";
    pub const GEOLOCATION: &str = "poiGeolocation";
    pub const CONTAINER: &str = "poiContainer";
    pub const LANGUAGE: &str = "poiLanguage";
    pub const WEBSITE: &str = "website";
    pub const NAME: &str = "name";
    pub const WIKIPEDIA: &str = "wikipedia";
}

/// Category sentinel for features that should adopt a merged feature's category
pub const CATEGORY_NONE: &str = "None";

/// Key of the cross-language title aggregate inside `poiNames`
pub const LANGUAGE_ALL: &str = "all";

/// Language assumed for a bare `name` attribute
pub const DEFAULT_LANGUAGE: &str = "he";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Osm,
    Wikipedia,
    BiblicalArchaeology,
    OffRoad,
    Other(String),
}

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Source::Osm => "OSM",
            Source::Wikipedia => "Wikipedia",
            Source::BiblicalArchaeology => "BiblicalArchaeology",
            Source::OffRoad => "Off-road",
            Source::Other(name) => name,
        }
    }
}

impl From<&str> for Source {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "osm" => Source::Osm,
            "wikipedia" => Source::Wikipedia,
            "biblicalarchaeology" | "biblical-archaeology" => Source::BiblicalArchaeology,
            "off-road" | "offroad" => Source::OffRoad,
            _ => Source::Other(value.to_string()),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Source::from(value.as_str()))
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature {id}: missing required attribute '{key}'")]
    MissingAttribute { id: String, key: &'static str },

    #[error("feature {id}: invalid attribute '{key}': {reason}")]
    InvalidAttribute {
        id: String,
        key: String,
        reason: String,
    },

    #[error("feature {id}: invalid geometry: {reason}")]
    InvalidGeometry { id: String, reason: String },

    #[error("invalid feature document: {0}")]
    Document(String),
}

pub type Attributes = BTreeMap<String, Value>;

/// Title lists keyed by language, without the `all` aggregate
pub type Titles = BTreeMap<String, Vec<String>>;

/// One point of interest or trail as produced by a source adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub source: Source,
    pub geometry: Geometry<f64>,
    pub attributes: Attributes,
}

impl Feature {
    pub fn new(id: impl Into<String>, source: Source, geometry: Geometry<f64>) -> Self {
        Self {
            id: id.into(),
            source,
            geometry,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn has_attribute_value(&self, key: &str, value: &str) -> bool {
        self.attribute_str(key) == Some(value)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn category(&self) -> &str {
        self.attribute_str(keys::CATEGORY).unwrap_or(CATEGORY_NONE)
    }

    pub fn icon(&self) -> &str {
        self.attribute_str(keys::ICON).unwrap_or("")
    }

    pub fn icon_color(&self) -> &str {
        self.attribute_str(keys::ICON_COLOR).unwrap_or("")
    }

    pub fn search_factor(&self) -> f64 {
        self.attribute(keys::SEARCH_FACTOR)
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
    }

    pub fn is_deleted(&self) -> bool {
        self.attribute(keys::DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.geometry, Geometry::GeometryCollection(_))
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.attribute_str(keys::LAST_MODIFIED)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_last_modified(&mut self, timestamp: DateTime<Utc>) {
        self.set_attribute(keys::LAST_MODIFIED, timestamp.to_rfc3339());
    }

    pub fn set_deleted(&mut self) {
        self.set_attribute(keys::DELETED, true);
    }

    /// Titles per language as stored in `poiNames`, skipping the aggregate.
    pub fn titles_by_language(&self) -> Titles {
        let mut titles = Titles::new();
        let Some(Value::Object(names)) = self.attribute(keys::NAMES) else {
            return titles;
        };
        for (language, value) in names {
            if language == LANGUAGE_ALL {
                continue;
            }
            let list: Vec<String> = match value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            if !list.is_empty() {
                titles.insert(language.clone(), list);
            }
        }
        titles
    }

    /// Every distinct non-blank title across languages, in lexicographic order.
    pub fn titles(&self) -> BTreeSet<String> {
        self.titles_by_language()
            .into_values()
            .flatten()
            .filter(|t| !t.trim().is_empty())
            .collect()
    }

    /// Stores `titles` along with the recomputed `all` aggregate.
    pub fn set_titles(&mut self, titles: &Titles) {
        let mut names = Map::new();
        let mut all: Vec<String> = Vec::new();
        for (language, list) in titles {
            for title in list {
                if !all.contains(title) {
                    all.push(title.clone());
                }
            }
            names.insert(language.clone(), json!(list));
        }
        names.insert(LANGUAGE_ALL.to_string(), json!(all));
        self.set_attribute(keys::NAMES, Value::Object(names));
    }

    /// Builds `poiNames` from `name` and `name:<lang>` attributes when it is missing.
    pub fn set_titles_from_names(&mut self) {
        if self.attributes.contains_key(keys::NAMES) {
            return;
        }
        let mut titles = Titles::new();
        for (key, value) in &self.attributes {
            let Some(name) = value.as_str().filter(|n| !n.trim().is_empty()) else {
                continue;
            };
            let language = if key == keys::NAME {
                DEFAULT_LANGUAGE
            } else if let Some(language) = key.strip_prefix("name:") {
                language
            } else {
                continue;
            };
            let list = titles.entry(language.to_string()).or_default();
            if !list.iter().any(|t| t == name) {
                list.push(name.to_string());
            }
        }
        self.set_titles(&titles);
    }

    pub fn combined_ids(&self) -> Vec<String> {
        match self.attribute(keys::COMBINED_IDS) {
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Appends ids to `poiCombinedIds`, skipping ones already recorded.
    pub fn add_combined_ids<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut combined = self.combined_ids();
        for id in ids {
            let id = id.into();
            if id != self.id && !combined.contains(&id) {
                combined.push(id);
            }
        }
        self.set_attribute(keys::COMBINED_IDS, json!(combined));
    }

    /// Own id followed by everything this feature already absorbed, what a
    /// survivor records when it absorbs this one.
    pub fn absorbed_ids(&self) -> Vec<String> {
        let mut ids = vec![self.id.clone()];
        ids.extend(self.combined_ids());
        ids
    }

    /// `(lat, lon)` of the stored geolocation.
    pub fn geolocation(&self) -> Option<(f64, f64)> {
        let location = self.attribute(keys::GEOLOCATION)?;
        let lat = location.get("lat")?.as_f64()?;
        let lon = location.get("lon")?.as_f64()?;
        Some((lat, lon))
    }

    /// Fills `poiGeolocation` from the geometry centroid when absent.
    pub fn set_location(&mut self) {
        if self.geolocation().is_some() {
            return;
        }
        if let Some(point) = self.geometry.centroid() {
            self.set_attribute(keys::GEOLOCATION, json!({ "lat": point.y(), "lon": point.x() }));
        }
    }

    /// Checks the attributes every adapter has to provide.
    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.id.trim().is_empty() {
            return Err(FeatureError::MissingAttribute {
                id: self.id.clone(),
                key: keys::ID,
            });
        }
        for key in [keys::CATEGORY, keys::ICON] {
            match self.attribute(key) {
                None => {
                    return Err(FeatureError::MissingAttribute {
                        id: self.id.clone(),
                        key,
                    })
                }
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(FeatureError::InvalidAttribute {
                        id: self.id.clone(),
                        key: key.to_string(),
                        reason: format!("expected a string, found {other}"),
                    })
                }
            }
        }
        match self.attribute(keys::SEARCH_FACTOR) {
            None => Err(FeatureError::MissingAttribute {
                id: self.id.clone(),
                key: keys::SEARCH_FACTOR,
            }),
            Some(value) if value.as_f64().is_none() => Err(FeatureError::InvalidAttribute {
                id: self.id.clone(),
                key: keys::SEARCH_FACTOR.to_string(),
                reason: format!("expected a number, found {value}"),
            }),
            Some(_) => match &self.geometry {
                Geometry::GeometryCollection(collection) if collection.0.is_empty() => {
                    Err(FeatureError::InvalidGeometry {
                        id: self.id.clone(),
                        reason: "empty geometry collection".to_string(),
                    })
                }
                _ => Ok(()),
            },
        }
    }

    /// GeoJSON document written to the search index.
    pub fn to_document(&self) -> Result<Value, FeatureError> {
        let mut properties: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.insert(keys::ID.to_string(), Value::String(self.id.clone()));
        properties.insert(
            keys::SOURCE.to_string(),
            Value::String(self.source.to_string()),
        );

        let feature = geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&self.geometry))),
            id: Some(geojson::feature::Id::String(self.id.clone())),
            properties: Some(properties),
            foreign_members: None,
        };
        serde_json::to_value(&feature).map_err(|e| FeatureError::InvalidGeometry {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn from_document(document: Value) -> Result<Self, FeatureError> {
        let feature: geojson::Feature =
            serde_json::from_value(document).map_err(|e| FeatureError::Document(e.to_string()))?;
        Self::from_geojson(feature, None)
    }

    /// Converts a GeoJSON feature, using `default_source` when `poiSource` is absent.
    pub fn from_geojson(
        feature: geojson::Feature,
        default_source: Option<&Source>,
    ) -> Result<Self, FeatureError> {
        let mut attributes: Attributes = feature
            .properties
            .unwrap_or_default()
            .into_iter()
            .collect();

        let id = match attributes.remove(keys::ID) {
            Some(Value::String(id)) => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => match feature.id {
                Some(geojson::feature::Id::String(id)) => id,
                Some(geojson::feature::Id::Number(n)) => n.to_string(),
                None => return Err(FeatureError::Document("feature without an id".to_string())),
            },
        };

        let source = match attributes.remove(keys::SOURCE) {
            Some(Value::String(s)) => Source::from(s.as_str()),
            _ => default_source
                .cloned()
                .ok_or_else(|| FeatureError::MissingAttribute {
                    id: id.clone(),
                    key: keys::SOURCE,
                })?,
        };

        let geometry = feature.geometry.ok_or_else(|| FeatureError::InvalidGeometry {
            id: id.clone(),
            reason: "missing geometry".to_string(),
        })?;
        let geometry =
            Geometry::<f64>::try_from(geometry).map_err(|e| FeatureError::InvalidGeometry {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            source,
            geometry,
            attributes,
        })
    }
}

/// Returns the first contract violation found in `features`.
pub fn validate_features(features: &[Feature]) -> Result<(), FeatureError> {
    features.iter().try_for_each(Feature::validate)
}
