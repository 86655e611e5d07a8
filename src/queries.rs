//! Query bodies for the POI and highway aliases, and a read-only facade over them.
//!
//! Builders are pure and return JSON; [`PoiSearch`] runs them. Coordinates are
//! `geo::Coord` with `x` as longitude and `y` as latitude.

use crate::config::{HIGHWAYS_ALIAS, POIS_ALIAS, SEARCH_RESULTS};
use crate::index::IndexError;
use crate::models::{keys, Feature, Source, LANGUAGE_ALL};
use crate::search::SearchEngine;
use chrono::{DateTime, Utc};
use geo::Coord;
use serde_json::{json, Value};
use std::collections::BTreeSet;

const LANGUAGE_BOOST: f64 = 1.2;
const PLACES_RESULTS: usize = 5;
const CONTAINERS_RESULTS: usize = 100;
const HIGHWAYS_RESULTS: usize = 5000;
const BOUNDS_RESULTS: usize = 10_000;

fn property(key: &str) -> String {
    format!("properties.{key}")
}

/// Fuzzy name match over every language, preferring the requested one.
pub fn name_search(term: &str, language: &str) -> Value {
    json!({
        "dis_max": {
            "queries": [
                { "match": { format!("{}.{LANGUAGE_ALL}", property(keys::NAMES)): {
                    "query": term,
                    "fuzziness": "AUTO"
                }}},
                { "match": { format!("{}.{language}", property(keys::NAMES)): {
                    "query": term,
                    "fuzziness": "AUTO",
                    "boost": LANGUAGE_BOOST
                }}}
            ]
        }
    })
}

/// Scales relevance by the feature's search factor.
pub fn with_search_factor(query: Value) -> Value {
    json!({
        "function_score": {
            "query": query,
            "functions": [
                { "field_value_factor": { "field": property(keys::SEARCH_FACTOR), "missing": 1.0 } }
            ]
        }
    })
}

pub fn container_filter() -> Value {
    json!({ "term": { property(keys::CONTAINER): true } })
}

pub fn deleted_filter() -> Value {
    json!({ "term": { property(keys::DELETED): true } })
}

pub fn exclude_deleted(query: Value) -> Value {
    json!({ "bool": { "must": [query], "must_not": [deleted_filter()] } })
}

pub fn bounding_box(north_east: Coord<f64>, south_west: Coord<f64>) -> Value {
    json!({
        "geo_bounding_box": {
            property(keys::GEOLOCATION): {
                "top_left": { "lat": north_east.y, "lon": south_west.x },
                "bottom_right": { "lat": south_west.y, "lon": north_east.x }
            }
        }
    })
}

/// Shapes that contain the point.
pub fn contains_point(point: Coord<f64>) -> Value {
    json!({
        "geo_shape": {
            "geometry": {
                "shape": { "type": "point", "coordinates": [point.x, point.y] },
                "relation": "contains"
            }
        }
    })
}

/// Shapes that cross the envelope.
pub fn intersects_envelope(north_east: Coord<f64>, south_west: Coord<f64>) -> Value {
    json!({
        "geo_shape": {
            "geometry": {
                "shape": {
                    "type": "envelope",
                    "coordinates": [[south_west.x, north_east.y], [north_east.x, south_west.y]]
                },
                "relation": "intersects"
            }
        }
    })
}

/// Features that absorbed any of `ids`.
pub fn combined_ids_filter(ids: &[&str]) -> Value {
    json!({ "terms": { property(keys::COMBINED_IDS): ids } })
}

/// Exact title match against the language-neutral name list.
pub fn titles_filter(titles: &BTreeSet<String>) -> Value {
    json!({ "terms": { format!("{}.{LANGUAGE_ALL}.keyword", property(keys::NAMES)): titles } })
}

pub fn source_filter(source: &Source) -> Value {
    json!({ "term": { property(keys::SOURCE): source.as_str() } })
}

pub fn categories_filter(categories: &[&str]) -> Value {
    let categories: Vec<String> = categories.iter().map(|c| c.to_lowercase()).collect();
    json!({ "terms": { property(keys::CATEGORY): categories } })
}

/// The requested language plus the language-neutral marker.
pub fn languages_filter(language: &str) -> Value {
    let mut languages = vec![language];
    if language != LANGUAGE_ALL {
        languages.push(LANGUAGE_ALL);
    }
    json!({ "terms": { property(keys::LANGUAGE): languages } })
}

pub fn modified_since(since: DateTime<Utc>) -> Value {
    json!({ "range": { property(keys::LAST_MODIFIED): { "gt": since.to_rfc3339() } } })
}

pub fn bool_query(must: Vec<Value>, filter: Vec<Value>) -> Value {
    json!({ "bool": { "must": must, "filter": filter } })
}

pub fn search_body(query: Value, size: usize) -> Value {
    json!({
        "size": size,
        "track_scores": true,
        "sort": [{ "_score": "desc" }],
        "query": query
    })
}

/// Name search limited to the visible map area.
pub fn location_search_body(
    north_east: Coord<f64>,
    south_west: Coord<f64>,
    term: &str,
    language: &str,
) -> Value {
    let query = bool_query(
        vec![with_search_factor(name_search(term, language))],
        vec![bounding_box(north_east, south_west)],
    );
    search_body(query, SEARCH_RESULTS)
}

pub fn in_bounds_body(
    north_east: Coord<f64>,
    south_west: Coord<f64>,
    categories: &[&str],
    language: &str,
) -> Value {
    let query = bool_query(
        Vec::new(),
        vec![
            bounding_box(north_east, south_west),
            categories_filter(categories),
            languages_filter(language),
        ],
    );
    json!({ "size": BOUNDS_RESULTS, "query": query })
}

pub fn highways_body(north_east: Coord<f64>, south_west: Coord<f64>) -> Value {
    json!({
        "size": HIGHWAYS_RESULTS,
        "query": intersects_envelope(north_east, south_west)
    })
}

/// Read side of the POI and highway aliases. Soft-deleted hits never surface.
pub struct PoiSearch<'a, E: SearchEngine> {
    engine: &'a E,
}

impl<'a, E: SearchEngine> PoiSearch<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    async fn run(&self, index: &str, body: Value) -> Result<Vec<Feature>, IndexError> {
        let page = self.engine.search(index, &body, None).await?;
        let mut features = Vec::with_capacity(page.hits.len());
        for hit in page.hits {
            let feature = Feature::from_document(hit.source)?;
            if !feature.is_deleted() {
                features.push(feature);
            }
        }
        Ok(features)
    }

    pub async fn search(&self, term: &str, language: &str) -> Result<Vec<Feature>, IndexError> {
        if term.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query = with_search_factor(name_search(term, language));
        self.run(POIS_ALIAS, search_body(query, SEARCH_RESULTS)).await
    }

    pub async fn search_places(
        &self,
        place: &str,
        language: &str,
    ) -> Result<Vec<Feature>, IndexError> {
        if place.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query = bool_query(vec![name_search(place, language)], vec![container_filter()]);
        self.run(POIS_ALIAS, search_body(query, PLACES_RESULTS)).await
    }

    pub async fn search_by_location(
        &self,
        north_east: Coord<f64>,
        south_west: Coord<f64>,
        term: &str,
        language: &str,
    ) -> Result<Vec<Feature>, IndexError> {
        if term.trim().is_empty() {
            return Ok(Vec::new());
        }
        let body = location_search_body(north_east, south_west, term, language);
        self.run(POIS_ALIAS, body).await
    }

    /// Container polygons (cities, parks) around a point.
    pub async fn get_containers(&self, point: Coord<f64>) -> Result<Vec<Feature>, IndexError> {
        let query = bool_query(Vec::new(), vec![contains_point(point), container_filter()]);
        self.run(POIS_ALIAS, json!({ "size": CONTAINERS_RESULTS, "query": query }))
            .await
    }

    pub async fn get_in_bounds(
        &self,
        north_east: Coord<f64>,
        south_west: Coord<f64>,
        categories: &[&str],
        language: &str,
    ) -> Result<Vec<Feature>, IndexError> {
        let body = in_bounds_body(north_east, south_west, categories, language);
        self.run(POIS_ALIAS, body).await
    }

    pub async fn get_highways(
        &self,
        north_east: Coord<f64>,
        south_west: Coord<f64>,
    ) -> Result<Vec<Feature>, IndexError> {
        self.run(HIGHWAYS_ALIAS, highways_body(north_east, south_west))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::index::{IndexRole, IndexWriter};
    use crate::memory::MemoryEngine;
    use crate::models::{Source, Titles};
    use crate::search::EngineError;
    use geo::{coord, point, Geometry};

    #[test]
    fn name_search_boosts_requested_language() {
        let query = name_search("masada", "en");
        let queries = &query["dis_max"]["queries"];
        assert_eq!(
            queries[0]["match"]["properties.poiNames.all"]["query"],
            "masada"
        );
        assert_eq!(queries[1]["match"]["properties.poiNames.en"]["boost"], 1.2);
        assert_eq!(
            queries[1]["match"]["properties.poiNames.en"]["fuzziness"],
            "AUTO"
        );
    }

    #[test]
    fn bounding_box_corners() {
        let query = bounding_box(coord! { x: 35.5, y: 32.0 }, coord! { x: 35.0, y: 31.0 });
        let bbox = &query["geo_bounding_box"]["properties.poiGeolocation"];
        assert_eq!(bbox["top_left"]["lat"], 32.0);
        assert_eq!(bbox["top_left"]["lon"], 35.0);
        assert_eq!(bbox["bottom_right"]["lat"], 31.0);
        assert_eq!(bbox["bottom_right"]["lon"], 35.5);
    }

    #[test]
    fn contains_point_uses_lon_lat_order() {
        let query = contains_point(coord! { x: 35.2, y: 31.7 });
        let shape = &query["geo_shape"]["geometry"];
        assert_eq!(shape["shape"]["coordinates"], json!([35.2, 31.7]));
        assert_eq!(shape["relation"], "contains");
    }

    #[test]
    fn filters_lowercase_and_add_all_language() {
        assert_eq!(
            categories_filter(&["Water", "Historic"])["terms"]["properties.poiCategory"],
            json!(["water", "historic"])
        );
        assert_eq!(
            languages_filter("he")["terms"]["properties.poiLanguage"],
            json!(["he", "all"])
        );
        assert_eq!(
            languages_filter("all")["terms"]["properties.poiLanguage"],
            json!(["all"])
        );
    }

    #[test]
    fn location_search_filters_by_box() {
        let body = location_search_body(
            coord! { x: 35.5, y: 32.0 },
            coord! { x: 35.0, y: 31.0 },
            "spring",
            "he",
        );
        assert_eq!(body["size"], SEARCH_RESULTS);
        let bool_body = &body["query"]["bool"];
        let scored = &bool_body["must"][0]["function_score"];
        assert_eq!(
            scored["query"]["dis_max"]["queries"][1]["match"]["properties.poiNames.he"]["query"],
            "spring"
        );
        let bbox = &bool_body["filter"][0]["geo_bounding_box"]["properties.poiGeolocation"];
        assert_eq!(bbox["top_left"]["lon"], 35.0);
        assert_eq!(bbox["bottom_right"]["lat"], 31.0);
    }

    #[test]
    fn in_bounds_combines_box_categories_and_languages() {
        let body = in_bounds_body(
            coord! { x: 35.5, y: 32.0 },
            coord! { x: 35.0, y: 31.0 },
            &["Water"],
            "en",
        );
        assert_eq!(body["size"], BOUNDS_RESULTS);
        let filters = body["query"]["bool"]["filter"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        assert_eq!(filters.len(), 3);
        assert!(filters[0].get("geo_bounding_box").is_some());
        assert_eq!(filters[1]["terms"]["properties.poiCategory"], json!(["water"]));
        assert_eq!(filters[2]["terms"]["properties.poiLanguage"], json!(["en", "all"]));
        assert_eq!(body["query"]["bool"]["must"], json!([]));
    }

    #[test]
    fn highways_intersect_the_envelope() {
        let body = highways_body(coord! { x: 35.5, y: 32.0 }, coord! { x: 35.0, y: 31.0 });
        assert_eq!(body["size"], HIGHWAYS_RESULTS);
        let shape = &body["query"]["geo_shape"]["geometry"];
        assert_eq!(shape["relation"], "intersects");
        assert_eq!(shape["shape"]["type"], "envelope");
        assert_eq!(shape["shape"]["coordinates"], json!([[35.0, 32.0], [35.5, 31.0]]));
    }

    #[test]
    fn lookup_filters_use_exact_fields() {
        assert_eq!(
            combined_ids_filter(&["Wikipedia_en_Masada"])["terms"]["properties.poiCombinedIds"],
            json!(["Wikipedia_en_Masada"])
        );
        let titles = BTreeSet::from(["Masada".to_string(), "מצדה".to_string()]);
        assert_eq!(
            titles_filter(&titles)["terms"]["properties.poiNames.all.keyword"],
            json!(["Masada", "מצדה"])
        );
        assert_eq!(
            source_filter(&Source::OffRoad)["term"]["properties.poiSource"],
            "Off-road"
        );
    }

    fn named(id: &str, title: &str, container: bool) -> Feature {
        let mut feature = Feature::new(id, Source::Osm, Geometry::Point(point!(x: 35.0, y: 31.0)))
            .with_attribute(keys::CATEGORY, "Natural")
            .with_attribute(keys::ICON, "icon-tint")
            .with_attribute(keys::SEARCH_FACTOR, 1.0)
            .with_attribute(keys::CONTAINER, container);
        let mut titles = Titles::new();
        titles.insert("en".to_string(), vec![title.to_string()]);
        feature.set_titles(&titles);
        feature
    }

    #[tokio::test]
    async fn search_skips_deleted_and_blank_terms() -> Result<(), IndexError> {
        let engine = MemoryEngine::new();
        let writer = IndexWriter::new(engine.clone(), &PipelineConfig::default());
        let mut deleted = named("node_3", "Ein Gedi Spring", false);
        deleted.set_deleted();
        writer
            .rebuild_zero_downtime(
                IndexRole::PointsOfInterest,
                &[
                    named("node_1", "Ein Gedi", false),
                    named("node_2", "Ein Gedi Reserve", true),
                    deleted,
                ],
            )
            .await?;

        let search = PoiSearch::new(&engine);
        let found = search.search("ein gedi", "en").await?;
        let ids: Vec<&str> = found.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["node_1", "node_2"]);

        let places = search.search_places("ein gedi", "en").await?;
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].id, "node_2");

        assert!(search.search("  ", "en").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn geo_searches_need_a_real_engine() -> Result<(), IndexError> {
        let engine = MemoryEngine::new();
        let writer = IndexWriter::new(engine.clone(), &PipelineConfig::default());
        writer
            .rebuild_zero_downtime(
                IndexRole::PointsOfInterest,
                &[named("node_1", "Jerusalem", true)],
            )
            .await?;
        writer
            .rebuild_zero_downtime(IndexRole::Highways, &[named("way_1", "Route 1", false)])
            .await?;
        let search = PoiSearch::new(&engine);
        let ne = coord! { x: 35.5, y: 32.0 };
        let sw = coord! { x: 34.5, y: 30.0 };
        let unsupported = |result: Result<Vec<Feature>, IndexError>| {
            matches!(result, Err(IndexError::Engine(EngineError::Unsupported(_))))
        };
        assert!(unsupported(search.get_containers(coord! { x: 35.0, y: 31.0 }).await));
        assert!(unsupported(search.search_by_location(ne, sw, "jerusalem", "en").await));
        assert!(unsupported(search.get_in_bounds(ne, sw, &["Natural"], "en").await));
        assert!(unsupported(search.get_highways(ne, sw).await));
        assert!(search.search_by_location(ne, sw, " ", "en").await?.is_empty());
        Ok(())
    }
}
