//! Cross-source feature merging.
//!
//! Three passes run in a fixed order, each feeding the next:
//!
//! 1. **Wikipedia join** -- OSM features absorb Wikipedia features that share a
//!    `wikipedia:<lang>` reference
//! 2. **KKL route join** -- OSM KKL mountain-bike relations absorb nearby off-road
//!    routes whose name overlaps one of the relation's titles
//! 3. **Title merge** -- an online union-find over title strings, gated by
//!    [`FeaturesMerger::can_merge`]
//!
//! Surviving geometry collections are then collapsed by
//! [`geometry::simplify_collection`]. Collapsing can make new pairs mergeable,
//! so the title merge and the collapse repeat until nothing merges.

use crate::geometry;
use crate::models::{keys, Feature, Source, CATEGORY_NONE};
use crate::report::{MergeDecision, ReportSink};
use crate::stats::MergeStats;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use tracing::{debug, info};

const KKL_OPERATOR: &str = "kkl";
const MTB_ROUTE: &str = "mtb";

pub struct FeaturesMerger<'a> {
    threshold: f64,
    report: &'a dyn ReportSink,
}

impl<'a> FeaturesMerger<'a> {
    pub fn new(threshold: f64, report: &'a dyn ReportSink) -> Self {
        Self { threshold, report }
    }

    pub fn merge(&self, features: Vec<Feature>) -> Vec<Feature> {
        self.merge_with_stats(features).0
    }

    pub fn merge_with_stats(&self, features: Vec<Feature>) -> (Vec<Feature>, MergeStats) {
        let mut stats = MergeStats {
            input: features.len(),
            ..Default::default()
        };

        let (features, merged) = self.merge_wikipedia_to_osm(features);
        stats.wikipedia_merged = merged;
        let (features, merged) = self.merge_offroad_kkl_routes(features);
        stats.offroad_merged = merged;
        let (mut features, mut merged) = self.merge_by_title(features);
        stats.title_merged = merged;
        stats.simplified = simplify_geometries(&mut features);

        // A collapsed collection can contain features it did not before, so
        // repeat until a round merges nothing.
        while merged > 0 {
            let (next, again) = self.merge_by_title(features);
            features = next;
            merged = again;
            stats.title_merged += again;
            stats.simplified += simplify_geometries(&mut features);
        }
        stats.output = features.len();

        info!(
            input = stats.input,
            output = stats.output,
            wikipedia = stats.wikipedia_merged,
            offroad = stats.offroad_merged,
            title = stats.title_merged,
            "Features merge complete"
        );
        (features, stats)
    }

    fn note(&self, message: &str) {
        info!("{message}");
        self.report.note(message);
    }

    fn merge_wikipedia_to_osm(&self, mut features: Vec<Feature>) -> (Vec<Feature>, usize) {
        self.note("Starting joining wikipedia markers.");

        let mut wiki_pool: Vec<usize> = features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.source == Source::Wikipedia)
            .map(|(i, _)| i)
            .collect();
        let osm_with_references: Vec<usize> = features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.source == Source::Osm && !wikipedia_references(f).is_empty())
            .map(|(i, _)| i)
            .collect();

        let mut removed = vec![false; features.len()];
        let mut merged = 0;
        for osm in osm_with_references {
            for (key, title) in wikipedia_references(&features[osm]) {
                let Some(position) = wiki_pool
                    .iter()
                    .position(|&w| features[w].has_attribute_value(&key, &title))
                else {
                    continue;
                };
                let wiki = wiki_pool.remove(position);
                self.report
                    .record(&MergeDecision::new(&features[wiki], &features[osm]));
                let absorbed = features[wiki].absorbed_ids();
                features[osm].add_combined_ids(absorbed);
                removed[wiki] = true;
                merged += 1;
            }
        }

        self.note(&format!(
            "Finished joining wikipedia markers. Merged features: {merged}"
        ));
        (retain_unmarked(features, &removed), merged)
    }

    fn merge_offroad_kkl_routes(&self, mut features: Vec<Feature>) -> (Vec<Feature>, usize) {
        self.note("Starting joining off-road-kkl routes.");

        let routes: Vec<usize> = features
            .iter()
            .enumerate()
            .filter(|(_, f)| is_kkl_mtb_route(f))
            .map(|(i, _)| i)
            .collect();
        let mut offroad_pool: Vec<usize> = features
            .iter()
            .enumerate()
            .filter(|(_, f)| f.source == Source::OffRoad)
            .map(|(i, _)| i)
            .collect();

        let mut removed = vec![false; features.len()];
        let mut merged = 0;
        for route in routes {
            let titles = features[route].titles();
            let (matching, rest): (Vec<usize>, Vec<usize>) =
                offroad_pool.into_iter().partition(|&candidate| {
                    let Some(name) = offroad_name(&features[candidate]) else {
                        return false;
                    };
                    titles
                        .iter()
                        .any(|t| t.contains(name.as_str()) || name.contains(t.as_str()))
                        && geometry::distance(
                            &features[candidate].geometry,
                            &features[route].geometry,
                        ) < self.threshold
                });
            offroad_pool = rest;

            for candidate in matching {
                self.report
                    .record(&MergeDecision::new(&features[candidate], &features[route]));
                let absorbed = features[candidate].absorbed_ids();
                features[route].add_combined_ids(absorbed);
                removed[candidate] = true;
                merged += 1;
            }
        }

        self.note(&format!(
            "Finished joining off-road-kkl routes. Merged features: {merged}"
        ));
        (retain_unmarked(features, &removed), merged)
    }

    fn merge_by_title(&self, features: Vec<Feature>) -> (Vec<Feature>, usize) {
        info!("Starting features merging by title.");

        let mut slots = features;
        let mut absorbed = vec![false; slots.len()];
        let mut by_title: FxHashMap<String, Vec<usize>> = FxHashMap::default();

        let mut order: Vec<usize> = (0..slots.len())
            .filter(|&i| slots[i].source == Source::Osm)
            .collect();
        order.sort_by(|&a, &b| slots[a].id.cmp(&slots[b].id));
        order.extend((0..slots.len()).filter(|&i| slots[i].source != Source::Osm));

        for current in order {
            let titles = slots[current].titles();

            // Title order is lexicographic, so the first candidate is stable.
            let mut found: Vec<usize> = Vec::new();
            for title in &titles {
                let Some(candidates) = by_title.get(title) else {
                    continue;
                };
                if let Some(&target) = candidates
                    .iter()
                    .find(|&&t| self.can_merge(&slots[t], &slots[current]))
                {
                    found.push(target);
                }
            }

            let Some(&survivor) = found.first() else {
                for title in titles {
                    by_title.entry(title).or_default().push(current);
                }
                continue;
            };

            for &other in &found[1..] {
                if other == survivor || absorbed[other] {
                    continue;
                }
                self.absorb(&mut slots, &mut by_title, survivor, other);
                absorbed[other] = true;
            }
            self.absorb(&mut slots, &mut by_title, survivor, current);
            absorbed[current] = true;
        }

        let merged = absorbed.iter().filter(|&&a| a).count();
        let results = retain_unmarked(slots, &absorbed);
        info!(merged, "Finished feature merging by title.");
        (results, merged)
    }

    /// Replaces the survivor with its union with `loser` and keeps the title
    /// buckets pointing only at live features.
    fn absorb(
        &self,
        slots: &mut [Feature],
        by_title: &mut FxHashMap<String, Vec<usize>>,
        survivor: usize,
        loser: usize,
    ) {
        for title in slots[loser].titles() {
            if let Some(bucket) = by_title.get_mut(&title) {
                bucket.retain(|&i| i != loser);
            }
        }

        let titles_before = slots[survivor].titles();
        let merged = merge_features(&slots[survivor], &slots[loser]);
        self.report.record(&MergeDecision::new(&slots[loser], &merged));
        debug!(from = %slots[loser].id, to = %merged.id, "Merged by title");
        slots[survivor] = merged;

        for title in slots[survivor].titles().difference(&titles_before) {
            by_title.entry(title.clone()).or_default().push(survivor);
        }
    }

    /// Whether `source` describes the same place as `target`.
    ///
    /// Not symmetric: containment is tested with `source` as the container and
    /// every member of a `target` collection as the contained shape.
    pub fn can_merge(&self, target: &Feature, source: &Feature) -> bool {
        let contains = match &target.geometry {
            geo::Geometry::GeometryCollection(collection) => collection
                .iter()
                .any(|member| geometry::contains(&source.geometry, member)),
            single => geometry::contains(&source.geometry, single),
        };
        if !contains && geometry::distance(&source.geometry, &target.geometry) > self.threshold {
            // too far away
            return false;
        }
        if source.icon() == target.icon() {
            return true;
        }
        source.source != target.source
    }
}

/// Union of `survivor` and `loser`; the survivor keeps its id and source.
pub fn merge_features(survivor: &Feature, loser: &Feature) -> Feature {
    let mut merged = survivor.clone();
    merged.geometry = geometry::collect(&survivor.geometry, &loser.geometry);

    if survivor.category() == CATEGORY_NONE {
        if let Some(category) = loser.attribute(keys::CATEGORY) {
            merged.set_attribute(keys::CATEGORY, category.clone());
        }
    }

    if loser.search_factor() > survivor.search_factor() {
        merged.set_attribute(keys::SEARCH_FACTOR, loser.search_factor());
    }

    if survivor.icon().trim().is_empty() {
        merged.set_attribute(keys::ICON, loser.icon());
        merged.set_attribute(keys::ICON_COLOR, loser.icon_color());
    }

    let loser_titles = loser.titles_by_language();
    if !loser_titles.is_empty() {
        let mut titles = survivor.titles_by_language();
        for (language, names) in loser_titles {
            let list = titles.entry(language).or_default();
            for name in names {
                if !list.contains(&name) {
                    list.push(name);
                }
            }
        }
        merged.set_titles(&titles);
    }

    if survivor.source == Source::Osm && loser.source == Source::Osm {
        // OSM elements are not fetchable by a combined id, only carry what the loser absorbed
        merged.add_combined_ids(loser.combined_ids());
    } else {
        merged.add_combined_ids(loser.absorbed_ids());
    }
    merged
}

/// Collapses every surviving geometry collection, returns how many changed.
pub fn simplify_geometries(features: &mut [Feature]) -> usize {
    features
        .par_iter_mut()
        .filter(|f| f.is_collection())
        .map(|f| {
            let geometry = std::mem::replace(
                &mut f.geometry,
                geo::Geometry::GeometryCollection(geo::GeometryCollection(Vec::new())),
            );
            f.geometry = geometry::simplify_collection(geometry);
        })
        .count()
}

fn wikipedia_references(feature: &Feature) -> Vec<(String, String)> {
    feature
        .attributes
        .iter()
        .filter(|(key, _)| key.starts_with(keys::WIKIPEDIA))
        .filter_map(|(key, value)| {
            value
                .as_str()
                .filter(|title| !title.trim().is_empty())
                .map(|title| (key.clone(), title.to_string()))
        })
        .collect()
}

fn is_kkl_mtb_route(feature: &Feature) -> bool {
    feature.source == Source::Osm
        && feature.has_attribute_value("operator", KKL_OPERATOR)
        && feature.has_attribute_value("route", MTB_ROUTE)
}

fn offroad_name(feature: &Feature) -> Option<String> {
    feature
        .attribute_str(keys::NAME)
        .map(str::to_string)
        .or_else(|| feature.titles().into_iter().next())
        .filter(|name| !name.trim().is_empty())
}

fn retain_unmarked(features: Vec<Feature>, removed: &[bool]) -> Vec<Feature> {
    features
        .into_iter()
        .zip(removed)
        .filter(|(_, &gone)| !gone)
        .map(|(f, _)| f)
        .collect()
}

/// Ids of every feature, used to check merge results.
pub fn feature_ids(features: &[Feature]) -> BTreeSet<String> {
    features.iter().map(|f| f.id.clone()).collect()
}
