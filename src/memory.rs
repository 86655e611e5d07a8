//! In-process search engine.
//!
//! Backs `--dry-run` runs and the swap tests. Aliases resolve under the same
//! lock as the documents, so an alias update is observed all at once. Only the
//! query clauses the crate itself produces are understood; geo clauses are
//! rejected with [`EngineError::Unsupported`].

use crate::search::{
    AliasAction, BulkItemFailure, BulkResponse, EngineError, SearchEngine, SearchHit, SearchPage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SEARCH_SIZE: usize = 10;

#[derive(Default)]
struct State {
    indices: BTreeMap<String, MemoryIndex>,
    aliases: BTreeMap<String, Vec<String>>,
    scrolls: FxHashMap<String, Vec<SearchHit>>,
    next_scroll: u64,
    failing_bulks: usize,
    rejected: FxHashSet<String>,
    bulk_delay: Option<Duration>,
}

struct MemoryIndex {
    mapping: Value,
    documents: BTreeMap<String, Value>,
}

impl State {
    /// Physical indices behind `name`, which may itself be physical.
    fn resolve(&self, name: &str) -> Result<Vec<String>, EngineError> {
        if self.indices.contains_key(name) {
            return Ok(vec![name.to_string()]);
        }
        match self.aliases.get(name) {
            Some(targets) if !targets.is_empty() => Ok(targets.clone()),
            _ => Err(EngineError::IndexNotFound(name.to_string())),
        }
    }

    fn resolve_single(&self, name: &str) -> Result<String, EngineError> {
        let targets = self.resolve(name)?;
        match targets.as_slice() {
            [single] => Ok(single.clone()),
            _ => Err(EngineError::Status {
                operation: format!("write {name}"),
                status: 400,
                body: format!("alias {name} points at {} indices", targets.len()),
            }),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` bulk requests fail as a whole with a 503.
    pub fn inject_bulk_failures(&self, count: usize) {
        self.state.lock().failing_bulks = count;
    }

    /// Every bulk item with this id is rejected with a 400.
    pub fn reject_document(&self, id: &str) {
        self.state.lock().rejected.insert(id.to_string());
    }

    /// Bulk requests sleep this long before applying.
    pub fn set_bulk_delay(&self, delay: Duration) {
        self.state.lock().bulk_delay = Some(delay);
    }

    pub fn indices(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.state
            .lock()
            .indices
            .get(index)
            .map(|i| i.mapping.clone())
    }
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn index_exists(&self, index: &str) -> Result<bool, EngineError> {
        Ok(self.state.lock().indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, mapping: &Value) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.indices.contains_key(index) {
            return Err(EngineError::Status {
                operation: format!("create {index}"),
                status: 400,
                body: "resource_already_exists_exception".to_string(),
            });
        }
        state.indices.insert(
            index.to_string(),
            MemoryIndex {
                mapping: mapping.clone(),
                documents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.indices.remove(index).is_none() {
            return Err(EngineError::IndexNotFound(index.to_string()));
        }
        for targets in state.aliases.values_mut() {
            targets.retain(|t| t != index);
        }
        state.aliases.retain(|_, targets| !targets.is_empty());
        Ok(())
    }

    async fn get_alias(&self, alias: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .state
            .lock()
            .aliases
            .get(alias)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let mut aliases = state.aliases.clone();
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    if !state.indices.contains_key(index) {
                        return Err(EngineError::IndexNotFound(index.clone()));
                    }
                    let targets = aliases.entry(alias.clone()).or_default();
                    if !targets.contains(index) {
                        targets.push(index.clone());
                    }
                }
                AliasAction::Remove { index, alias } => {
                    let Some(targets) = aliases.get_mut(alias) else {
                        return Err(EngineError::Status {
                            operation: "update aliases".to_string(),
                            status: 404,
                            body: format!("aliases [{alias}] missing"),
                        });
                    };
                    targets.retain(|t| t != index);
                }
            }
        }
        aliases.retain(|_, targets| !targets.is_empty());
        state.aliases = aliases;
        Ok(())
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: &[(String, Value)],
    ) -> Result<BulkResponse, EngineError> {
        let delay = self.state.lock().bulk_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_bulks > 0 {
            state.failing_bulks -= 1;
            return Err(EngineError::Status {
                operation: format!("bulk {index}"),
                status: 503,
                body: "injected failure".to_string(),
            });
        }
        let target = state.resolve_single(index)?;

        let mut response = BulkResponse::default();
        let mut accepted = Vec::new();
        for (id, document) in documents {
            if state.rejected.contains(id) {
                response.failures.push(BulkItemFailure {
                    id: id.clone(),
                    status: 400,
                    reason: "mapper_parsing_exception".to_string(),
                });
            } else {
                accepted.push((id.clone(), document.clone()));
            }
        }
        response.succeeded = accepted.len();
        if let Some(memory_index) = state.indices.get_mut(&target) {
            memory_index.documents.extend(accepted);
        }
        Ok(response)
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, EngineError> {
        let state = self.state.lock();
        for target in state.resolve(index)? {
            if let Some(document) = state
                .indices
                .get(&target)
                .and_then(|i| i.documents.get(id))
            {
                return Ok(Some(document.clone()));
            }
        }
        Ok(None)
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        let target = state.resolve_single(index)?;
        Ok(state
            .indices
            .get_mut(&target)
            .map(|i| i.documents.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn search(
        &self,
        index: &str,
        body: &Value,
        scroll: Option<&str>,
    ) -> Result<SearchPage, EngineError> {
        let query = body.get("query").cloned().unwrap_or(Value::Null);
        let size = body
            .get("size")
            .and_then(Value::as_u64)
            .map(|s| s as usize)
            .unwrap_or(DEFAULT_SEARCH_SIZE);

        let mut state = self.state.lock();
        let mut hits = Vec::new();
        for target in state.resolve(index)? {
            let Some(memory_index) = state.indices.get(&target) else {
                continue;
            };
            for (id, document) in &memory_index.documents {
                if query.is_null() || matches(&query, document)? {
                    hits.push(SearchHit {
                        id: id.clone(),
                        source: document.clone(),
                    });
                }
            }
        }

        if scroll.is_none() {
            hits.truncate(size);
            return Ok(SearchPage {
                hits,
                scroll_id: None,
            });
        }

        let rest = if hits.len() > size {
            hits.split_off(size)
        } else {
            Vec::new()
        };
        state.next_scroll += 1;
        let scroll_id = format!("scroll-{}-{size}", state.next_scroll);
        state.scrolls.insert(scroll_id.clone(), rest);
        Ok(SearchPage {
            hits,
            scroll_id: Some(scroll_id),
        })
    }

    async fn scroll(&self, scroll_id: &str, _ttl: &str) -> Result<SearchPage, EngineError> {
        let mut state = self.state.lock();
        let size = scroll_id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_SEARCH_SIZE);
        let Some(remaining) = state.scrolls.get_mut(scroll_id) else {
            return Err(EngineError::Status {
                operation: "scroll".to_string(),
                status: 404,
                body: format!("no search context found for id [{scroll_id}]"),
            });
        };
        let take = size.min(remaining.len());
        let hits: Vec<SearchHit> = remaining.drain(..take).collect();
        Ok(SearchPage {
            hits,
            scroll_id: Some(scroll_id.to_string()),
        })
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), EngineError> {
        self.state.lock().scrolls.remove(scroll_id);
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<(), EngineError> {
        self.state.lock().resolve(index).map(|_| ())
    }

    async fn count(&self, index: &str) -> Result<u64, EngineError> {
        let state = self.state.lock();
        let mut total = 0;
        for target in state.resolve(index)? {
            if let Some(memory_index) = state.indices.get(&target) {
                total += memory_index.documents.len() as u64;
            }
        }
        Ok(total)
    }
}

/// Values at a dotted path, arrays are expanded at every level.
/// Values at a dotted path, arrays flattened. A trailing `.keyword`
/// addresses the exact-value sub-field, which here is the field itself.
fn field_values<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let path = path.strip_suffix(".keyword").unwrap_or(path);
    let mut current = vec![document];
    for part in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value.get(part) {
                Some(Value::Array(items)) => next.extend(items.iter()),
                Some(found) => next.push(found),
                None => {}
            }
        }
        current = next;
    }
    current
}

fn clauses(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
        None => Vec::new(),
    }
}

/// The only `(field, parameters)` pair of a leaf clause.
fn single_field(clause: &Value) -> Result<(&str, &Value), EngineError> {
    clause
        .as_object()
        .and_then(|o| o.iter().next())
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| EngineError::Unsupported(clause.to_string()))
}

fn matches(query: &Value, document: &Value) -> Result<bool, EngineError> {
    let (kind, body) = single_field(query)?;
    match kind {
        "match_all" => Ok(true),
        "term" => {
            let (field, expected) = single_field(body)?;
            let expected = expected.get("value").unwrap_or(expected);
            Ok(field_values(document, field)
                .into_iter()
                .any(|v| v == expected))
        }
        "terms" => {
            let (field, expected) = single_field(body)?;
            let options = clauses(Some(expected));
            Ok(field_values(document, field)
                .into_iter()
                .any(|v| options.contains(&v)))
        }
        "range" => {
            let (field, bounds) = single_field(body)?;
            Ok(field_values(document, field)
                .into_iter()
                .any(|v| in_range(v, bounds)))
        }
        "match" => {
            let (field, params) = single_field(body)?;
            let text = params.get("query").unwrap_or(params);
            let Some(text) = text.as_str() else {
                return Err(EngineError::Unsupported(query.to_string()));
            };
            let needle = text.to_lowercase();
            Ok(field_values(document, field).into_iter().any(|v| {
                v.as_str()
                    .map(|s| s.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            }))
        }
        "dis_max" => {
            for inner in clauses(body.get("queries")) {
                if matches(inner, document)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "function_score" => match body.get("query") {
            Some(inner) => matches(inner, document),
            None => Ok(true),
        },
        "bool" => {
            for inner in clauses(body.get("must"))
                .into_iter()
                .chain(clauses(body.get("filter")))
            {
                if !matches(inner, document)? {
                    return Ok(false);
                }
            }
            for inner in clauses(body.get("must_not")) {
                if matches(inner, document)? {
                    return Ok(false);
                }
            }
            let should = clauses(body.get("should"));
            if should.is_empty() {
                return Ok(true);
            }
            for inner in should {
                if matches(inner, document)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(EngineError::Unsupported(other.to_string())),
    }
}

fn compare(value: &Value, bound: &Value) -> Option<Ordering> {
    match (value, bound) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn in_range(value: &Value, bounds: &Value) -> bool {
    let check = |key: &str, accept: fn(Ordering) -> bool| match bounds.get(key) {
        None => true,
        Some(bound) => compare(value, bound).map(accept).unwrap_or(false),
    };
    check("gt", |o| o == Ordering::Greater)
        && check("gte", |o| o != Ordering::Less)
        && check("lt", |o| o == Ordering::Less)
        && check("lte", |o| o != Ordering::Greater)
}
