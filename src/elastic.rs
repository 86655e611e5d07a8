//! Elasticsearch REST client.

use crate::search::{
    AliasAction, BulkItemFailure, BulkResponse, EngineError, SearchEngine, SearchHit, SearchPage,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ElasticClient {
    client: Client,
    base: Url,
}

impl ElasticClient {
    pub fn new(base_url: &str) -> Result<Self, EngineError> {
        let base =
            Url::parse(base_url).map_err(|e| EngineError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(EngineError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    /// Appends percent-encoded path segments to the base URL.
    fn url(&self, segments: &[&str]) -> Result<Url, EngineError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| EngineError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(operation: &str, response: Response) -> Result<Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// Newline-delimited bulk body, one `index` action per document.
pub fn bulk_body(documents: &[(String, Value)]) -> Result<String, EngineError> {
    let mut body = String::new();
    for (id, document) in documents {
        body.push_str(&serde_json::to_string(&json!({ "index": { "_id": id } }))?);
        body.push('\n');
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

pub fn alias_actions_body(actions: &[AliasAction]) -> Value {
    let actions: Vec<Value> = actions
        .iter()
        .map(|action| match action {
            AliasAction::Add { index, alias } => {
                json!({ "add": { "index": index, "alias": alias } })
            }
            AliasAction::Remove { index, alias } => {
                json!({ "remove": { "index": index, "alias": alias } })
            }
        })
        .collect();
    json!({ "actions": actions })
}

pub fn parse_bulk_response(response: &Value) -> BulkResponse {
    let mut result = BulkResponse::default();
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for item in items {
        let Some(outcome) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        match outcome.get("error") {
            None | Some(Value::Null) => result.succeeded += 1,
            Some(error) => result.failures.push(BulkItemFailure {
                id: outcome
                    .get("_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: outcome
                    .get("status")
                    .and_then(Value::as_u64)
                    .unwrap_or_default() as u16,
                reason: error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            }),
        }
    }
    result
}

pub fn parse_search_page(response: &Value) -> SearchPage {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    Some(SearchHit {
                        id: hit.get("_id")?.as_str()?.to_string(),
                        source: hit.get("_source").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    SearchPage {
        hits,
        scroll_id: response
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn alias_targets(response: &Value) -> Vec<String> {
    response
        .as_object()
        .map(|indices| indices.keys().cloned().collect())
        .unwrap_or_default()
}

#[async_trait]
impl SearchEngine for ElasticClient {
    async fn index_exists(&self, index: &str) -> Result<bool, EngineError> {
        let response = self.client.head(self.url(&[index])?).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => Self::check("index exists", response).await.map(|_| true),
        }
    }

    async fn create_index(&self, index: &str, mapping: &Value) -> Result<(), EngineError> {
        debug!(index, "Creating index");
        let response = self
            .client
            .put(self.url(&[index])?)
            .json(mapping)
            .send()
            .await?;
        Self::check(&format!("create {index}"), response).await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), EngineError> {
        debug!(index, "Deleting index");
        let response = self.client.delete(self.url(&[index])?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::IndexNotFound(index.to_string()));
        }
        Self::check(&format!("delete {index}"), response).await?;
        Ok(())
    }

    async fn get_alias(&self, alias: &str) -> Result<Vec<String>, EngineError> {
        let response = self
            .client
            .get(self.url(&["_alias", alias])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: Value = Self::check("get alias", response).await?.json().await?;
        Ok(alias_targets(&body))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), EngineError> {
        let response = self
            .client
            .post(self.url(&["_aliases"])?)
            .json(&alias_actions_body(actions))
            .send()
            .await?;
        Self::check("update aliases", response).await?;
        Ok(())
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: &[(String, Value)],
    ) -> Result<BulkResponse, EngineError> {
        let response = self
            .client
            .post(self.url(&[index, "_bulk"])?)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(documents)?)
            .send()
            .await?;
        let body: Value = Self::check(&format!("bulk {index}"), response)
            .await?
            .json()
            .await?;
        Ok(parse_bulk_response(&body))
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, EngineError> {
        let response = self
            .client
            .get(self.url(&[index, "_doc", id])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = Self::check("get document", response).await?.json().await?;
        Ok(body.get("_source").cloned())
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<bool, EngineError> {
        let response = self
            .client
            .delete(self.url(&[index, "_doc", id])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: Value = Self::check("delete document", response)
            .await?
            .json()
            .await?;
        Ok(body.get("result").and_then(Value::as_str) == Some("deleted"))
    }

    async fn search(
        &self,
        index: &str,
        body: &Value,
        scroll: Option<&str>,
    ) -> Result<SearchPage, EngineError> {
        let mut url = self.url(&[index, "_search"])?;
        if let Some(ttl) = scroll {
            url.query_pairs_mut().append_pair("scroll", ttl);
        }
        let response = self.client.post(url).json(body).send().await?;
        let body: Value = Self::check(&format!("search {index}"), response)
            .await?
            .json()
            .await?;
        Ok(parse_search_page(&body))
    }

    async fn scroll(&self, scroll_id: &str, ttl: &str) -> Result<SearchPage, EngineError> {
        let response = self
            .client
            .post(self.url(&["_search", "scroll"])?)
            .json(&json!({ "scroll": ttl, "scroll_id": scroll_id }))
            .send()
            .await?;
        let body: Value = Self::check("scroll", response).await?.json().await?;
        Ok(parse_search_page(&body))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), EngineError> {
        let response = self
            .client
            .delete(self.url(&["_search", "scroll"])?)
            .json(&json!({ "scroll_id": scroll_id }))
            .send()
            .await?;
        Self::check("clear scroll", response).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<(), EngineError> {
        let response = self
            .client
            .post(self.url(&[index, "_refresh"])?)
            .send()
            .await?;
        Self::check(&format!("refresh {index}"), response).await?;
        Ok(())
    }

    async fn count(&self, index: &str) -> Result<u64, EngineError> {
        let response = self
            .client
            .get(self.url(&[index, "_count"])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::IndexNotFound(index.to_string()));
        }
        let body: Value = Self::check(&format!("count {index}"), response)
            .await?
            .json()
            .await?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_encode_document_ids() -> Result<(), EngineError> {
        let client = ElasticClient::new("http://localhost:9200/")?;
        let url = client.url(&["osm_names", "_doc", "Wikipedia_he_עין גדי/1"])?;
        assert!(url.as_str().starts_with("http://localhost:9200/osm_names/_doc/"));
        assert!(!url.path().ends_with("/1"));
        Ok(())
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            ElasticClient::new("not a url"),
            Err(EngineError::InvalidUrl(_))
        ));
    }

    #[test]
    fn bulk_body_is_ndjson() -> Result<(), EngineError> {
        let body = bulk_body(&[
            ("node_1".to_string(), json!({ "a": 1 })),
            ("node_2".to_string(), json!({ "a": 2 })),
        ])?;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], r#"{"index":{"_id":"node_1"}}"#);
        assert_eq!(lines[3], r#"{"a":2}"#);
        assert!(body.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn alias_swap_is_one_request() {
        let body = alias_actions_body(&[
            AliasAction::Remove {
                index: "osm_names1".to_string(),
                alias: "osm_names".to_string(),
            },
            AliasAction::Add {
                index: "osm_names2".to_string(),
                alias: "osm_names".to_string(),
            },
        ]);
        assert_eq!(body["actions"][0]["remove"]["index"], "osm_names1");
        assert_eq!(body["actions"][1]["add"]["index"], "osm_names2");
    }

    #[test]
    fn bulk_response_collects_item_errors() {
        let response = json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "status": 400,
                    "error": { "type": "mapper_parsing_exception", "reason": "failed to parse" } } },
                { "index": { "_id": "c", "status": 200 } }
            ]
        });
        let parsed = parse_bulk_response(&response);
        assert_eq!(parsed.succeeded, 2);
        assert_eq!(
            parsed.failures,
            vec![BulkItemFailure {
                id: "b".to_string(),
                status: 400,
                reason: "failed to parse".to_string(),
            }]
        );
    }

    #[test]
    fn search_page_reads_hits_and_cursor() {
        let response = json!({
            "_scroll_id": "abc",
            "hits": { "hits": [
                { "_id": "node_1", "_source": { "type": "Feature" } },
                { "_source": {} }
            ]}
        });
        let page = parse_search_page(&response);
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].id, "node_1");
        assert_eq!(page.scroll_id.as_deref(), Some("abc"));
    }

    #[test]
    fn alias_response_lists_indices() {
        let response = json!({ "osm_names2": { "aliases": { "osm_names": {} } } });
        assert_eq!(alias_targets(&response), vec!["osm_names2"]);
    }
}
