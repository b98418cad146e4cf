//! WHO ICD-11 API client: top-k lookup and alphabet-partitioned enumeration.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, FuturesUnordered};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::token::TokenManager;

/// Number of hits returned by a free-text lookup.
pub const FIND_LIMIT: usize = 5;

const PARTITIONS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone)]
pub struct IcdConfig {
    /// MMS search endpoint, e.g. `https://id.who.int/icd/release/11/2025-01/mms/search`.
    pub search_url: String,
    /// Base the entity id suffix is appended to for description lookups.
    pub entity_url: String,
    pub list_workers: usize,
    pub list_descriptions: bool,
    /// Description lookups in flight at once, per search.
    pub backfill_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcdMatch {
    pub id: String,
    pub name: String,
    pub desc: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    destination_entities: Vec<DestinationEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationEntity {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    the_code: Option<String>,
    #[serde(default, rename = "matchingPVs")]
    matching_pvs: Vec<MatchingProperty>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchingProperty {
    #[serde(default)]
    property_id: String,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct EntityResponse {
    #[serde(default)]
    definition: Option<LanguageValue>,
}

#[derive(Debug, Deserialize)]
struct LanguageValue {
    #[serde(rename = "@value", default)]
    value: String,
}

impl DestinationEntity {
    fn inline_definition(&self) -> Option<&str> {
        self.matching_pvs
            .iter()
            .find(|pv| pv.property_id == "Definition")
            .map(|pv| pv.label.trim())
            .filter(|s| !s.is_empty())
    }

    /// Last path segment of the entity URI, which the entity endpoint is keyed by.
    fn id_suffix(&self) -> &str {
        self.id
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.id)
    }
}

pub struct IcdClient {
    client: Client,
    tokens: Arc<TokenManager>,
    config: IcdConfig,
}

impl IcdClient {
    pub fn new(client: Client, tokens: Arc<TokenManager>, config: IcdConfig) -> Self {
        Self {
            client,
            tokens,
            config,
        }
    }

    /// Top-k lookup for `query`, back-filling missing descriptions.
    pub async fn find(&self, query: &str) -> Result<Vec<IcdMatch>> {
        let token = self.tokens.ensure_valid().await?;
        let params = [
            ("q", query.to_string()),
            ("subtreeFilterUsesFoundationDescendants", "false".to_string()),
            ("includeKeywordResult", "false".to_string()),
            ("useFlexisearch", "false".to_string()),
            ("flatResults", "true".to_string()),
            ("highlightingEnabled", "false".to_string()),
            ("medicalCodingMode", "false".to_string()),
            (
                "propertiesToBeSearched",
                "Title,FullySpecifiedName,Definition,IndexTerm".to_string(),
            ),
        ];
        let target = format!("icd search q={query:?}");
        self.search(&token, &params, &target, FIND_LIMIT, true).await
    }

    /// Enumerates up to `size` entities by fanning one search per letter across
    /// a small worker pool.
    ///
    /// The first partition error aborts the whole call. Once `size` entities
    /// have arrived the remaining in-flight partitions are dropped. Ordering
    /// across partitions is whatever order they complete in.
    pub async fn list(&self, size: usize) -> Result<Vec<IcdMatch>> {
        let token = self.tokens.ensure_valid().await?;
        if size == 0 {
            return Ok(Vec::new());
        }

        let workers = self.config.list_workers.max(1);
        let mut queue = PARTITIONS.chars();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..workers {
            if let Some(letter) = queue.next() {
                in_flight.push(self.search_partition(&token, letter, size));
            }
        }

        let mut out: Vec<IcdMatch> = Vec::new();
        while let Some((letter, result)) = in_flight.next().await {
            let batch = result?;
            tracing::debug!("partition {} returned {} entities", letter, batch.len());
            out.extend(batch);
            if out.len() >= size {
                out.truncate(size);
                return Ok(out);
            }

            if let Some(next) = queue.next() {
                in_flight.push(self.search_partition(&token, next, size));
            }
        }

        Ok(out)
    }

    async fn search_partition(
        &self,
        token: &str,
        letter: char,
        size: usize,
    ) -> (char, Result<Vec<IcdMatch>>) {
        let params = [
            ("q", letter.to_string()),
            ("maxList", size.to_string()),
            ("flatResults", "true".to_string()),
            ("highlightingEnabled", "false".to_string()),
        ];
        let target = format!("icd search q='{letter}'");
        let result = self
            .search(token, &params, &target, size, self.config.list_descriptions)
            .await;
        (letter, result)
    }

    async fn search(
        &self,
        token: &str,
        params: &[(&str, String)],
        target: &str,
        cap: usize,
        backfill: bool,
    ) -> Result<Vec<IcdMatch>> {
        let response: SearchResponse = self
            .get_json(&self.config.search_url, params, token, target)
            .await?;

        let entities: Vec<DestinationEntity> =
            response.destination_entities.into_iter().take(cap).collect();

        let mut matches: Vec<IcdMatch> = entities
            .iter()
            .map(|e| IcdMatch {
                id: e.the_code.clone().unwrap_or_default(),
                name: e.title.clone(),
                desc: e.inline_definition().unwrap_or_default().to_string(),
            })
            .collect();

        if backfill {
            let missing: Vec<usize> = matches
                .iter()
                .enumerate()
                .filter(|(_, m)| m.desc.is_empty())
                .map(|(idx, _)| idx)
                .collect();
            let pending = missing.into_iter().map(|idx| {
                let entity = &entities[idx];
                async move { (idx, self.fetch_description(token, entity).await) }
            });
            let filled: Vec<(usize, String)> = stream::iter(pending)
                .buffer_unordered(self.config.backfill_concurrency.max(1))
                .collect()
                .await;
            for (idx, desc) in filled {
                matches[idx].desc = desc;
            }
        }

        Ok(matches)
    }

    /// Description for one entity; failures degrade to an empty description.
    async fn fetch_description(&self, token: &str, entity: &DestinationEntity) -> String {
        let suffix = entity.id_suffix();
        let url = format!("{}/{}", self.config.entity_url.trim_end_matches('/'), suffix);
        let target = format!("icd entity {suffix}");
        tracing::info!(
            "Fetching description for code ({}) id: {}",
            entity.the_code.as_deref().unwrap_or(""),
            entity.id
        );

        match self
            .get_json::<EntityResponse>(&url, &[], token, &target)
            .await
        {
            Ok(resp) => resp.definition.map(|d| d.value).unwrap_or_default(),
            Err(e) => {
                tracing::warn!("description back-fill failed: {}", e);
                String::new()
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
        token: &str,
        target: &str,
    ) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .header("API-Version", "v2")
            .header(reqwest::header::ACCEPT_LANGUAGE, "en")
            .send()
            .await
            .map_err(|e| BridgeError::transport(target, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BridgeError::transport(target, e))?;
        if !status.is_success() {
            return Err(BridgeError::status(target, status, &body));
        }

        serde_json::from_str(&body).map_err(|source| BridgeError::Decode {
            target: target.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::{Path as AxumPath, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::testutil;
    use crate::token::IdentityConfig;

    #[derive(Clone, Default)]
    struct Mock {
        /// Entities returned per search, before `maxList` is applied.
        per_search: usize,
        /// Letter whose partition search answers 500.
        failing_letter: Option<String>,
        malformed: bool,
        searches: Arc<AtomicUsize>,
        /// Entity lookups currently being served, and the most seen at once.
        entity_in_flight: Arc<AtomicUsize>,
        entity_peak: Arc<AtomicUsize>,
        entity_delay_ms: u64,
    }

    async fn token() -> impl IntoResponse {
        Json(json!({"access_token": "tok", "expires_in": 3600, "token_type": "Bearer"}))
    }

    async fn search(
        State(st): State<Mock>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        st.searches.fetch_add(1, Ordering::SeqCst);
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer tok")
        );
        let term = q.get("q").cloned().unwrap_or_default();
        if st.failing_letter.as_deref() == Some(term.as_str()) {
            return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
        }
        if st.malformed {
            return (StatusCode::OK, "{\"destinationEntities\": 7}").into_response();
        }

        let max = q
            .get("maxList")
            .and_then(|m| m.parse::<usize>().ok())
            .unwrap_or(usize::MAX);
        let entities: Vec<_> = (0..st.per_search.min(max))
            .map(|i| {
                let mut pvs = vec![json!({"propertyId": "Title", "label": term})];
                if i == 0 {
                    pvs.push(json!({"propertyId": "Definition", "label": "inline definition"}));
                }
                json!({
                    "id": format!("http://id.who.int/icd/entity/{term}{i}"),
                    "title": format!("{term} title {i}"),
                    "theCode": format!("{term}{i:02}"),
                    "matchingPVs": pvs,
                })
            })
            .collect();
        Json(json!({"destinationEntities": entities, "error": false})).into_response()
    }

    async fn entity(
        State(st): State<Mock>,
        AxumPath(id): AxumPath<String>,
    ) -> impl IntoResponse {
        let now = st.entity_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        st.entity_peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(st.entity_delay_ms)).await;
        st.entity_in_flight.fetch_sub(1, Ordering::SeqCst);

        if id.ends_with('2') {
            return (StatusCode::NOT_FOUND, "gone").into_response();
        }
        Json(json!({"definition": {"@language": "en", "@value": format!("definition of {id}")}}))
            .into_response()
    }

    async fn client_for(mock: Mock, list_descriptions: bool) -> IcdClient {
        client_with_backfill(mock, list_descriptions, 8).await
    }

    async fn client_with_backfill(
        mock: Mock,
        list_descriptions: bool,
        backfill_concurrency: usize,
    ) -> IcdClient {
        let router = Router::new()
            .route("/connect/token", post(token))
            .route("/mms/search", get(search))
            .route("/mms/:id", get(entity))
            .with_state(mock);
        let base = testutil::serve(router).await;
        let http = Client::new();
        let tokens = TokenManager::new(
            http.clone(),
            IdentityConfig {
                token_url: format!("{base}/connect/token"),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                scope: "icdapi_access".to_string(),
            },
        );
        IcdClient::new(
            http,
            Arc::new(tokens),
            IcdConfig {
                search_url: format!("{base}/mms/search"),
                entity_url: format!("{base}/mms"),
                list_workers: 2,
                list_descriptions,
                backfill_concurrency,
            },
        )
    }

    #[tokio::test]
    async fn find_caps_results_and_backfills_descriptions() {
        let mock = Mock {
            per_search: 8,
            ..Default::default()
        };
        let client = client_for(mock, true).await;

        let hits = client.find("cholera").await.unwrap();
        assert_eq!(hits.len(), FIND_LIMIT);
        assert_eq!(hits[0].id, "cholera00");
        assert_eq!(hits[0].name, "cholera title 0");
        assert_eq!(hits[0].desc, "inline definition");
        assert_eq!(hits[1].desc, "definition of cholera1");
        // The entity endpoint 404s for ids ending in 2.
        assert_eq!(hits[2].desc, "");
        assert_eq!(hits[3].desc, "definition of cholera3");
    }

    #[tokio::test]
    async fn find_surfaces_status_and_decode_failures() {
        let failing = Mock {
            per_search: 1,
            failing_letter: Some("cholera".to_string()),
            ..Default::default()
        };
        let err = client_for(failing, true)
            .await
            .find("cholera")
            .await
            .unwrap_err();
        assert!(
            matches!(err, BridgeError::Transport { status: Some(500), ref target, .. } if target.contains("cholera")),
            "{err}"
        );

        let malformed = Mock {
            malformed: true,
            ..Default::default()
        };
        let err = client_for(malformed, true)
            .await
            .find("cholera")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Decode { .. }), "{err}");
    }

    #[tokio::test]
    async fn list_stops_once_size_is_reached() {
        let mock = Mock {
            per_search: 10,
            ..Default::default()
        };
        let searches = Arc::clone(&mock.searches);
        let client = client_for(mock, false).await;

        let out = client.list(7).await.unwrap();
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|m| m.desc.is_empty() || m.desc == "inline definition"));
        // The first batch already satisfies the target; at most the pool's
        // initial workers ran.
        assert!(searches.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn list_collects_every_partition_when_short() {
        let mock = Mock {
            per_search: 1,
            ..Default::default()
        };
        let client = client_for(mock, true).await;

        let out = client.list(1000).await.unwrap();
        assert_eq!(out.len(), 26);
        let mut codes: Vec<String> = out.into_iter().map(|m| m.id).collect();
        codes.sort();
        assert_eq!(codes.first().map(String::as_str), Some("A00"));
        assert_eq!(codes.last().map(String::as_str), Some("Z00"));
    }

    #[tokio::test]
    async fn description_backfill_is_bounded() {
        let mock = Mock {
            per_search: 40,
            entity_delay_ms: 30,
            ..Default::default()
        };
        let peak = Arc::clone(&mock.entity_peak);
        let client = client_with_backfill(mock, true, 3).await;

        let out = client.list(60).await.unwrap();
        assert_eq!(out.len(), 60);
        // Two partition workers, each with at most three lookups in flight.
        let seen = peak.load(Ordering::SeqCst);
        assert!((1..=6).contains(&seen), "peak concurrent entity lookups {seen}");
        assert!(out.iter().filter(|m| m.desc.starts_with("definition of")).count() > 0);
    }

    #[tokio::test]
    async fn list_returns_first_partition_error_without_partial_results() {
        let mock = Mock {
            per_search: 1,
            failing_letter: Some("C".to_string()),
            ..Default::default()
        };
        let client = client_for(mock, false).await;

        let err = client.list(1000).await.unwrap_err();
        match err {
            BridgeError::Transport { target, status, .. } => {
                assert_eq!(target, "icd search q='C'");
                assert_eq!(status, Some(500));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn credential_failure_is_fatal() {
        let router = Router::new().route(
            "/connect/token",
            post(|| async { (StatusCode::BAD_REQUEST, "invalid_client") }),
        );
        let base = testutil::serve(router).await;
        let http = Client::new();
        let tokens = TokenManager::new(
            http.clone(),
            IdentityConfig {
                token_url: format!("{base}/connect/token"),
                client_id: "id".to_string(),
                client_secret: "wrong".to_string(),
                scope: "icdapi_access".to_string(),
            },
        );
        let client = IcdClient::new(
            http,
            Arc::new(tokens),
            IcdConfig {
                search_url: format!("{base}/mms/search"),
                entity_url: format!("{base}/mms"),
                list_workers: 2,
                list_descriptions: false,
                backfill_concurrency: 8,
            },
        );

        assert!(matches!(
            client.find("cholera").await,
            Err(BridgeError::Credential { .. })
        ));
        assert!(matches!(
            client.list(10).await,
            Err(BridgeError::Credential { .. })
        ));
    }
}
