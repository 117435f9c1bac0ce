//! Paginated list access to the orchestration API.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::{AgentError, AgentResult};

/// One list request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub offset: usize,
    pub limit: usize,
    /// Only records with `updated_at >= since`, deleted ones included.
    pub since: Option<DateTime<Utc>>,
}

/// One page of a list response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListPage {
    pub data: Vec<Value>,
    /// Total matching records, when the server reports it.
    pub total: Option<usize>,
}

/// Source of paginated resource listings.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    /// Lists one page of the collection `kind`.
    async fn list(&self, kind: &str, query: &ListQuery) -> AgentResult<ListPage>;
}

/// HTTP client for the compute service list endpoints.
///
/// Session acquisition is external: the bearer token is taken from the
/// configuration as-is.
pub struct ApiClient {
    client: Client,
    base_url: Url,
    region: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, timeout: Duration) -> AgentResult<Self> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| AgentError::invalid_config("api.base_url", e.to_string()))?;

        let mut headers = HeaderMap::new();
        if !config.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", config.token))
                .map_err(|e| AgentError::invalid_config("api.token", e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vpcagentd/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| AgentError::api("build client", e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            region: config.region.clone(),
        })
    }

    /// Request URL for one page of `kind`.
    pub fn list_url(&self, kind: &str, query: &ListQuery) -> AgentResult<Url> {
        let mut url = self
            .base_url
            .join(kind)
            .map_err(|e| AgentError::api(format!("list {}", kind), e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("offset", &query.offset.to_string());
            pairs.append_pair("limit", &query.limit.to_string());
            pairs.append_pair("scope", "system");
            pairs.append_pair("details", "false");
            if let Some(since) = query.since {
                pairs.append_pair("delete", "all");
                pairs.append_pair(
                    "filter",
                    &format!(
                        "updated_at.ge('{}')",
                        since.to_rfc3339_opts(SecondsFormat::Secs, true)
                    ),
                );
            }
            if !self.region.is_empty() {
                pairs.append_pair("cloudregion", &self.region);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ResourceLister for ApiClient {
    async fn list(&self, kind: &str, query: &ListQuery) -> AgentResult<ListPage> {
        let operation = format!("list {}", kind);
        let url = self.list_url(kind, query)?;
        debug!(url = %url, offset = query.offset, limit = query.limit, "Listing");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::api(&operation, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::api(
                &operation,
                format!("HTTP {}: {}", status, text),
            ));
        }

        response
            .json::<ListPage>()
            .await
            .map_err(|e| AgentError::api(&operation, format!("bad response body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(region: &str) -> ApiClient {
        let config = ApiConfig {
            base_url: "http://10.0.0.2:8889/api/v2".to_string(),
            token: "secret".to_string(),
            region: region.to_string(),
            ..Default::default()
        };
        ApiClient::new(&config, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_list_url_first_pull() {
        let url = client("")
            .list_url(
                "vpcs",
                &ListQuery {
                    offset: 0,
                    limit: 1024,
                    since: None,
                },
            )
            .unwrap();
        assert_eq!(url.path(), "/api/v2/vpcs");
        let query = url.query().unwrap_or_default();
        assert!(query.contains("offset=0"));
        assert!(query.contains("limit=1024"));
        assert!(!query.contains("filter="));
        assert!(!query.contains("cloudregion"));
    }

    #[test]
    fn test_list_url_incremental() {
        let since: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        let url = client("region-1")
            .list_url(
                "servernetworks",
                &ListQuery {
                    offset: 40,
                    limit: 20,
                    since: Some(since),
                },
            )
            .unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("delete".to_string(), "all".to_string())));
        assert!(pairs.contains(&(
            "filter".to_string(),
            "updated_at.ge('2024-03-01T10:00:00Z')".to_string()
        )));
        assert!(pairs.contains(&("cloudregion".to_string(), "region-1".to_string())));
        assert!(pairs.contains(&("offset".to_string(), "40".to_string())));
    }

    #[test]
    fn test_list_page_decode() {
        let page: ListPage =
            serde_json::from_str(r#"{"data":[{"id":"v1"}],"total":7,"limit":20}"#).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.total, Some(7));

        let bare: ListPage = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert_eq!(bare.total, None);
    }

    #[test]
    fn test_invalid_base_url() {
        let config = ApiConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ApiClient::new(&config, Duration::from_secs(1)),
            Err(AgentError::InvalidConfig { .. })
        ));
    }
}
