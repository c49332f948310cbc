//! Generic paginated REST adapter driven by per-provider endpoint tables.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use unisync_core::{ConnectionContext, EntityType, Provider};
use unisync_storage::{FetchRequest, HttpFetcher};

use crate::{FetchFailure, FetchedPage, PageCursor, ProviderAdapter, ProviderFetchError, RawPage};

const ACCOUNT_PLACEHOLDER: &str = "{account_id}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// The whole collection comes back in one response.
    None,
    /// Opaque cursor read from the response body at `next_pointer`.
    Cursor {
        param: &'static str,
        next_pointer: &'static str,
    },
    /// 1-based page numbers. Without `total_pages_pointer` a short page ends the walk.
    PageNumber {
        param: &'static str,
        per_page_param: &'static str,
        per_page: u32,
        total_pages_pointer: Option<&'static str>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Bearer,
    Header(&'static str),
}

/// Where a (provider, entity type) collection lives and how to walk it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Path below the base URL; may contain `{account_id}`.
    pub path: &'static str,
    /// JSON pointer to the item array; `None` when the body is the array.
    pub items_pointer: Option<&'static str>,
    pub pagination: Pagination,
    pub auth: Auth,
}

/// Generic JSON-over-HTTP adapter driven by an [`Endpoint`] description.
pub struct RestAdapter {
    provider: Provider,
    entity_type: EntityType,
    endpoint: Endpoint,
    http: Arc<HttpFetcher>,
    base_url: Option<String>,
}

impl RestAdapter {
    pub fn new(
        provider: Provider,
        entity_type: EntityType,
        endpoint: Endpoint,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            provider,
            entity_type,
            endpoint,
            http,
            base_url: None,
        }
    }

    /// Base URL used when the connection does not carry its own.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn error(&self, failure: impl Into<FetchFailure>) -> ProviderFetchError {
        ProviderFetchError::new(self.provider, self.entity_type, failure)
    }

    /// Connection base URL, then the configured override, then the provider default.
    pub fn resolve_url(&self, ctx: &ConnectionContext) -> Result<String, ProviderFetchError> {
        let base = ctx
            .base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .unwrap_or_else(|| self.provider.default_base_url());
        let mut path = self.endpoint.path.to_string();
        if path.contains(ACCOUNT_PLACEHOLDER) {
            let account = ctx.account_id.as_deref().ok_or_else(|| {
                self.error(FetchFailure::Misconfigured(format!(
                    "{} requires a provider account id",
                    self.endpoint.path
                )))
            })?;
            path = path.replace(ACCOUNT_PLACEHOLDER, account);
        }
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    fn query_for(&self, cursor: Option<&PageCursor>) -> Vec<(String, String)> {
        match (&self.endpoint.pagination, cursor) {
            (Pagination::None, _) => Vec::new(),
            (Pagination::Cursor { param, .. }, Some(PageCursor::Cursor(c))) => {
                vec![(param.to_string(), c.clone())]
            }
            (Pagination::Cursor { .. }, _) => Vec::new(),
            (
                Pagination::PageNumber {
                    param,
                    per_page_param,
                    per_page,
                    ..
                },
                cursor,
            ) => {
                let page = match cursor {
                    Some(PageCursor::Page(n)) => *n,
                    _ => 1,
                };
                vec![
                    (param.to_string(), page.to_string()),
                    (per_page_param.to_string(), per_page.to_string()),
                ]
            }
        }
    }
}

/// Splits a response body into items and the cursor of the following page.
pub fn parse_page(
    endpoint: &Endpoint,
    body: &JsonValue,
    current: Option<&PageCursor>,
) -> Result<(Vec<JsonValue>, Option<PageCursor>), FetchFailure> {
    let items = match endpoint.items_pointer {
        Some(pointer) => body.pointer(pointer),
        None => Some(body),
    };
    let items = match items {
        Some(JsonValue::Array(items)) => items.clone(),
        Some(JsonValue::Null) | None => Vec::new(),
        Some(other) => {
            return Err(FetchFailure::Decode(format!(
                "expected an array at {}, got {}",
                endpoint.items_pointer.unwrap_or("/"),
                json_kind(other)
            )))
        }
    };

    let next = match &endpoint.pagination {
        Pagination::None => None,
        Pagination::Cursor { next_pointer, .. } => match body.pointer(next_pointer) {
            Some(JsonValue::String(c)) if !c.is_empty() && !items.is_empty() => {
                Some(PageCursor::Cursor(c.clone()))
            }
            _ => None,
        },
        Pagination::PageNumber {
            per_page,
            total_pages_pointer,
            ..
        } => {
            let page = match current {
                Some(PageCursor::Page(n)) => *n,
                _ => 1,
            };
            let more = match total_pages_pointer.and_then(|p| body.pointer(p)) {
                Some(total) => total.as_u64().is_some_and(|t| u64::from(page) < t),
                None => items.len() >= *per_page as usize,
            };
            (more && !items.is_empty()).then(|| PageCursor::Page(page + 1))
        }
    };

    Ok((items, next))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[async_trait]
impl ProviderAdapter for RestAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    async fn fetch_page(
        &self,
        ctx: &ConnectionContext,
        cursor: Option<&PageCursor>,
    ) -> Result<FetchedPage, ProviderFetchError> {
        let token = ctx
            .access_token
            .as_ref()
            .ok_or_else(|| self.error(FetchFailure::MissingCredentials))?;
        let url = self.resolve_url(ctx)?;
        let (bearer, headers) = match self.endpoint.auth {
            Auth::Bearer => (Some(token.expose()), Vec::new()),
            Auth::Header(name) => (None, vec![(name.to_string(), token.expose().to_string())]),
        };

        let response = self
            .http
            .fetch(FetchRequest {
                scope: self.provider.as_str(),
                url: &url,
                bearer,
                headers,
                query: self.query_for(cursor),
            })
            .await
            .map_err(|err| self.error(err))?;
        let body = response
            .json()
            .map_err(|err| self.error(FetchFailure::Decode(err.to_string())))?;
        let (items, next) =
            parse_page(&self.endpoint, &body, cursor).map_err(|failure| self.error(failure))?;

        tracing::debug!(
            provider = %self.provider,
            entity_type = %self.entity_type,
            connection_id = %ctx.connection_id,
            items = items.len(),
            has_next = next.is_some(),
            "fetched provider page"
        );

        Ok(FetchedPage {
            page: RawPage::decode_all(self.provider, self.entity_type, items),
            next,
        })
    }
}
