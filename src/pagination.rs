//! Paginated fetch
//!
//! One iterative loop drives the three provider pagination styles and yields a
//! flat, lazy stream of records. Pages are requested only as the stream is
//! polled, and a page cap bounds the loop when a provider keeps returning
//! cursors.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PaginationError, Result};
use crate::reconcile::RawRecord;
use crate::transport::{Request, Transport};

/// Position of the next page.
///
/// A cursor is only ever produced from the response to the previous request
/// of the same fetch, so styles are never mixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Offset(u64),
    LastId(String),
    PageToken(String),
}

/// How a provider pages through results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Increment an offset until a page comes back short
    Offset {
        #[serde(default = "default_offset_param")]
        offset_param: String,
        #[serde(default = "default_limit_param")]
        limit_param: String,
        page_size: u64,
    },
    /// Pass the last seen id until the cumulative count reaches the reported total
    LastId {
        #[serde(default = "default_last_id_param")]
        last_id_param: String,
        #[serde(default = "default_limit_param")]
        limit_param: String,
        page_size: u64,
        /// JSON pointer to the provider-reported total
        total_pointer: String,
        /// JSON pointer to the id to resume after
        last_id_pointer: String,
    },
    /// Follow an opaque next-page token until it is absent or empty
    PageToken {
        #[serde(default = "default_token_param")]
        token_param: String,
        next_token_pointer: String,
    },
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

fn default_last_id_param() -> String {
    "last_id".to_string()
}

fn default_token_param() -> String {
    "page_token".to_string()
}

impl PaginationStyle {
    fn label(&self) -> &'static str {
        match self {
            PaginationStyle::Offset { .. } => "offset",
            PaginationStyle::LastId { .. } => "last_id",
            PaginationStyle::PageToken { .. } => "page_token",
        }
    }
}

/// Where cursor parameters go on the outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPlacement {
    #[default]
    Query,
    Body,
}

pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// A request template plus everything needed to walk its pages
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub request: Request,
    pub style: PaginationStyle,
    /// JSON pointer to the records array in each page; empty for the root
    pub items_pointer: String,
    pub placement: CursorPlacement,
    pub max_pages: u32,
}

impl PageRequest {
    pub fn new(request: Request, style: PaginationStyle) -> Self {
        Self {
            request,
            style,
            items_pointer: String::new(),
            placement: CursorPlacement::Query,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = pointer.into();
        self
    }

    pub fn with_placement(mut self, placement: CursorPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// The template with cursor parameters applied for one page
    fn page(&self, cursor: Option<&PageCursor>) -> Request {
        let mut request = self.request.clone();
        match (&self.style, cursor) {
            (
                PaginationStyle::Offset {
                    offset_param,
                    limit_param,
                    page_size,
                },
                cursor,
            ) => {
                let offset = match cursor {
                    Some(PageCursor::Offset(n)) => *n,
                    _ => 0,
                };
                self.set(&mut request, offset_param, Value::from(offset));
                self.set(&mut request, limit_param, Value::from(*page_size));
            }
            (
                PaginationStyle::LastId {
                    last_id_param,
                    limit_param,
                    page_size,
                    ..
                },
                cursor,
            ) => {
                let last_id = match cursor {
                    Some(PageCursor::LastId(id)) => id.clone(),
                    _ => String::new(),
                };
                self.set(&mut request, last_id_param, Value::from(last_id));
                self.set(&mut request, limit_param, Value::from(*page_size));
            }
            (PaginationStyle::PageToken { token_param, .. }, Some(PageCursor::PageToken(token))) => {
                self.set(&mut request, token_param, Value::from(token.clone()));
            }
            (PaginationStyle::PageToken { .. }, _) => {}
        }
        request
    }

    fn set(&self, request: &mut Request, name: &str, value: Value) {
        match self.placement {
            CursorPlacement::Query => {
                request.query.retain(|(k, _)| k != name);
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                request.query.push((name.to_string(), text));
            }
            CursorPlacement::Body => {
                let body = request
                    .body
                    .get_or_insert_with(|| Value::Object(Default::default()));
                if !body.is_object() {
                    *body = Value::Object(Default::default());
                }
                if let Value::Object(map) = body {
                    map.insert(name.to_string(), value);
                }
            }
        }
    }
}

struct Pager<'a> {
    transport: &'a Transport,
    page: PageRequest,
    cursor: Option<PageCursor>,
    pages: u32,
    fetched: u64,
}

/// Lazily fetch every record behind a paginated endpoint.
///
/// The first failure ends the stream.
pub fn fetch<'a>(transport: &'a Transport, page: PageRequest) -> BoxStream<'a, Result<RawRecord>> {
    let pager = Pager {
        transport,
        page,
        cursor: None,
        pages: 0,
        fetched: 0,
    };

    stream::unfold(Some(pager), |state| async move {
        let mut pager = state?;
        match next_page(&mut pager).await {
            Ok((records, more)) => Some((Ok(records), more.then_some(pager))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

/// Fetch one page; the flag says whether another page follows
async fn next_page(pager: &mut Pager<'_>) -> Result<(Vec<RawRecord>, bool)> {
    if pager.pages >= pager.page.max_pages {
        tracing::error!(
            style = pager.page.style.label(),
            cap = pager.page.max_pages,
            fetched = pager.fetched,
            "Pagination did not terminate within page cap"
        );
        return Err(PaginationError::CapExceeded {
            cap: pager.page.max_pages,
        }
        .into());
    }

    let request = pager.page.page(pager.cursor.as_ref());
    let body = pager.transport.call(&request).await?;
    let records = extract_records(&body, &pager.page.items_pointer)?;

    pager.pages += 1;
    pager.fetched += records.len() as u64;

    tracing::debug!(
        style = pager.page.style.label(),
        page = pager.pages,
        records = records.len(),
        fetched = pager.fetched,
        "Fetched page"
    );

    let next = match &pager.page.style {
        PaginationStyle::Offset { page_size, .. } => {
            if (records.len() as u64) < *page_size {
                None
            } else {
                let offset = match pager.cursor {
                    Some(PageCursor::Offset(n)) => n,
                    _ => 0,
                };
                Some(PageCursor::Offset(offset + records.len() as u64))
            }
        }
        PaginationStyle::LastId {
            total_pointer,
            last_id_pointer,
            ..
        } => {
            let total = body
                .pointer(total_pointer)
                .and_then(as_count)
                .ok_or_else(|| {
                    PaginationError::UnexpectedShape(format!(
                        "no total at {}",
                        total_pointer
                    ))
                })?;

            if pager.fetched >= total {
                None
            } else if records.is_empty() {
                return Err(PaginationError::ShortTotal {
                    fetched: pager.fetched,
                    total,
                }
                .into());
            } else {
                let last_id = body
                    .pointer(last_id_pointer)
                    .and_then(as_id)
                    .ok_or_else(|| {
                        PaginationError::UnexpectedShape(format!(
                            "no last id at {} with {} of {} records fetched",
                            last_id_pointer, pager.fetched, total
                        ))
                    })?;
                Some(PageCursor::LastId(last_id))
            }
        }
        PaginationStyle::PageToken {
            next_token_pointer, ..
        } => body
            .pointer(next_token_pointer)
            .and_then(|v| v.as_str())
            .filter(|token| !token.is_empty())
            .map(|token| PageCursor::PageToken(token.to_string())),
    };

    let more = next.is_some();
    pager.cursor = next;
    Ok((records, more))
}

fn extract_records(body: &Value, pointer: &str) -> Result<Vec<RawRecord>> {
    let items = match body.pointer(pointer) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(PaginationError::UnexpectedShape(format!(
                "expected an array at '{}', found {}",
                pointer,
                json_type(other)
            ))
            .into())
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map.clone()),
            other => Err(PaginationError::UnexpectedShape(format!(
                "expected record objects, found {}",
                json_type(other)
            ))
            .into()),
        })
        .collect()
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::test_support::{client_context, ScriptedClient};
    use crate::transport::{AuthScheme, Provider, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    fn session(http: Arc<ScriptedClient>) -> Transport {
        Arc::new(
            Provider::new(
                "acme",
                "https://api.example.com",
                AuthScheme::Bearer,
                RetryPolicy::no_retry(),
                http,
                4,
            )
            .unwrap(),
        )
        .session(client_context())
    }

    fn rows(range: std::ops::Range<u64>) -> Value {
        Value::Array(range.map(|i| json!({"id": i})).collect())
    }

    fn offset_style(page_size: u64) -> PaginationStyle {
        PaginationStyle::Offset {
            offset_param: "offset".into(),
            limit_param: "limit".into(),
            page_size,
        }
    }

    #[tokio::test]
    async fn test_offset_fetches_all_records_in_three_requests() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"result": rows(0..1000)}));
        http.push_json(200, json!({"result": rows(1000..2000)}));
        http.push_json(200, json!({"result": rows(2000..2500)}));

        let transport = session(http.clone());
        let page = PageRequest::new(Request::get("/v1/postings"), offset_style(1000))
            .with_items_pointer("/result");
        let records: Vec<RawRecord> = fetch(&transport, page).try_collect().await.unwrap();

        assert_eq!(records.len(), 2500);
        assert_eq!(records[0]["id"], json!(0));
        assert_eq!(records[2499]["id"], json!(2499));

        let sent = http.requests();
        assert_eq!(sent.len(), 3);
        let offsets: Vec<_> = sent
            .iter()
            .map(|r| r.query.iter().find(|(k, _)| k == "offset").unwrap().1.clone())
            .collect();
        assert_eq!(offsets, vec!["0", "1000", "2000"]);
    }

    #[tokio::test]
    async fn test_last_id_stops_at_reported_total() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(
            200,
            json!({"result": {"items": rows(0..2), "total": 3, "last_id": "b"}}),
        );
        http.push_json(
            200,
            json!({"result": {"items": rows(2..3), "total": 3, "last_id": "c"}}),
        );

        let transport = session(http.clone());
        let style = PaginationStyle::LastId {
            last_id_param: "last_id".into(),
            limit_param: "limit".into(),
            page_size: 2,
            total_pointer: "/result/total".into(),
            last_id_pointer: "/result/last_id".into(),
        };
        let page = PageRequest::new(Request::post("/v3/stocks").idempotent(), style)
            .with_items_pointer("/result/items")
            .with_placement(CursorPlacement::Body);
        let records: Vec<RawRecord> = fetch(&transport, page).try_collect().await.unwrap();

        assert_eq!(records.len(), 3);
        let sent = http.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].body, Some(json!({"last_id": "", "limit": 2})));
        assert_eq!(sent[1].body, Some(json!({"last_id": "b", "limit": 2})));
    }

    #[tokio::test]
    async fn test_last_id_empty_page_before_total_is_an_error() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(
            200,
            json!({"result": {"items": rows(0..2), "total": 5, "last_id": "b"}}),
        );
        http.push_json(200, json!({"result": {"items": [], "total": 5}}));

        let transport = session(http.clone());
        let style = PaginationStyle::LastId {
            last_id_param: "last_id".into(),
            limit_param: "limit".into(),
            page_size: 2,
            total_pointer: "/result/total".into(),
            last_id_pointer: "/result/last_id".into(),
        };
        let page = PageRequest::new(Request::post("/v3/stocks").idempotent(), style)
            .with_items_pointer("/result/items");
        let result: Result<Vec<RawRecord>> = fetch(&transport, page).try_collect().await;

        assert!(matches!(
            result,
            Err(SyncError::Pagination(PaginationError::ShortTotal {
                fetched: 2,
                total: 5
            }))
        ));
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_page_token_stops_on_absent_or_empty_token() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"data": rows(0..2), "next": "t2"}));
        http.push_json(200, json!({"data": rows(2..4), "next": ""}));

        let transport = session(http.clone());
        let style = PaginationStyle::PageToken {
            token_param: "page_token".into(),
            next_token_pointer: "/next".into(),
        };
        let page = PageRequest::new(Request::get("/orders"), style.clone()).with_items_pointer("/data");
        let records: Vec<RawRecord> = fetch(&transport, page).try_collect().await.unwrap();
        assert_eq!(records.len(), 4);

        let sent = http.requests();
        assert!(sent[0].query.is_empty());
        assert_eq!(sent[1].query, vec![("page_token".to_string(), "t2".to_string())]);

        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!({"data": rows(0..1)}));
        let transport = session(http.clone());
        let page = PageRequest::new(Request::get("/orders"), style).with_items_pointer("/data");
        let records: Vec<RawRecord> = fetch(&transport, page).try_collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn test_page_cap_exceeded() {
        let http = Arc::new(ScriptedClient::new());
        for i in 0..3 {
            http.push_json(200, json!({"data": rows(i..i + 1), "next": "again"}));
        }

        let transport = session(http.clone());
        let style = PaginationStyle::PageToken {
            token_param: "page_token".into(),
            next_token_pointer: "/next".into(),
        };
        let page = PageRequest::new(Request::get("/orders"), style)
            .with_items_pointer("/data")
            .with_max_pages(2);
        let result: Result<Vec<RawRecord>> = fetch(&transport, page).try_collect().await;

        assert!(matches!(
            result,
            Err(SyncError::Pagination(PaginationError::CapExceeded { cap: 2 }))
        ));
        assert_eq!(http.call_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_is_lazy() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, rows(0..10));
        http.push_json(200, rows(10..20));

        let transport = session(http.clone());
        let page = PageRequest::new(Request::get("/items"), offset_style(10));
        let mut stream = fetch(&transport, page);

        assert_eq!(http.call_count(), 0);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first["id"], json!(0));
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn test_non_object_items_are_rejected() {
        let http = Arc::new(ScriptedClient::new());
        http.push_json(200, json!([1, 2, 3]));

        let transport = session(http.clone());
        let page = PageRequest::new(Request::get("/items"), offset_style(10));
        let result: Result<Vec<RawRecord>> = fetch(&transport, page).try_collect().await;

        assert!(matches!(
            result,
            Err(SyncError::Pagination(PaginationError::UnexpectedShape(_)))
        ));
    }
}
