//! Shared fixtures for unit tests

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::sync::ClientContext;
use crate::transport::{ClientError, ErrorKind, HttpClient, HttpRequest, HttpResponse};

type Scripted = Result<HttpResponse, ClientError>;

/// An [`HttpClient`] that replays scripted responses and records every request.
///
/// Routed responses (matched by a URL fragment) take precedence over the
/// shared queue, which keeps concurrent units deterministic.
#[derive(Default)]
pub struct ScriptedClient {
    queue: Mutex<VecDeque<Scripted>>,
    routes: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    fallback: Mutex<Option<u16>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: u16, body: &str) {
        self.queue.lock().unwrap().push_back(Ok(HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
        }));
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.queue.lock().unwrap().push_back(Ok(HttpResponse {
            status,
            body: serde_json::to_vec(&body).unwrap(),
        }));
    }

    pub fn push_error(&self, kind: ErrorKind) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Err(ClientError::new(kind, "scripted failure")));
    }

    /// Queue a response for requests whose URL contains `fragment`
    pub fn route_json(&self, fragment: &str, status: u16, body: serde_json::Value) {
        self.route_raw(fragment, status, serde_json::to_vec(&body).unwrap());
    }

    pub fn route_raw(&self, fragment: &str, status: u16, body: Vec<u8>) {
        let response = Ok(HttpResponse { status, body });
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(response),
            None => routes.push((fragment.to_string(), VecDeque::from([response]))),
        }
    }

    /// Status returned once the scripts run dry
    pub fn set_fallback_status(&self, status: u16) {
        *self.fallback.lock().unwrap() = Some(status);
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose URL contains `fragment`
    pub fn requests_to(&self, fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        self.requests.lock().unwrap().push(request.clone());

        {
            let mut routes = self.routes.lock().unwrap();
            if let Some((_, queue)) = routes
                .iter_mut()
                .find(|(f, q)| request.url.contains(f.as_str()) && !q.is_empty())
            {
                if let Some(next) = queue.pop_front() {
                    return next;
                }
            }
        }

        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }

        match *self.fallback.lock().unwrap() {
            Some(status) => Ok(HttpResponse {
                status,
                body: Vec::new(),
            }),
            None => Err(ClientError::new(
                ErrorKind::Other,
                format!("no scripted response for {}", request.url),
            )),
        }
    }
}

pub fn client_context() -> ClientContext {
    ClientContext::new("acme", "client-1", "key-1", None)
}

/// Single-connection in-memory SQLite pool
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}
