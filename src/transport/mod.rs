//! Authenticated provider HTTP with bounded retries

mod auth;
mod client;
mod engine;
mod policy;

pub use auth::{AuthScheme, TokenExchange};
pub use client::{ClientError, HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use engine::{Provider, ProviderConfig, Request, Transport};
pub use policy::{ErrorKind, RetryPolicy, UNCAPPED_BACKOFF_CEILING};
