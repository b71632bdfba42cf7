//! Provider authentication schemes

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::sync::ClientContext;

/// How a provider expects requests to be authenticated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// API key in a named header
    ApiKey { header: String },
    /// `Authorization: Bearer <api_key>`
    Bearer,
    /// Client id and API key in two headers
    KeyPair {
        client_id_header: String,
        api_key_header: String,
    },
    /// `Authorization: Basic base64(client_id:api_secret)`
    Basic,
    /// A token obtained once per transport by exchanging the client's credentials
    TokenExchange(TokenExchange),
}

/// Credential exchange endpoint description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenExchange {
    /// Path (relative to the provider base URL) of the token endpoint
    pub path: String,
    /// JSON pointer to the token in the exchange response
    #[serde(default = "default_token_pointer")]
    pub token_pointer: String,
    /// Header carrying the token on subsequent calls
    #[serde(default = "default_token_header")]
    pub header: String,
    /// Prefix placed before the token, e.g. `"Bearer "`
    #[serde(default = "default_token_prefix")]
    pub prefix: String,
}

fn default_token_pointer() -> String {
    "/access_token".to_string()
}

fn default_token_header() -> String {
    "Authorization".to_string()
}

fn default_token_prefix() -> String {
    "Bearer ".to_string()
}

impl TokenExchange {
    /// Request body sent to the token endpoint
    pub fn request_body(&self, client: &ClientContext) -> Result<serde_json::Value> {
        let secret = client.api_secret.as_deref().ok_or_else(|| {
            SyncError::Config(format!(
                "client {} needs an api_secret for token exchange",
                client.client_id
            ))
        })?;
        Ok(serde_json::json!({
            "client_id": client.client_id,
            "api_key": client.api_key,
            "client_secret": secret,
        }))
    }

    /// Extract the token from the exchange response
    pub fn extract_token(&self, response: &serde_json::Value) -> Result<String> {
        response
            .pointer(&self.token_pointer)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| SyncError::Auth {
                status: 200,
                message: format!("token exchange response has no token at {}", self.token_pointer),
            })
    }

    pub fn header_for(&self, token: &str) -> (String, String) {
        (self.header.clone(), format!("{}{}", self.prefix, token))
    }
}

impl AuthScheme {
    /// Headers for schemes that need no network round trip.
    ///
    /// Returns `None` for [`AuthScheme::TokenExchange`], which the engine
    /// resolves itself.
    pub fn static_headers(&self, client: &ClientContext) -> Result<Option<Vec<(String, String)>>> {
        let headers = match self {
            AuthScheme::ApiKey { header } => vec![(header.clone(), client.api_key.clone())],
            AuthScheme::Bearer => vec![(
                "Authorization".to_string(),
                format!("Bearer {}", client.api_key),
            )],
            AuthScheme::KeyPair {
                client_id_header,
                api_key_header,
            } => vec![
                (client_id_header.clone(), client.client_id.clone()),
                (api_key_header.clone(), client.api_key.clone()),
            ],
            AuthScheme::Basic => {
                let secret = client.api_secret.as_deref().ok_or_else(|| {
                    SyncError::Config(format!(
                        "client {} needs an api_secret for basic auth",
                        client.client_id
                    ))
                })?;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", client.client_id, secret));
                vec![("Authorization".to_string(), format!("Basic {}", encoded))]
            }
            AuthScheme::TokenExchange(_) => return Ok(None),
        };
        Ok(Some(headers))
    }
}
