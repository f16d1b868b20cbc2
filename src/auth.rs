/* arestor/src/auth.rs

Request authenticator: the gate every protected resource runs first.

One pass per request, no retries:
1. `api_key` → secret via the SecretStore. Missing key, unknown key or a
   store failure all reject with "Invalid api key provided.".
2. `content` is removed from the parameters. Absent or empty → accept.
3. `content` is decrypted with AesCipher(secret) and parsed as a JSON object.
   Any failure rejects with "Invalid request."; the cause is logged only.
   On success every decoded pair is merged into the parameters (last write wins).
4. `status` and `verbose` are written last, so decoded content cannot forge them.

The verdict is both returned and recorded in the parameter set; handlers and
the gate response only look at those two fields.
*/

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cipher::{AesCipher, CipherError};
use crate::store::SecretStore;

pub const API_KEY: &str = "api_key";
pub const CONTENT: &str = "content";
pub const STATUS: &str = "status";
pub const VERBOSE: &str = "verbose";

pub const MSG_OK: &str = "OK";
pub const MSG_INVALID_API_KEY: &str = "Invalid api key provided.";
pub const MSG_INVALID_REQUEST: &str = "Invalid request.";

// ==============================
// Request parameters
// ==============================

/// Mutable, request-scoped parameter set (query string, form body and
/// decrypted content all land here).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestParams(Map<String, Value>);

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Fold `fields` in; existing keys are overwritten.
    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.0.insert(key, value);
        }
    }

    /// The recorded verdict, `false` until the authenticator has run.
    pub fn status(&self) -> bool {
        self.0.get(STATUS).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn verbose(&self) -> Option<&str> {
        self.get_str(VERBOSE)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<HashMap<String, String>> for RequestParams {
    fn from(raw: HashMap<String, String>) -> Self {
        raw.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
    }
}

impl FromIterator<(String, Value)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ==============================
// Verdict
// ==============================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: bool,
    pub verbose: String,
}

impl Verdict {
    fn accepted() -> Self {
        Self {
            status: true,
            verbose: MSG_OK.to_string(),
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            status: false,
            verbose: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    InvalidApiKey,
    InvalidRequest,
}

impl Rejection {
    fn message(self) -> &'static str {
        match self {
            Rejection::InvalidApiKey => MSG_INVALID_API_KEY,
            Rejection::InvalidRequest => MSG_INVALID_REQUEST,
        }
    }
}

// ==============================
// Content codec
// ==============================

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("failed to decrypt content: {0}")]
    Cipher(#[from] CipherError),
    #[error("decrypted content is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid content type provided: {0}")]
    NotAnObject(&'static str),
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decrypt an envelope and require a JSON object inside.
pub fn decode_content(secret: &str, envelope: &str) -> Result<Map<String, Value>, ContentError> {
    let plaintext = AesCipher::new(secret).decrypt(envelope)?;
    match serde_json::from_str::<Value>(&plaintext)? {
        Value::Object(fields) => Ok(fields),
        other => Err(ContentError::NotAnObject(json_type_name(&other))),
    }
}

/// Inverse of [`decode_content`]; used by the client.
pub fn encode_content(secret: &str, fields: &Map<String, Value>) -> Result<String, ContentError> {
    let plaintext = serde_json::to_vec(fields)?;
    Ok(AesCipher::new(secret).encrypt(&plaintext))
}

// ==============================
// Authenticator
// ==============================

pub struct RequestAuthenticator {
    store: Arc<SecretStore>,
}

impl RequestAuthenticator {
    pub fn new(store: Arc<SecretStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    /// Run the gate over `params`, recording `status`/`verbose` in it.
    pub fn authenticate(&self, params: &mut RequestParams) -> Verdict {
        let verdict = match self.evaluate(params) {
            Ok(()) => Verdict::accepted(),
            Err(rejection) => Verdict::rejected(rejection.message()),
        };
        params.insert(STATUS, verdict.status);
        params.insert(VERBOSE, verdict.verbose.clone());
        verdict
    }

    fn evaluate(&self, params: &mut RequestParams) -> Result<(), Rejection> {
        let api_key = match params.get_str(API_KEY) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => {
                debug!("request without api key");
                return Err(Rejection::InvalidApiKey);
            }
        };

        let secret = match self.store.get_secret(&api_key) {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                debug!(api_key = %api_key, "unknown api key");
                return Err(Rejection::InvalidApiKey);
            }
            Err(err) => {
                warn!("secret lookup failed, rejecting request: {}", err);
                return Err(Rejection::InvalidApiKey);
            }
        };

        let envelope = match params.remove(CONTENT) {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::String(s)) if s.is_empty() => return Ok(()),
            Some(Value::String(s)) => s,
            Some(other) => {
                error!("Invalid content field type: {}", json_type_name(&other));
                return Err(Rejection::InvalidRequest);
            }
        };

        match decode_content(&secret, &envelope) {
            Ok(fields) => {
                debug!(fields = fields.len(), "merging decrypted content");
                params.merge(fields);
                Ok(())
            }
            Err(err) => {
                error!("{}", err);
                Err(Rejection::InvalidRequest)
            }
        }
    }
}

// ==============================
// Tests
// ==============================
