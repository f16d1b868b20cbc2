use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::auth::RequestAuthenticator;
use crate::config::Config;
use crate::resources::{openstack_tree, ResourceTree};
use crate::store::{SecretStore, StoreBackend};

/// Load an env file, then install the tracing subscriber from RUST_LOG.
///
/// Env file lookup order: ARESTOR_ENV_FILE / ENV_FILE, then `.env` discovery
/// in the working directory. Variables already set are never overwritten.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ARESTOR_ENV_FILE", "ENV_FILE"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none" {
        if let Ok(path) = dotenvy::dotenv() {
            env_source = path.display().to_string();
        }
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub store: Arc<SecretStore>,
    /// Gate for the admin endpoints.
    pub authenticator: Arc<RequestAuthenticator>,
    /// Tree served under `/openstack`.
    pub openstack: Arc<ResourceTree>,
}

impl AppState {
    pub fn new(store: Arc<SecretStore>) -> Self {
        Self {
            authenticator: Arc::new(RequestAuthenticator::new(store.clone())),
            store,
            openstack: Arc::new(openstack_tree()),
        }
    }

    /// Build the store from configuration. Connecting is deferred to the first request.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let backend = config.backend()?;
        let kind = match backend {
            StoreBackend::Redis { .. } => "redis",
            StoreBackend::Memory => "memory",
        };
        tracing::info!(backend = kind, retries = config.retries, "metadata store configured");
        let store = SecretStore::from_backend(backend, config.retries)?;
        Ok(Self::new(Arc::new(store)))
    }
}

/// Response in the `{"meta": {...}, "content": ...}` shape every endpoint uses.
pub fn meta_response(code: StatusCode, status: bool, verbose: &str, content: Value) -> HttpResponse {
    HttpResponse::build(code).json(json!({
        "meta": { "status": status, "verbose": verbose },
        "content": content
    }))
}
