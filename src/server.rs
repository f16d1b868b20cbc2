use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::auth::{RequestParams, MSG_OK};
use crate::resources::{Node, ResourceError, OPENSTACK_NAMESPACE};
use crate::store::{ResourceRecord, StoreError};
use crate::util::{meta_response, AppState};

const MSG_UNAVAILABLE: &str = "Metadata store unavailable.";
const MSG_NOT_FOUND: &str = "Resource not found.";

/// Largest urlencoded body accepted on admin writes. Sealed user data grows
/// by a third after base64, well past actix's 16 KiB default.
pub const FORM_LIMIT: usize = 1024 * 1024;

type FormBody = Result<web::Form<HashMap<String, String>>, actix_web::Error>;

/// Handler outcome built on a blocking worker; turned into an HttpResponse
/// back on the async side.
#[derive(Debug, Clone, PartialEq)]
struct Reply {
    code: StatusCode,
    status: bool,
    verbose: String,
    content: Value,
}

impl Reply {
    fn ok(content: Value) -> Self {
        Self::with_code(StatusCode::OK, content)
    }

    fn with_code(code: StatusCode, content: Value) -> Self {
        Self {
            code,
            status: true,
            verbose: MSG_OK.to_string(),
            content,
        }
    }

    fn fail(code: StatusCode, verbose: &str) -> Self {
        Self {
            code,
            status: false,
            verbose: verbose.to_string(),
            content: Value::Null,
        }
    }

    fn store_error(operation: &str, err: StoreError) -> Self {
        error!("{} failed: {}", operation, err);
        Self::fail(StatusCode::SERVICE_UNAVAILABLE, MSG_UNAVAILABLE)
    }

    fn into_response(self) -> HttpResponse {
        meta_response(self.code, self.status, &self.verbose, self.content)
    }
}

/// Run store-bound work off the async workers; the store blocks on network I/O.
async fn run_blocking<F>(f: F) -> HttpResponse
where
    F: FnOnce() -> Reply + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(reply) => reply.into_response(),
        Err(err) => {
            error!("request worker failed: {}", err);
            Reply::fail(StatusCode::INTERNAL_SERVER_ERROR, "Internal error.").into_response()
        }
    }
}

/// Query string merged with an urlencoded body; body values win.
fn collect_params(query: HashMap<String, String>, form: HashMap<String, String>) -> RequestParams {
    let mut raw = query;
    raw.extend(form);
    RequestParams::from(raw)
}

/// Body fields of a write request. A request without a Content-Type carries
/// its parameters in the query string only; any other body that fails to
/// parse (too large, wrong type, bad encoding) is refused outright.
fn form_fields(req: &HttpRequest, form: FormBody) -> Result<HashMap<String, String>, Reply> {
    match form {
        Ok(form) => Ok(form.into_inner()),
        Err(_) if !req.headers().contains_key(header::CONTENT_TYPE) => Ok(HashMap::new()),
        Err(err) => {
            let code = err.as_response_error().status_code();
            warn!(path = %req.path(), status = code.as_u16(), "rejecting request body: {}", err);
            Err(Reply::fail(code, "Invalid request body."))
        }
    }
}

/// Authentication gate: `Err` carries the 400 reply for rejected requests.
fn gate(state: &AppState, params: &mut RequestParams) -> Result<(), Reply> {
    let verdict = state.authenticator.authenticate(params);
    if verdict.status {
        Ok(())
    } else {
        Err(Reply::fail(StatusCode::BAD_REQUEST, &verdict.verbose))
    }
}

fn namespace_of(params: &RequestParams) -> String {
    params
        .get_str("namespace")
        .filter(|ns| !ns.is_empty())
        .unwrap_or(OPENSTACK_NAMESPACE)
        .to_string()
}

fn record_json(record: &ResourceRecord) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .app_data(web::FormConfig::default().limit(FORM_LIMIT))
            .route("/status", web::get().to(status))
            .route("/openstack", web::get().to(openstack_get))
            .route("/openstack/{tail:.*}", web::get().to(openstack_get))
            .route("/openstack/{tail:.*}", web::post().to(openstack_post))
            .route("/admin/resource", web::get().to(admin_list))
            .route("/admin/resource", web::post().to(admin_create))
            .route("/admin/resource/{resource_id}", web::get().to(admin_get))
            .route("/admin/resource/{resource_id}", web::put().to(admin_update))
            .route(
                "/admin/resource/{resource_id}",
                web::delete().to(admin_delete),
            ),
    );
}

/// Service status endpoint: version, routes and store reachability.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let routes = vec![
        "/status",
        "/openstack/{path}",
        "/admin/resource",
        "/admin/resource/{resource_id}",
    ];
    let store = state.store.clone();
    let reachable = tokio::task::spawn_blocking(move || store.is_reachable())
        .await
        .unwrap_or(false);

    web::Json(json!({
        "name": "arestor",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
        "store": {
            "reachable": reachable,
            "retries": state.store.retries(),
        }
    }))
}

// ==============================
// OpenStack metadata tree (unauthenticated, like the real endpoint)
// ==============================

fn openstack_reply(state: &AppState, path: &str, body: Option<&str>) -> Reply {
    let node = if path.trim_matches('/').is_empty() {
        None
    } else {
        match state.openstack.resolve_path(path) {
            Some(node) => Some(node),
            None => return Reply::fail(StatusCode::NOT_FOUND, MSG_NOT_FOUND),
        }
    };

    let result = match (node, body) {
        (None, None) => Ok(json!(state.openstack.names())),
        (Some(Node::Branch(tree)), None) => Ok(json!(tree.names())),
        (Some(Node::Leaf(resource)), None) => resource.get(&state.store),
        (Some(Node::Leaf(resource)), Some(body)) => resource.post(&state.store, body),
        (_, Some(_)) => Err(ResourceError::MethodNotAllowed),
    };

    match result {
        Ok(content) => Reply::ok(content),
        Err(ResourceError::NotFound) => Reply::fail(StatusCode::NOT_FOUND, MSG_NOT_FOUND),
        Err(ResourceError::MethodNotAllowed) => {
            Reply::fail(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed.")
        }
        Err(ResourceError::Store(err)) => Reply::store_error("metadata read", err),
    }
}

async fn openstack_get(
    state: web::Data<AppState>,
    tail: Option<web::Path<String>>,
) -> impl Responder {
    let state = state.into_inner();
    let path = tail.map(|t| t.into_inner()).unwrap_or_default();
    run_blocking(move || openstack_reply(&state, &path, None)).await
}

async fn openstack_post(
    state: web::Data<AppState>,
    tail: web::Path<String>,
    body: String,
) -> impl Responder {
    let state = state.into_inner();
    let path = tail.into_inner();
    run_blocking(move || openstack_reply(&state, &path, Some(&body))).await
}

// ==============================
// Admin resource endpoint (gated)
// ==============================

fn list_reply(state: &AppState, mut params: RequestParams) -> Reply {
    if let Err(rejected) = gate(state, &mut params) {
        return rejected;
    }
    let namespace = namespace_of(&params);
    match state.store.list_resources(&namespace) {
        Ok(records) => Reply::ok(Value::Array(records.iter().map(record_json).collect())),
        Err(err) => Reply::store_error("list resources", err),
    }
}

fn get_reply(state: &AppState, resource_id: &str, mut params: RequestParams) -> Reply {
    if let Err(rejected) = gate(state, &mut params) {
        return rejected;
    }
    let namespace = namespace_of(&params);
    match state.store.get_resource(&namespace, resource_id) {
        Ok(Some(record)) => Reply::ok(record_json(&record)),
        Ok(None) => Reply::fail(StatusCode::NOT_FOUND, MSG_NOT_FOUND),
        Err(err) => Reply::store_error("get resource", err),
    }
}

fn create_reply(state: &AppState, mut params: RequestParams) -> Reply {
    if let Err(rejected) = gate(state, &mut params) {
        return rejected;
    }
    let name = match params.get_str("resource").filter(|s| !s.is_empty()) {
        Some(name) => name.to_string(),
        None => return Reply::fail(StatusCode::BAD_REQUEST, "Missing resource name."),
    };
    let record = ResourceRecord {
        resource: name,
        data: params.get("data").cloned().unwrap_or(Value::Null),
        client_id: params.get_str("client_id").map(str::to_string),
        namespace: namespace_of(&params),
    };
    match state.store.put_resource(&record) {
        Ok(()) => {
            info!(
                namespace = %record.namespace,
                resource = %record.resource,
                "resource stored"
            );
            Reply::with_code(StatusCode::CREATED, record_json(&record))
        }
        Err(err) => Reply::store_error("create resource", err),
    }
}

fn update_reply(state: &AppState, resource_id: &str, mut params: RequestParams) -> Reply {
    if let Err(rejected) = gate(state, &mut params) {
        return rejected;
    }
    let namespace = namespace_of(&params);
    let mut record = match state.store.get_resource(&namespace, resource_id) {
        Ok(Some(record)) => record,
        Ok(None) => return Reply::fail(StatusCode::NOT_FOUND, MSG_NOT_FOUND),
        Err(err) => return Reply::store_error("update resource", err),
    };
    if let Some(data) = params.get("data") {
        record.data = data.clone();
    }
    if let Some(client_id) = params.get_str("client_id") {
        record.client_id = Some(client_id.to_string());
    }
    match state.store.put_resource(&record) {
        Ok(()) => Reply::ok(record_json(&record)),
        Err(err) => Reply::store_error("update resource", err),
    }
}

fn delete_reply(state: &AppState, resource_id: &str, mut params: RequestParams) -> Reply {
    if let Err(rejected) = gate(state, &mut params) {
        return rejected;
    }
    let namespace = namespace_of(&params);
    match state.store.delete_resource(&namespace, resource_id) {
        Ok(true) => Reply::ok(Value::Null),
        Ok(false) => Reply::fail(StatusCode::NOT_FOUND, MSG_NOT_FOUND),
        Err(err) => Reply::store_error("delete resource", err),
    }
}

async fn admin_list(
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
) -> impl Responder {
    let state: Arc<AppState> = state.into_inner();
    let params = collect_params(query.into_inner(), HashMap::new());
    run_blocking(move || list_reply(&state, params)).await
}

async fn admin_get(
    state: web::Data<AppState>,
    resource_id: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> impl Responder {
    let state = state.into_inner();
    let resource_id = resource_id.into_inner();
    let params = collect_params(query.into_inner(), HashMap::new());
    run_blocking(move || get_reply(&state, &resource_id, params)).await
}

async fn admin_create(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<HashMap<String, String>>,
    form: FormBody,
) -> impl Responder {
    let form = match form_fields(&req, form) {
        Ok(form) => form,
        Err(reply) => return reply.into_response(),
    };
    let state = state.into_inner();
    let params = collect_params(query.into_inner(), form);
    run_blocking(move || create_reply(&state, params)).await
}

async fn admin_update(
    req: HttpRequest,
    state: web::Data<AppState>,
    resource_id: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
    form: FormBody,
) -> impl Responder {
    let form = match form_fields(&req, form) {
        Ok(form) => form,
        Err(reply) => return reply.into_response(),
    };
    let state = state.into_inner();
    let resource_id = resource_id.into_inner();
    let params = collect_params(query.into_inner(), form);
    run_blocking(move || update_reply(&state, &resource_id, params)).await
}

async fn admin_delete(
    state: web::Data<AppState>,
    resource_id: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> impl Responder {
    let state = state.into_inner();
    let resource_id = resource_id.into_inner();
    let params = collect_params(query.into_inner(), HashMap::new());
    run_blocking(move || delete_reply(&state, &resource_id, params)).await
}
