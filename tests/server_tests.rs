use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use serde_json::{json, Value};
use std::sync::Arc;

use arestor::cipher::AesCipher;
use arestor::server::config_routes;
use arestor::store::{MemoryConnector, SecretStore, DEFAULT_RETRIES};
use arestor::util::AppState;

const KEY: &str = "ak-test";
const SECRET: &str = "sk-test";

fn seeded() -> (Arc<SecretStore>, MemoryConnector) {
    let memory = MemoryConnector::new();
    let store = Arc::new(SecretStore::new(memory.clone(), DEFAULT_RETRIES));
    store.set_secret(KEY, SECRET).expect("seed secret");
    (store, memory)
}

fn seal(secret: &str, value: Value) -> String {
    AesCipher::new(secret).encrypt(value.to_string().as_bytes())
}

// Base64 only needs these three escaped in a query string.
fn query_escape(raw: &str) -> String {
    raw.replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}

macro_rules! app {
    ($store:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new($store.clone())))
                .configure(config_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn unknown_api_key_gets_generic_400_envelope() {
    let (store, _) = seeded();
    let app = app!(store);

    let req = test::TestRequest::get()
        .uri("/admin/resource?api_key=nobody")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(
        body,
        json!({
            "meta": {"status": false, "verbose": "Invalid api key provided."},
            "content": null
        })
    );
}

#[actix_web::test]
async fn content_sealed_with_wrong_secret_is_rejected() {
    let (store, _) = seeded();
    let app = app!(store);

    let content = seal("not-the-secret", json!({"resource": "hostname", "data": "x"}));
    let req = test::TestRequest::post()
        .uri("/admin/resource")
        .set_form(vec![("api_key", KEY.to_string()), ("content", content)])
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["meta"]["verbose"], "Invalid request.");
    assert_eq!(store.get_resource("openstack", "hostname").unwrap(), None);
}

#[actix_web::test]
async fn created_resources_show_up_in_metadata() {
    let (store, _) = seeded();
    let app = app!(store);

    for (name, data) in [("hostname", json!("vm-01")), ("uuid", json!("1234-abcd"))] {
        let content = seal(SECRET, json!({"resource": name, "data": data, "client_id": "vm"}));
        let req = test::TestRequest::post()
            .uri("/admin/resource")
            .set_form(vec![("api_key", KEY.to_string()), ("content", content)])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["meta"]["status"], true);
        assert_eq!(body["content"]["resource"], name);
    }

    let req = test::TestRequest::get()
        .uri("/openstack/latest/meta_data.json")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["content"]["hostname"], "vm-01");
    assert_eq!(body["content"]["uuid"], "1234-abcd");
    assert_eq!(body["content"]["project_id"], "");

    let listed = test::TestRequest::get()
        .uri(&format!("/admin/resource?api_key={}", KEY))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, listed).await;
    let names: Vec<&str> = body["content"]
        .as_array()
        .expect("array content")
        .iter()
        .filter_map(|r| r["resource"].as_str())
        .collect();
    assert_eq!(names, vec!["hostname", "uuid"]);
}

#[actix_web::test]
async fn encrypted_query_content_selects_namespace() {
    let (store, _) = seeded();
    let app = app!(store);

    let content = seal(SECRET, json!({"resource": "hostname", "data": "edge", "namespace": "ec2"}));
    let req = test::TestRequest::post()
        .uri("/admin/resource")
        .set_form(vec![("api_key", KEY.to_string()), ("content", content)])
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

    let content = query_escape(&seal(SECRET, json!({"namespace": "ec2"})));
    let req = test::TestRequest::get()
        .uri(&format!("/admin/resource/hostname?api_key={}&content={}", KEY, content))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["content"]["data"], "edge");

    // The default namespace does not see it.
    let req = test::TestRequest::get()
        .uri(&format!("/admin/resource/hostname?api_key={}", KEY))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn update_and_delete_round_trip() {
    let (store, _) = seeded();
    let app = app!(store);

    let missing = test::TestRequest::put()
        .uri("/admin/resource/user_data")
        .set_form(vec![("api_key", KEY), ("data", "#cloud-config")])
        .to_request();
    assert_eq!(test::call_service(&app, missing).await.status(), StatusCode::NOT_FOUND);

    let content = seal(SECRET, json!({"resource": "user_data", "data": "#!/bin/sh"}));
    let create = test::TestRequest::post()
        .uri("/admin/resource")
        .set_form(vec![("api_key", KEY.to_string()), ("content", content)])
        .to_request();
    assert_eq!(test::call_service(&app, create).await.status(), StatusCode::CREATED);

    let update = test::TestRequest::put()
        .uri("/admin/resource/user_data")
        .set_form(vec![("api_key", KEY), ("data", "#cloud-config")])
        .to_request();
    assert_eq!(test::call_service(&app, update).await.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri("/openstack/latest/user-data")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["content"], "#cloud-config");

    let delete = || {
        test::TestRequest::delete()
            .uri(&format!("/admin/resource/user_data?api_key={}", KEY))
            .to_request()
    };
    assert_eq!(test::call_service(&app, delete()).await.status(), StatusCode::OK);
    assert_eq!(test::call_service(&app, delete()).await.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn password_resource_accepts_posted_body() {
    let (store, _) = seeded();
    let app = app!(store);

    let req = test::TestRequest::post()
        .uri("/openstack/2013-04-04/password")
        .set_payload("c2VhbGVkLXBhc3N3b3Jk")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri("/openstack/2013-04-04/password")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["content"], "c2VhbGVkLXBhc3N3b3Jk");

    let req = test::TestRequest::post()
        .uri("/openstack/latest/meta_data.json")
        .set_payload("nope")
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );
}

#[actix_web::test]
async fn store_outage_rejects_admin_and_fails_metadata_reads() {
    let (store, memory) = seeded();
    let app = app!(store);
    memory.set_reachable(false);

    let req = test::TestRequest::get()
        .uri(&format!("/admin/resource?api_key={}", KEY))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri("/openstack/latest/user_data")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let req = test::TestRequest::get().uri("/status").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["store"]["reachable"], false);
}

#[actix_web::test]
async fn sealed_body_larger_than_default_form_limit_is_accepted() {
    let (store, _) = seeded();
    let app = app!(store);

    let script = "#!/bin/sh\n".repeat(1500);
    let content = seal(SECRET, json!({"resource": "user_data", "data": script}));
    assert!(content.len() > 16 * 1024);
    let req = test::TestRequest::post()
        .uri("/admin/resource")
        .set_form(vec![("api_key", KEY.to_string()), ("content", content)])
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let stored = store
        .get_resource("openstack", "user_data")
        .unwrap()
        .expect("user_data stored");
    assert_eq!(stored.data, json!(script));
}

#[actix_web::test]
async fn oversized_or_mistyped_body_is_refused_not_misread() {
    let (store, _) = seeded();
    let app = app!(store);

    let huge = "a".repeat(arestor::server::FORM_LIMIT + 1);
    let req = test::TestRequest::post()
        .uri(&format!("/admin/resource?api_key={}", KEY))
        .set_form(vec![("resource", "user_data".to_string()), ("data", huge)])
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["meta"]["verbose"], "Invalid request body.");

    let req = test::TestRequest::put()
        .uri(&format!("/admin/resource/user_data?api_key={}", KEY))
        .insert_header(("content-type", "application/json"))
        .set_payload(r#"{"data": "x"}"#)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.get_resource("openstack", "user_data").unwrap(), None);
}

#[actix_web::test]
async fn write_with_query_only_parameters_still_works() {
    let (store, _) = seeded();
    let app = app!(store);

    let req = test::TestRequest::post()
        .uri(&format!("/admin/resource?api_key={}&resource=hostname&data=q", KEY))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);
    let stored = store.get_resource("openstack", "hostname").unwrap().expect("stored");
    assert_eq!(stored.data, json!("q"));
}
