mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use common::{test_config, with_peer, TestContext, ADMIN_KEY};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn admin_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-admin-api-key", ADMIN_KEY);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    };
    with_peer(request.unwrap())
}

fn login_request(role_id: &str, secret_id: &str) -> Request<Body> {
    with_peer(
        Request::builder()
            .method(Method::POST)
            .uri("/v1/auth/approle/login")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "role_id": role_id, "secret_id": secret_id }).to_string(),
            ))
            .unwrap(),
    )
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn create_role(app: &Router, body: Value) -> Value {
    let (status, created) = call(
        app,
        admin_request(Method::POST, "/v1/auth/approle/roles", Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    created
}

#[tokio::test]
async fn admin_routes_require_api_key() {
    let app = TestContext::new().router();

    let missing = with_peer(
        Request::builder()
            .uri("/v1/auth/approle/roles")
            .body(Body::empty())
            .unwrap(),
    );
    let (status, _) = call(&app, missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = with_peer(
        Request::builder()
            .uri("/v1/auth/approle/roles")
            .header("x-admin-api-key", "guess")
            .body(Body::empty())
            .unwrap(),
    );
    let (status, body) = call(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn role_lifecycle_over_http() {
    let app = TestContext::new().router();

    let created = create_role(
        &app,
        json!({
            "role_name": "payments-agent",
            "secret_id_num_uses": 0,
            "bound_cidr_list": ["10.0.0.0/8"],
            "policies": ["payments-read"]
        }),
    )
    .await;
    let role_id = created["role_id"].as_str().unwrap().to_string();
    let first_secret = created["secret_id"].as_str().unwrap().to_string();
    assert_eq!(created["role_name"], "payments-agent");

    let (status, listed) = call(
        &app,
        admin_request(Method::GET, "/v1/auth/approle/roles", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let roles = listed["roles"].as_array().unwrap();
    assert_eq!(roles.len(), 1);
    assert!(roles[0].get("secret_id").is_none());
    assert!(roles[0].get("secret_id_hash").is_none());
    assert!(!listed.to_string().contains(&first_secret));

    let uri = format!("/v1/auth/approle/roles/{}", role_id);
    let (status, fetched) = call(&app, admin_request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["policies"], json!(["payments-read"]));
    assert_eq!(fetched["bound_cidr_list"], json!(["10.0.0.0/8"]));

    let (status, rotated) = call(
        &app,
        admin_request(Method::POST, &format!("{}/secret-id", uri), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rotated["role_id"], role_id.as_str());
    assert_ne!(rotated["secret_id"], first_secret.as_str());

    let (status, _) = call(&app, admin_request(Method::DELETE, &uri, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, admin_request(Method::GET, &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, admin_request(Method::DELETE, &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_role_ids_are_not_found() {
    let app = TestContext::new().router();

    let (status, _) = call(
        &app,
        admin_request(Method::GET, "/v1/auth/approle/roles/not-a-uuid", None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_role_validates_input() {
    let app = TestContext::new().router();

    for body in [
        json!({ "role_name": "" }),
        json!({ "role_name": "agent", "secret_id_num_uses": -1 }),
        json!({ "role_name": "agent", "secret_id_ttl": -5 }),
        json!({ "role_name": "agent", "bound_cidr_list": ["10.0.0.0/33"] }),
    ] {
        let (status, response) = call(
            &app,
            admin_request(Method::POST, "/v1/auth/approle/roles", Some(body.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        assert!(response["error"].is_string());
    }
}

#[tokio::test]
async fn http_login_issues_token_once() {
    let ctx = TestContext::new();
    let app = ctx.router();

    let created = create_role(
        &app,
        json!({ "role_name": "ci-runner", "policies": ["deploy"] }),
    )
    .await;
    let role_id = created["role_id"].as_str().unwrap();
    let secret_id = created["secret_id"].as_str().unwrap();

    let (status, login) = call(&app, login_request(role_id, secret_id)).await;
    assert_eq!(status, StatusCode::OK, "{login}");
    assert_eq!(login["role_name"], "ci-runner");
    assert_eq!(login["policies"], json!(["deploy"]));
    let claims = ctx
        .approle
        .tokens()
        .verify(login["token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.sub, role_id);

    // Default secret_id allows a single use.
    let (status, replay) = call(&app, login_request(role_id, secret_id)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, unknown) = call(
        &app,
        login_request(&uuid::Uuid::new_v4().to_string(), secret_id),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay, unknown);
}

#[tokio::test]
async fn http_login_honours_bound_cidr() {
    let app = TestContext::new().router();

    let created = create_role(
        &app,
        json!({ "role_name": "office-agent", "bound_cidr_list": ["192.168.0.0/16"] }),
    )
    .await;

    let (status, _) = call(
        &app,
        login_request(
            created["role_id"].as_str().unwrap(),
            created["secret_id"].as_str().unwrap(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_are_rate_limited() {
    let mut config = test_config();
    config.rate_limit.admin_limit = 2;
    let app = TestContext::with_config(config).router();

    for _ in 0..2 {
        let (status, _) = call(
            &app,
            admin_request(Method::GET, "/v1/auth/approle/roles", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = call(
        &app,
        admin_request(Method::GET, "/v1/auth/approle/roles", None),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn socket_rejects_non_lobby_topics_before_upgrade() {
    let app = TestContext::new().router();

    let request = with_peer(
        Request::builder()
            .uri("/v1/agent/socket/agent:1234")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap(),
    );
    let (status, _) = call(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Lobby is joinable, but a plain GET is not an upgrade.
    let plain = with_peer(
        Request::builder()
            .uri("/v1/agent/socket/agent:lobby")
            .body(Body::empty())
            .unwrap(),
    );
    let response = app.clone().oneshot(plain).await.unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn health_and_openapi() {
    let app = TestContext::new().router();

    let (status, health) = call(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["checks"]["role_store"], "up");

    let (status, openapi) = call(
        &app,
        Request::builder()
            .uri("/.well-known/openapi.json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(openapi["paths"]["/v1/auth/approle/login"].is_object());
    assert!(openapi["paths"]["/v1/agent/socket/{topic}"].is_object());
    assert!(openapi["components"]["securitySchemes"]["admin_api_key"].is_object());
}

#[tokio::test]
async fn responses_carry_request_id_and_security_headers() {
    let app = TestContext::new().router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-me-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()["x-request-id"], "trace-me-42");
    assert!(response.headers().contains_key("x-content-type-options"));
}
