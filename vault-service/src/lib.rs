pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod session;
pub mod utils;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::middleware::{
    rate_limit::{ip_rate_limit_middleware, IpRateLimit},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::VaultConfig;
use crate::services::{AppRoleService, Collaborators};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::approle::create_role,
        handlers::approle::list_roles,
        handlers::approle::get_role,
        handlers::approle::rotate_secret_id,
        handlers::approle::delete_role,
        handlers::approle::login,
        session::socket::agent_socket,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::approle::CreateRoleRequest,
            dtos::approle::CreateRoleResponse,
            dtos::approle::RotateSecretResponse,
            dtos::approle::RoleListResponse,
            dtos::approle::LoginRequest,
            dtos::approle::LoginResponse,
            models::RoleMetadata,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "AppRole Admin", description = "AppRole provisioning and secret rotation"),
        (name = "AppRole", description = "Machine login"),
        (name = "Agent Session", description = "Persistent agent websocket"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(
                    middleware::admin::ADMIN_API_KEY_HEADER,
                ))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: VaultConfig,
    pub approle: AppRoleService,
    pub collaborators: Collaborators,
    pub admin_rate_limit: IpRateLimit,
    pub socket_rate_limit: IpRateLimit,
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/v1/auth/approle/roles",
            post(handlers::approle::create_role).get(handlers::approle::list_roles),
        )
        .route(
            "/v1/auth/approle/roles/:role_id",
            get(handlers::approle::get_role).delete(handlers::approle::delete_role),
        )
        .route(
            "/v1/auth/approle/roles/:role_id/secret-id",
            post(handlers::approle::rotate_secret_id),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ))
        .layer(from_fn_with_state(
            state.admin_rate_limit.clone(),
            ip_rate_limit_middleware,
        ));

    let login_route = Router::new()
        .route("/v1/auth/approle/login", post(handlers::approle::login))
        .layer(from_fn_with_state(
            state.admin_rate_limit.clone(),
            ip_rate_limit_middleware,
        ));

    let socket_route = Router::new()
        .route(
            "/v1/agent/socket/:topic",
            get(session::socket::agent_socket),
        )
        .layer(from_fn_with_state(
            state.socket_rate_limit.clone(),
            ip_rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(admin_routes)
        .merge(login_route)
        .merge(socket_route)
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config.security.allowed_origins))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    // tower-http refuses a literal "*" inside an origin list.
    let origins = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed_origins.iter().filter_map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e))
                .ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::admin::ADMIN_API_KEY_HEADER),
            HeaderName::from_static("x-request-id"),
        ])
}
