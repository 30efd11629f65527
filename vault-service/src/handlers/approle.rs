use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::resolve_client_ip;
use service_core::observability::extract_request_id;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::{
    dtos::approle::{
        CreateRoleRequest, CreateRoleResponse, LoginRequest, LoginResponse, RoleListResponse,
        RotateSecretResponse,
    },
    models::{AuditContext, RoleMetadata},
    services::ServiceError,
    utils::ValidatedJson,
    AppState,
};

// Unparsable ids cannot name an existing role.
fn parse_role_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| ServiceError::RoleNotFound.into())
}

/// Create an AppRole and its first secret_id
#[utoipa::path(
    post,
    path = "/v1/auth/approle/roles",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = CreateRoleResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "AppRole Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn create_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> Result<(StatusCode, Json<CreateRoleResponse>), AppError> {
    let (role_name, options) = req.into_parts();
    let created = state
        .approle
        .create_role(role_name, options, &AuditContext::admin(extract_request_id(&headers)))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRoleResponse {
            role_id: created.role_id,
            secret_id: created.secret_id,
            role_name: created.role_name,
        }),
    ))
}

/// List AppRoles
#[utoipa::path(
    get,
    path = "/v1/auth/approle/roles",
    responses(
        (status = 200, description = "Role metadata, secrets omitted", body = RoleListResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "AppRole Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn list_roles(State(state): State<AppState>) -> Result<Json<RoleListResponse>, AppError> {
    let roles = state.approle.list_roles().await?;
    Ok(Json(RoleListResponse { roles }))
}

/// Fetch one AppRole
#[utoipa::path(
    get,
    path = "/v1/auth/approle/roles/{role_id}",
    params(
        ("role_id" = String, Path, description = "Role ID")
    ),
    responses(
        (status = 200, description = "Role metadata", body = RoleMetadata),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "AppRole Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn get_role(
    State(state): State<AppState>,
    Path(role_id): Path<String>,
) -> Result<Json<RoleMetadata>, AppError> {
    let role = state.approle.get_role(parse_role_id(&role_id)?).await?;
    Ok(Json(role))
}

/// Issue a new secret_id, invalidating the previous one
#[utoipa::path(
    post,
    path = "/v1/auth/approle/roles/{role_id}/secret-id",
    params(
        ("role_id" = String, Path, description = "Role ID to rotate")
    ),
    responses(
        (status = 200, description = "Secret rotated", body = RotateSecretResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "AppRole Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn rotate_secret_id(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(role_id): Path<String>,
) -> Result<Json<RotateSecretResponse>, AppError> {
    let role_id = parse_role_id(&role_id)?;
    let secret_id = state
        .approle
        .rotate_secret_id(role_id, &AuditContext::admin(extract_request_id(&headers)))
        .await?;
    Ok(Json(RotateSecretResponse { role_id, secret_id }))
}

/// Delete an AppRole
#[utoipa::path(
    delete,
    path = "/v1/auth/approle/roles/{role_id}",
    params(
        ("role_id" = String, Path, description = "Role ID to delete")
    ),
    responses(
        (status = 204, description = "Role deleted"),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "AppRole Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn delete_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(role_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .approle
        .delete_role(
            parse_role_id(&role_id)?,
            &AuditContext::admin(extract_request_id(&headers)),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Exchange role_id and secret_id for a token
#[utoipa::path(
    post,
    path = "/v1/auth/approle/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "AppRole"
)]
pub async fn login(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let source_ip = resolve_client_ip(&headers, peer, state.config.security.trust_forwarded_for)
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Unable to determine client address")))?;

    let result = state
        .approle
        .login(
            &req.role_id,
            &req.secret_id,
            source_ip,
            &AuditContext::approle(extract_request_id(&headers)),
        )
        .await?;

    Ok(Json(LoginResponse {
        token: result.token,
        policies: result.policies,
        role_name: result.role_name,
        role_id: result.role_id,
        expires_at: result.expires_at,
    }))
}
