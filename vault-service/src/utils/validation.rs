use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use validator::Validate;

/// JSON request body that has passed its `validator` rules.
///
/// Malformed JSON is a 400; a body that parses but breaks a rule is a 422
/// carrying the field errors.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(malformed_body)?;

        value.validate().map_err(|errors| {
            let fields: Vec<_> = errors.field_errors().into_keys().collect();
            tracing::debug!(fields = ?fields, "Request body failed validation");
            AppError::ValidationError(errors)
        })?;

        Ok(ValidatedJson(value))
    }
}

fn malformed_body(rejection: JsonRejection) -> AppError {
    tracing::debug!(status = %rejection.status(), "Rejected request body");
    AppError::BadRequest(anyhow::anyhow!(
        "Malformed JSON body: {}",
        rejection.body_text()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Validate)]
    struct Named {
        #[validate(length(min = 1))]
        name: String,
    }

    fn request(body: &str) -> Request {
        axum::http::Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn status_of(body: &str) -> StatusCode {
        match ValidatedJson::<Named>::from_request(request(body), &()).await {
            Ok(_) => StatusCode::OK,
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn maps_parse_and_rule_failures_to_distinct_statuses() {
        assert_eq!(status_of(r#"{"name":"agent"}"#).await, StatusCode::OK);
        assert_eq!(status_of(r#"{"name":"#).await, StatusCode::BAD_REQUEST);
        assert_eq!(status_of(r#"{"name":""}"#).await, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
