use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

/// Caller identity from the `X-User-Id` header. Authentication itself is an
/// upstream concern; the core only requires the identity to be present.
pub struct UserId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or((
                StatusCode::BAD_REQUEST,
                "Missing X-User-Id header".to_string(),
            ))?;
        Ok(UserId(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn user_id_parsed_from_header() {
        let request = Request::builder()
            .header("X-User-Id", "user-42")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let user = UserId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.0, "user-42");
    }

    #[tokio::test]
    async fn missing_header_is_a_bad_request() {
        let request = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let err = UserId::from_request_parts(&mut parts, &())
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
