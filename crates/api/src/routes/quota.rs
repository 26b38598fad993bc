//! Quota routes

use axum::{
    extract::{Path, State},
    Json,
};
use quotabot_billing::{Consumption, Quota};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub user_id: String,
    pub month: String,
    pub used: u32,
    pub quota: Quota,
    pub is_premium: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub premium_expires_at: Option<OffsetDateTime>,
}

/// Remaining quota for the current month. Creates the account on first contact.
pub async fn get_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<QuotaResponse>> {
    let accounts = &state.accounts;
    let quota = accounts.remaining_quota(&user_id).await?;

    let user = accounts
        .get_user(&user_id)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("user {} missing after quota lookup", user_id)))?;
    let month = accounts.current_month();
    let used = accounts
        .monthly_usage_count(&user_id, Some(month.as_str()))
        .await?;

    Ok(Json(QuotaResponse {
        is_premium: user.has_active_premium(accounts.now()),
        premium_expires_at: user.premium_expires_at,
        user_id,
        month,
        used,
        quota,
    }))
}

/// Atomically check the quota and record one usage
pub async fn consume(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Consumption>> {
    match state.accounts.try_consume(&user_id).await? {
        Consumption::Denied => Err(ApiError::QuotaExceeded),
        consumed => Ok(Json(consumed)),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::routes::create_router;
    use crate::test_helpers::{test_state, without_billing};

    async fn call(app: axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_fresh_user_has_full_quota() {
        let (state, _, _) = test_state().await;
        let app = create_router(state);

        let (status, body) = call(app, "GET", "/quota/U1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], "U1");
        assert_eq!(body["month"], "2025-01");
        assert_eq!(body["used"], 0);
        assert_eq!(body["quota"]["kind"], "limited");
        assert_eq!(body["quota"]["remaining"], 3);
        assert_eq!(body["is_premium"], false);
    }

    #[tokio::test]
    async fn test_consume_until_denied() {
        let (state, _, _) = test_state().await;
        let app = create_router(state);

        for expected in [2, 1, 0] {
            let (status, body) = call(app.clone(), "POST", "/quota/U1/consume").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["outcome"], "consumed");
            assert_eq!(body["remaining"], expected);
        }

        let (status, body) = call(app.clone(), "POST", "/quota/U1/consume").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["error"].is_string());

        let (_, body) = call(app, "GET", "/quota/U1").await;
        assert_eq!(body["used"], 3);
    }

    #[tokio::test]
    async fn test_quota_works_without_billing() {
        let state = without_billing().await;
        let app = create_router(state);

        let (status, body) = call(app, "POST", "/quota/U1/consume").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 2);
    }

    #[tokio::test]
    async fn test_premium_user_is_unlimited() {
        let (state, _, _) = test_state().await;
        state
            .accounts
            .set_premium("U1", time::macros::datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();
        let app = create_router(state);

        let (_, body) = call(app.clone(), "GET", "/quota/U1").await;
        assert_eq!(body["quota"]["kind"], "unlimited");
        assert_eq!(body["is_premium"], true);

        let (status, body) = call(app, "POST", "/quota/U1/consume").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "unlimited");
    }
}
