use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::TokenStore;
use crate::error::AppError;
use crate::gateway::{OrderGateway, PageRequest};
use crate::models::account::{AuthTokens, LoginRequest, UserProfile};
use crate::models::order::{
    OrderDetail, OrderId, OrderListKind, OrderListView, OrderStatus, OrderSummary, PaymentStatus,
    UserId,
};

const FALLBACK_ERROR: &str = "unknown error";

#[derive(Deserialize)]
struct OrdersListBody {
    #[serde(default)]
    orders: Option<Vec<OrderSummary>>,
}

#[derive(Serialize)]
struct ClaimBody {
    order_id: OrderId,
}

#[derive(Serialize)]
struct UpdateOrderBody<'a> {
    order_id: OrderId,
    payment_status: &'a str,
    order_status: &'a str,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

/// `OrderGateway` over the backend's JSON HTTP API, plus the account
/// endpoints the courier session needs.
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    tokens: TokenStore,
}

impl HttpGateway {
    pub fn new(base_url: Url, tokens: TokenStore, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthTokens, AppError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };

        let response = self
            .client
            .post(self.endpoint("login")?)
            .json(&request)
            .send()
            .await?;

        let tokens: AuthTokens = read_json(response)
            .await?
            .ok_or_else(|| AppError::Server("empty login response".to_string()))?;

        self.tokens.set(tokens.clone());
        debug!("login succeeded");
        Ok(tokens)
    }

    pub fn logout(&self) {
        self.tokens.clear();
    }

    pub async fn fetch_profile(&self) -> Result<UserProfile, AppError> {
        let response = self.execute(self.client.get(self.endpoint("profile")?)).await?;
        read_json(response)
            .await?
            .ok_or_else(|| AppError::NotFound("profile is empty".to_string()))
    }

    /// Customer lookup for the order detail screen.
    pub async fn fetch_user(&self, user_id: UserId) -> Result<UserProfile, AppError> {
        let url = self.endpoint(&format!("users/{user_id}"))?;
        let response = self.execute(self.client.get(url)).await?;
        read_json(response)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id} not found")))
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<AuthTokens, AppError> {
        let response = self
            .client
            .post(self.endpoint("refresh-access-token")?)
            .json(&RefreshBody { refresh_token })
            .send()
            .await?;

        let tokens: AuthTokens = read_json(response)
            .await?
            .ok_or_else(|| AppError::Unauthorized("empty refresh response".to_string()))?;

        self.tokens.set(tokens.clone());
        Ok(tokens)
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|err| AppError::Internal(format!("invalid endpoint {path}: {err}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.tokens.access_token() {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Sends with the current bearer token. A 401 triggers one token refresh
    /// and one replay of the request.
    async fn execute(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let replay = request.try_clone();
        let response = self.authorize(request).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let (Some(replay), Some(refresh_token)) = (replay, self.tokens.refresh_token()) else {
            return Ok(response);
        };

        match self.refresh_access_token(&refresh_token).await {
            Ok(_) => {
                debug!("access token refreshed; replaying request");
                Ok(self.authorize(replay).send().await?)
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed; clearing session");
                self.tokens.clear();
                Err(AppError::Unauthorized(format!("session expired: {err}")))
            }
        }
    }

    async fn fetch_list(
        &self,
        kind: OrderListKind,
        path: &str,
        page: PageRequest,
    ) -> Result<OrderListView, AppError> {
        let request = self
            .client
            .get(self.endpoint(path)?)
            .query(&[("page", page.page), ("limit", page.limit)]);

        let response = self.execute(request).await?;
        let body: Option<OrdersListBody> = read_json(response).await?;
        let orders = body.and_then(|body| body.orders).unwrap_or_default();

        debug!(view = kind.label(), count = orders.len(), "order list fetched");
        Ok(OrderListView { kind, orders })
    }
}

#[async_trait]
impl OrderGateway for HttpGateway {
    async fn list_available(&self, page: PageRequest) -> Result<OrderListView, AppError> {
        self.fetch_list(OrderListKind::Available, "shipper/orders", page)
            .await
    }

    async fn list_mine(&self, page: PageRequest) -> Result<OrderListView, AppError> {
        self.fetch_list(OrderListKind::Mine, "shipper/orders/received-orders", page)
            .await
    }

    async fn fetch_detail(&self, order_id: OrderId) -> Result<OrderDetail, AppError> {
        let url = self.endpoint(&format!("orders/{order_id}"))?;
        let response = self.execute(self.client.get(url)).await?;

        read_json(response)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} details not found")))
    }

    async fn claim(&self, order_id: OrderId) -> Result<(), AppError> {
        debug!(order_id, "claiming order");
        let request = self
            .client
            .post(self.endpoint("shipper/receive-order")?)
            .json(&ClaimBody { order_id });

        let response = self.execute(request).await?;
        let status = response.status();
        expect_success(response)
            .await
            .map_err(|err| claim_error(status, err))
    }

    async fn update_status(
        &self,
        order_id: OrderId,
        payment_status: PaymentStatus,
        order_status: OrderStatus,
    ) -> Result<(), AppError> {
        debug!(
            order_id,
            payment = %payment_status,
            status = %order_status,
            "updating order"
        );
        let request = self
            .client
            .post(self.endpoint("shipper/update-order")?)
            .json(&UpdateOrderBody {
                order_id,
                payment_status: payment_status.as_str(),
                order_status: order_status.as_str(),
            });

        let response = self.execute(request).await?;
        expect_success(response).await
    }
}

/// Decodes a 2xx body. `Ok(None)` means the body was empty or `null`.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<Option<T>, AppError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(error_for_status(status, &body));
    }

    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }

    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| AppError::Server(format!("unreadable response body: {err}")))
}

async fn expect_success(response: Response) -> Result<(), AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &body))
}

fn error_for_status(status: StatusCode, body: &str) -> AppError {
    let message = error_message(body);
    match status {
        StatusCode::NOT_FOUND => AppError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Unauthorized(message),
        _ => AppError::Server(message),
    }
}

fn claim_error(status: StatusCode, err: AppError) -> AppError {
    match err {
        AppError::Server(message) if status == StatusCode::CONFLICT || mentions_claimed(&message) => {
            AppError::AlreadyClaimed(message)
        }
        other => other,
    }
}

fn mentions_claimed(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("already") && (lower.contains("claim") || lower.contains("receiv"))
}

/// Human-readable text from an error body: `error` or `message` fields of a
/// JSON object, else the raw text, else a generic fallback.
pub(crate) fn error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return FALLBACK_ERROR.to_string();
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        for key in ["error", "message"] {
            if let Some(Value::String(text)) = map.get(key) {
                if !text.trim().is_empty() {
                    return text.clone();
                }
            }
        }
    }

    trimmed.to_string()
}
