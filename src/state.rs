use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::TokenStore;
use crate::config::Config;
use crate::engine::coordinator::DeliverySessionCoordinator;
use crate::engine::sync::{OrderSyncController, SyncEvent};
use crate::error::AppError;
use crate::gateway::{HttpGateway, PageRequest};
use crate::models::account::AuthTokens;
use crate::notify::{LogNotifier, Notifier};
use crate::observability::metrics::Metrics;

/// Everything one signed-in courier session needs, built once and shared by
/// reference. There is no process-wide state outside this value.
pub struct AppState {
    pub tokens: TokenStore,
    pub gateway: Arc<HttpGateway>,
    pub sync: Arc<OrderSyncController>,
    pub coordinator: Arc<DeliverySessionCoordinator>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> Result<(Self, broadcast::Receiver<SyncEvent>), AppError> {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        config: &Config,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, broadcast::Receiver<SyncEvent>), AppError> {
        let tokens = match &config.access_token {
            Some(access_token) => TokenStore::with_tokens(AuthTokens {
                access_token: access_token.clone(),
                refresh_token: config.refresh_token.clone().unwrap_or_default(),
            }),
            None => TokenStore::new(),
        };
        let metrics = Metrics::new();

        let gateway = Arc::new(HttpGateway::new(
            config.api_base_url.clone(),
            tokens.clone(),
            config.request_timeout(),
        )?);

        let sync = OrderSyncController::new(
            gateway.clone(),
            notifier,
            metrics.clone(),
            config.event_buffer_size,
        )
        .with_settle_policy(config.settle_policy())
        .with_page(PageRequest::first(config.page_size));
        let sync_events = sync.subscribe();

        let coordinator = DeliverySessionCoordinator::new(
            tokens.clone(),
            config.chat_ws_url.clone(),
            config.request_timeout(),
            metrics.clone(),
        );

        Ok((
            Self {
                tokens,
                gateway,
                sync: Arc::new(sync),
                coordinator: Arc::new(coordinator),
                metrics,
            },
            sync_events,
        ))
    }
}
