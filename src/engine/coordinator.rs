use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::TokenStore;
use crate::chat::ChatSession;
use crate::engine::sync::{OrderSyncController, SyncEvent};
use crate::models::chat::{ChatMessage, ChatState};
use crate::models::order::{OrderId, OrderStatus, UserId};
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BindOutcome {
    Opened,
    AlreadyBound,
    /// No token yet; the binding is retried when one arrives.
    Deferred,
    /// Handshake failed; chat stays off until the next binding.
    Unavailable,
}

enum Registration {
    Pending(Arc<ChatSession>, String),
    Existing,
    Deferred,
}

struct Binding {
    customer_id: Option<UserId>,
    session: Arc<ChatSession>,
}

/// Sole owner of chat sessions. A session exists only while its order is
/// shipping and is closed as soon as the order leaves that state.
pub struct DeliverySessionCoordinator {
    tokens: TokenStore,
    chat_url: Url,
    connect_timeout: Duration,
    metrics: Metrics,
    bindings: DashMap<OrderId, Binding>,
    parked: DashMap<OrderId, Option<UserId>>,
}

impl DeliverySessionCoordinator {
    pub fn new(tokens: TokenStore, chat_url: Url, connect_timeout: Duration, metrics: Metrics) -> Self {
        Self {
            tokens,
            chat_url,
            connect_timeout,
            metrics,
            bindings: DashMap::new(),
            parked: DashMap::new(),
        }
    }

    /// Binds a chat session to `order_id` and waits for the handshake.
    pub async fn bind(&self, order_id: OrderId, customer_id: Option<UserId>) -> BindOutcome {
        match self.register(order_id, customer_id) {
            Registration::Pending(session, token) => open_session(session, token).await,
            Registration::Existing => BindOutcome::AlreadyBound,
            Registration::Deferred => BindOutcome::Deferred,
        }
    }

    /// Drops the binding for `order_id` and closes its session.
    pub fn release(&self, order_id: OrderId) -> bool {
        self.parked.remove(&order_id);

        match self.bindings.remove(&order_id) {
            Some((_, binding)) => {
                binding.session.close();
                info!(order_id, "delivery chat released");
                true
            }
            None => false,
        }
    }

    /// Reacts to one controller event. Never waits on the network: handshakes
    /// run on their own tasks so a delivered order is released right away.
    pub fn apply(&self, event: SyncEvent) {
        match event {
            SyncEvent::Claimed {
                order_id,
                customer_id,
            } => self.bind_detached(order_id, customer_id),
            SyncEvent::StatusChanged {
                order_id,
                status: OrderStatus::Shipping,
            } => self.bind_detached(order_id, None),
            SyncEvent::StatusChanged { order_id, status } => {
                if self.release(order_id) {
                    debug!(order_id, status = %status, "order left shipping");
                }
            }
            SyncEvent::ListRefreshed { .. } => {}
        }
    }

    /// Sends to the order's customer. False without a live binding or a
    /// known customer.
    pub fn send(&self, order_id: OrderId, content: &str) -> bool {
        let Some(binding) = self.bindings.get(&order_id) else {
            return false;
        };
        let Some(customer_id) = binding.customer_id else {
            warn!(order_id, "no customer known for chat; message not sent");
            return false;
        };
        binding.session.send(customer_id, content)
    }

    pub fn session(&self, order_id: OrderId) -> Option<Arc<ChatSession>> {
        self.bindings
            .get(&order_id)
            .map(|binding| Arc::clone(&binding.session))
    }

    pub fn transcript(&self, order_id: OrderId) -> Option<Vec<ChatMessage>> {
        self.bindings
            .get(&order_id)
            .map(|binding| binding.session.transcript())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_parked(&self, order_id: OrderId) -> bool {
        self.parked.contains_key(&order_id)
    }

    /// Releases every binding or parked request whose order is known to have
    /// left shipping. Returns how many live bindings were released.
    pub fn reconcile(&self, status_of: impl Fn(OrderId) -> Option<OrderStatus>) -> usize {
        let orders: Vec<OrderId> = self
            .bindings
            .iter()
            .map(|entry| *entry.key())
            .chain(self.parked.iter().map(|entry| *entry.key()))
            .collect();

        let mut released = 0;
        for order_id in orders {
            match status_of(order_id) {
                None | Some(OrderStatus::Shipping) => {}
                Some(status) => {
                    debug!(order_id, status = %status, "binding outlived its order");
                    if self.release(order_id) {
                        released += 1;
                    }
                }
            }
        }
        released
    }

    /// Retries every binding that was waiting for a token.
    pub fn resume_parked(&self) {
        let parked: Vec<(OrderId, Option<UserId>)> = self
            .parked
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        for (order_id, customer_id) in parked {
            self.parked.remove(&order_id);
            self.bind_detached(order_id, customer_id);
        }
    }

    fn bind_detached(&self, order_id: OrderId, customer_id: Option<UserId>) {
        if let Registration::Pending(session, token) = self.register(order_id, customer_id) {
            tokio::spawn(open_session(session, token));
        }
    }

    fn register(&self, order_id: OrderId, customer_id: Option<UserId>) -> Registration {
        let Some(token) = self.tokens.access_token() else {
            self.parked.insert(order_id, customer_id);
            info!(order_id, "no access token; chat binding deferred");
            return Registration::Deferred;
        };

        let session = match self.bindings.entry(order_id) {
            Entry::Occupied(mut entry) => {
                let binding = entry.get_mut();
                if binding.customer_id.is_none() {
                    binding.customer_id = customer_id;
                }
                if binding.session.state() != ChatState::Closed {
                    return Registration::Existing;
                }

                let session = self.new_session(order_id);
                binding.session = Arc::clone(&session);
                session
            }
            Entry::Vacant(entry) => {
                let session = self.new_session(order_id);
                entry.insert(Binding {
                    customer_id,
                    session: Arc::clone(&session),
                });
                session
            }
        };

        self.parked.remove(&order_id);
        Registration::Pending(session, token)
    }

    fn new_session(&self, order_id: OrderId) -> Arc<ChatSession> {
        Arc::new(ChatSession::new(
            order_id,
            self.chat_url.clone(),
            self.connect_timeout,
            self.metrics.clone(),
        ))
    }
}

async fn open_session(session: Arc<ChatSession>, token: String) -> BindOutcome {
    match session.open(&token).await {
        Ok(()) => BindOutcome::Opened,
        Err(err) => {
            info!(order_id = session.order_id(), error = %err, "chat unavailable for order");
            BindOutcome::Unavailable
        }
    }
}

/// Event loop binding chat sessions to controller events. Parked bindings
/// are retried whenever the token store changes. After missed events every
/// binding is checked against the controller's current statuses.
pub async fn run_delivery_coordinator(
    coordinator: Arc<DeliverySessionCoordinator>,
    sync: Arc<OrderSyncController>,
    mut events: broadcast::Receiver<SyncEvent>,
) {
    info!("delivery session coordinator started");
    let mut tokens = coordinator.tokens.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => coordinator.apply(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "delivery coordinator lagged behind sync events");
                    let released = coordinator.reconcile(|order_id| sync.status_of(order_id));
                    if released > 0 {
                        info!(released, "released chat sessions missed during lag");
                    }
                }
                Err(RecvError::Closed) => break,
            },
            changed = tokens.changed() => {
                if changed.is_err() {
                    break;
                }
                let has_token = tokens.borrow_and_update().is_some();
                if has_token {
                    coordinator.resume_parked();
                }
            }
        }
    }

    warn!("delivery session coordinator stopped: event channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::settle::SettlePolicy;
    use crate::engine::sync::tests::{FakeGateway, RecordingNotifier};
    use crate::models::account::AuthTokens;

    fn controller(gateway: Arc<FakeGateway>, event_buffer_size: usize) -> Arc<OrderSyncController> {
        Arc::new(
            OrderSyncController::new(
                gateway,
                Arc::new(RecordingNotifier::default()),
                Metrics::new(),
                event_buffer_size,
            )
            .with_settle_policy(SettlePolicy::immediate()),
        )
    }

    fn drain(events: &mut broadcast::Receiver<SyncEvent>, coordinator: &DeliverySessionCoordinator) {
        while let Ok(event) = events.try_recv() {
            coordinator.apply(event);
        }
    }

    fn coordinator(tokens: TokenStore) -> DeliverySessionCoordinator {
        DeliverySessionCoordinator::new(
            tokens,
            Url::parse("ws://127.0.0.1:9/ws").unwrap(),
            Duration::from_millis(200),
            Metrics::new(),
        )
    }

    fn signed_in() -> TokenStore {
        TokenStore::with_tokens(AuthTokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
        })
    }

    #[tokio::test]
    async fn binding_waits_for_a_token() {
        let tokens = TokenStore::new();
        let coordinator = coordinator(tokens.clone());

        assert_eq!(coordinator.bind(3, Some(42)).await, BindOutcome::Deferred);
        assert!(coordinator.is_parked(3));
        assert_eq!(coordinator.binding_count(), 0);

        tokens.set(AuthTokens {
            access_token: "access".to_string(),
            refresh_token: String::new(),
        });
        coordinator.resume_parked();

        assert!(!coordinator.is_parked(3));
        assert_eq!(coordinator.binding_count(), 1);
    }

    #[tokio::test]
    async fn repeated_claims_share_one_binding() {
        let coordinator = coordinator(signed_in());
        let claimed = SyncEvent::Claimed {
            order_id: 3,
            customer_id: Some(42),
        };

        coordinator.apply(claimed.clone());
        let first = coordinator.session(3).unwrap();
        coordinator.apply(claimed);
        let second = coordinator.session(3).unwrap();

        assert_eq!(coordinator.binding_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn delivered_status_releases_the_session() {
        let coordinator = coordinator(signed_in());
        coordinator.apply(SyncEvent::Claimed {
            order_id: 3,
            customer_id: Some(42),
        });
        let session = coordinator.session(3).unwrap();

        coordinator.apply(SyncEvent::StatusChanged {
            order_id: 3,
            status: OrderStatus::Delivered,
        });

        assert_eq!(session.state(), ChatState::Closed);
        assert!(coordinator.session(3).is_none());
        assert!(!coordinator.send(3, "still there?"));
        assert!(!session.send(42, "still there?"));
    }

    #[tokio::test]
    async fn failed_handshake_is_not_fatal() {
        let coordinator = coordinator(signed_in());

        assert_eq!(coordinator.bind(3, Some(42)).await, BindOutcome::Unavailable);
        assert_eq!(
            coordinator.session(3).map(|session| session.state()),
            Some(ChatState::Closed)
        );

        // a closed binding is replaced on the next attempt
        assert_eq!(coordinator.bind(3, None).await, BindOutcome::Unavailable);
        assert_eq!(coordinator.binding_count(), 1);
    }

    #[test]
    fn send_without_binding_is_a_no_op() {
        let coordinator = coordinator(signed_in());
        assert!(!coordinator.send(3, "hello"));
        assert!(coordinator.transcript(3).is_none());
    }

    #[tokio::test]
    async fn delivery_seen_on_refresh_releases_the_session() {
        let gateway = Arc::new(FakeGateway::with_orders(&[5]));
        let sync = controller(gateway.clone(), 64);
        let coordinator = coordinator(signed_in());
        let mut events = sync.subscribe();

        sync.claim(5, Some(42)).await.unwrap();
        drain(&mut events, &coordinator);
        let session = coordinator.session(5).unwrap();

        gateway.set_status(5, OrderStatus::Delivered);
        sync.load_detail(5).await.unwrap();
        sync.refresh_mine().await.unwrap();
        drain(&mut events, &coordinator);

        assert_eq!(session.state(), ChatState::Closed);
        assert!(coordinator.session(5).is_none());
        assert_eq!(coordinator.binding_count(), 0);
    }

    #[tokio::test]
    async fn delivery_missed_during_lag_still_releases_the_session() {
        let gateway = Arc::new(FakeGateway::with_orders(&[5]));
        let sync = controller(gateway, 1);
        let coordinator = Arc::new(coordinator(signed_in()));

        sync.claim(5, Some(42)).await.unwrap();
        coordinator.apply(SyncEvent::Claimed {
            order_id: 5,
            customer_id: Some(42),
        });
        let events = sync.subscribe();
        // the status change is pushed out of the one-slot buffer by the
        // list refresh that follows it
        sync.mark_delivered(5).await.unwrap();

        tokio::spawn(run_delivery_coordinator(coordinator.clone(), sync, events));
        for _ in 0..100 {
            if coordinator.binding_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.binding_count(), 0);
    }

    #[test]
    fn reconcile_keeps_shipping_and_unknown_orders() {
        let tokens = TokenStore::new();
        let coordinator = coordinator(tokens);
        for order_id in [1, 2, 3] {
            coordinator.parked.insert(order_id, None);
        }

        let released = coordinator.reconcile(|order_id| match order_id {
            1 => Some(OrderStatus::Shipping),
            2 => Some(OrderStatus::Delivered),
            _ => None,
        });

        assert_eq!(released, 0);
        assert!(coordinator.is_parked(1));
        assert!(!coordinator.is_parked(2));
        assert!(coordinator.is_parked(3));
    }
}
