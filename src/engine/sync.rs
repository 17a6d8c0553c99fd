use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::settle::{pause, SettlePolicy};
use crate::error::AppError;
use crate::gateway::{OrderGateway, PageRequest};
use crate::models::order::{
    OrderDetail, OrderId, OrderListKind, OrderListView, OrderStatus, OrderSummary, PaymentStatus,
    UserId,
};
use crate::notify::Notifier;
use crate::observability::metrics::Metrics;

/// Last-known view of server state. Possibly stale.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum Snapshot<T> {
    Loading,
    Ready(T),
    Failed(String),
}

impl<T> Snapshot<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            Snapshot::Ready(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Claimed {
        order_id: OrderId,
        customer_id: Option<UserId>,
    },
    StatusChanged {
        order_id: OrderId,
        status: OrderStatus,
    },
    ListRefreshed {
        kind: OrderListKind,
        count: usize,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub order_id: OrderId,
    pub first_claim: bool,
    /// The my-orders list came back empty after the settle delay and was
    /// fetched a second time.
    pub retried: bool,
}

/// Single writer of the order snapshots. Every claim and status update goes
/// through here so the three views stay plausible without a transactional
/// read from the backend.
pub struct OrderSyncController {
    gateway: Arc<dyn OrderGateway>,
    notifier: Arc<dyn Notifier>,
    metrics: Metrics,
    policy: SettlePolicy,
    page: PageRequest,
    available: watch::Sender<Snapshot<OrderListView>>,
    mine: watch::Sender<Snapshot<OrderListView>>,
    detail: watch::Sender<Snapshot<OrderDetail>>,
    /// Last successfully fetched view of each list.
    listed: DashMap<OrderListKind, OrderListView>,
    confirmed: DashMap<OrderId, OrderStatus>,
    order_locks: DashMap<OrderId, Arc<Mutex<()>>>,
    claimed_once: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl OrderSyncController {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        event_buffer_size: usize,
    ) -> Self {
        let (available, _available_rx) = watch::channel(Snapshot::Loading);
        let (mine, _mine_rx) = watch::channel(Snapshot::Loading);
        let (detail, _detail_rx) = watch::channel(Snapshot::Loading);
        let (events, _events_rx) = broadcast::channel(event_buffer_size.max(1));

        Self {
            gateway,
            notifier,
            metrics,
            policy: SettlePolicy::default(),
            page: PageRequest::default(),
            available,
            mine,
            detail,
            listed: DashMap::new(),
            confirmed: DashMap::new(),
            order_locks: DashMap::new(),
            claimed_once: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_settle_policy(mut self, policy: SettlePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn available(&self) -> Snapshot<OrderListView> {
        self.available.borrow().clone()
    }

    pub fn mine(&self) -> Snapshot<OrderListView> {
        self.mine.borrow().clone()
    }

    pub fn detail(&self) -> Snapshot<OrderDetail> {
        self.detail.borrow().clone()
    }

    pub fn subscribe_available(&self) -> watch::Receiver<Snapshot<OrderListView>> {
        self.available.subscribe()
    }

    pub fn subscribe_mine(&self) -> watch::Receiver<Snapshot<OrderListView>> {
        self.mine.subscribe()
    }

    pub fn subscribe_detail(&self) -> watch::Receiver<Snapshot<OrderDetail>> {
        self.detail.subscribe()
    }

    /// Best local guess: the confirmed overlay (statuses this client applied,
    /// advanced by later backend reads), then the detail view, then the last
    /// fetched lists.
    pub fn status_of(&self, order_id: OrderId) -> Option<OrderStatus> {
        if let Some(status) = self.confirmed.get(&order_id) {
            return Some(status.value().clone());
        }

        let from_detail = self
            .detail
            .borrow()
            .ready()
            .filter(|detail| detail.order.id == order_id)
            .map(|detail| detail.order.status.clone());
        if from_detail.is_some() {
            return from_detail;
        }

        self.listed_row(order_id).map(|summary| summary.status)
    }

    pub async fn refresh_available(&self) -> Result<OrderListView, AppError> {
        self.refresh_list(OrderListKind::Available).await
    }

    pub async fn refresh_mine(&self) -> Result<OrderListView, AppError> {
        self.refresh_list(OrderListKind::Mine).await
    }

    /// Refreshes both lists concurrently; reports the first failure.
    pub async fn refresh_all(&self) -> Result<(), AppError> {
        self.available.send_replace(Snapshot::Loading);
        self.mine.send_replace(Snapshot::Loading);
        let (available, mine) = tokio::join!(
            self.fetch_list(OrderListKind::Available),
            self.fetch_list(OrderListKind::Mine)
        );
        self.publish_lists(&[
            (OrderListKind::Available, &available),
            (OrderListKind::Mine, &mine),
        ]);
        available?;
        mine?;
        Ok(())
    }

    /// Loads one order's detail. When the backend has no detail but a list
    /// row for the order was seen, publishes a synthesized record instead.
    pub async fn load_detail(&self, order_id: OrderId) -> Result<OrderDetail, AppError> {
        let previous = self.status_of(order_id);
        self.detail.send_replace(Snapshot::Loading);

        match self.gateway.fetch_detail(order_id).await {
            Ok(detail) => {
                debug!(order_id, items = detail.items.len(), "order detail loaded");
                let known = self.status_of(order_id).or(previous);
                let change = self.adopt_server_status(order_id, known, &detail.order.status);
                self.detail.send_replace(Snapshot::Ready(detail.clone()));
                if let Some(event) = change {
                    let _ = self.events.send(event);
                }
                Ok(detail)
            }
            Err(AppError::NotFound(message)) => {
                match self.listed_row(order_id) {
                    Some(summary) => {
                        warn!(order_id, "order detail missing; synthesized from list row");
                        let detail = OrderDetail::synthesize(&summary);
                        self.detail.send_replace(Snapshot::Ready(detail.clone()));
                        Ok(detail)
                    }
                    None => {
                        self.detail.send_replace(Snapshot::Failed(message.clone()));
                        Err(AppError::NotFound(message))
                    }
                }
            }
            Err(err) => {
                warn!(order_id, error = %err, "failed to load order detail");
                self.detail.send_replace(Snapshot::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Claims `order_id`, waits for the backend to settle and refreshes both
    /// lists. Local state only changes once the backend confirms the claim.
    pub async fn claim(
        &self,
        order_id: OrderId,
        customer_id: Option<UserId>,
    ) -> Result<ClaimOutcome, AppError> {
        self.serialized(order_id, self.claim_locked(order_id, customer_id))
            .await
    }

    /// Requests a status change. Moving an order backwards from its locally
    /// known status is refused without a network call.
    pub async fn update_status(
        &self,
        order_id: OrderId,
        payment_status: PaymentStatus,
        status: OrderStatus,
    ) -> Result<(), AppError> {
        self.serialized(order_id, self.update_status_locked(order_id, payment_status, status))
            .await
    }

    async fn claim_locked(
        &self,
        order_id: OrderId,
        customer_id: Option<UserId>,
    ) -> Result<ClaimOutcome, AppError> {
        let started = Instant::now();

        info!(order_id, "claiming order");
        if let Err(err) = self.gateway.claim(order_id).await {
            let outcome = match &err {
                AppError::AlreadyClaimed(_) => "already_claimed",
                _ => "error",
            };
            self.metrics.claims_total.with_label_values(&[outcome]).inc();
            self.observe("claim", started);
            warn!(order_id, error = %err, "claim rejected");
            return Err(err);
        }

        self.metrics.claims_total.with_label_values(&["success"]).inc();
        self.confirmed.insert(order_id, OrderStatus::Shipping);
        self.patch_detail(order_id, OrderStatus::Shipping, None);
        self.notifier.order_claimed(order_id);
        let _ = self.events.send(SyncEvent::Claimed {
            order_id,
            customer_id,
        });

        let first_claim = !self.claimed_once.swap(true, Ordering::SeqCst);
        pause(self.policy.settle_delay(first_claim)).await;

        let mut retried = false;
        if let Ok(view) = self.refresh_mine().await {
            if view.is_empty() {
                retried = true;
                self.metrics.settle_retries_total.inc();
                debug!(order_id, "my orders still empty after claim; fetching once more");
                pause(self.policy.empty_retry).await;
                let _ = self.refresh_mine().await;
            }
        }

        let _ = self.refresh_available().await;
        self.observe("claim", started);

        info!(order_id, first_claim, retried, "order claimed");
        Ok(ClaimOutcome {
            order_id,
            first_claim,
            retried,
        })
    }

    async fn update_status_locked(
        &self,
        order_id: OrderId,
        payment_status: PaymentStatus,
        status: OrderStatus,
    ) -> Result<(), AppError> {
        if let Some(current) = self.status_of(order_id) {
            if !current.can_advance_to(&status) {
                self.metrics
                    .status_updates_total
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(AppError::InvalidTransition {
                    from: current,
                    to: status,
                });
            }
        }

        let started = Instant::now();
        if let Err(err) = self
            .gateway
            .update_status(order_id, payment_status.clone(), status.clone())
            .await
        {
            self.metrics
                .status_updates_total
                .with_label_values(&["error"])
                .inc();
            self.observe("update_status", started);
            warn!(order_id, error = %err, "status update failed");
            return Err(err);
        }

        self.metrics
            .status_updates_total
            .with_label_values(&["success"])
            .inc();
        self.confirmed.insert(order_id, status.clone());
        self.patch_detail(order_id, status.clone(), Some(payment_status));
        info!(order_id, status = %status, "order status updated");

        let _ = self.events.send(SyncEvent::StatusChanged {
            order_id,
            status: status.clone(),
        });
        if status == OrderStatus::Delivered {
            self.notifier.order_delivered(order_id);
        }

        let _ = self.refresh_mine().await;
        self.observe("update_status", started);
        Ok(())
    }

    pub async fn mark_delivered(&self, order_id: OrderId) -> Result<(), AppError> {
        self.update_status(order_id, PaymentStatus::Paid, OrderStatus::Delivered)
            .await
    }

    /// Runs the claim on its own task so it completes even if the caller
    /// stops waiting.
    pub fn spawn_claim(
        self: &Arc<Self>,
        order_id: OrderId,
        customer_id: Option<UserId>,
    ) -> JoinHandle<Result<ClaimOutcome, AppError>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.claim(order_id, customer_id).await })
    }

    pub fn spawn_mark_delivered(self: &Arc<Self>, order_id: OrderId) -> JoinHandle<Result<(), AppError>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.mark_delivered(order_id).await })
    }

    async fn refresh_list(&self, kind: OrderListKind) -> Result<OrderListView, AppError> {
        self.slot(kind).send_replace(Snapshot::Loading);
        let result = self.fetch_list(kind).await;
        self.publish_lists(&[(kind, &result)]);
        result
    }

    fn slot(&self, kind: OrderListKind) -> &watch::Sender<Snapshot<OrderListView>> {
        match kind {
            OrderListKind::Available => &self.available,
            OrderListKind::Mine => &self.mine,
        }
    }

    async fn fetch_list(&self, kind: OrderListKind) -> Result<OrderListView, AppError> {
        match kind {
            OrderListKind::Available => self.gateway.list_available(self.page).await,
            OrderListKind::Mine => self.gateway.list_mine(self.page).await,
        }
    }

    /// Publishes fetched lists. Status changes are judged against what was
    /// known before any of them landed, so an order moving from one list to
    /// the other is still recognised.
    fn publish_lists(&self, results: &[(OrderListKind, &Result<OrderListView, AppError>)]) {
        let changes: Vec<SyncEvent> = results
            .iter()
            .filter_map(|(_, result)| result.as_ref().ok())
            .flat_map(|view| view.orders.iter())
            .filter_map(|row| self.adopt_server_status(row.id, self.status_of(row.id), &row.status))
            .collect();

        for (kind, result) in results {
            let kind = *kind;
            match result {
                Ok(view) => {
                    self.listed.insert(kind, view.clone());
                    self.metrics
                        .list_refreshes_total
                        .with_label_values(&[kind.label(), "success"])
                        .inc();
                    self.slot(kind).send_replace(Snapshot::Ready(view.clone()));
                    let _ = self.events.send(SyncEvent::ListRefreshed {
                        kind,
                        count: view.orders.len(),
                    });
                }
                Err(err) => {
                    self.metrics
                        .list_refreshes_total
                        .with_label_values(&[kind.label(), "error"])
                        .inc();
                    warn!(view = kind.label(), error = %err, "order list refresh failed");
                    self.slot(kind).send_replace(Snapshot::Failed(err.to_string()));
                }
            }
        }

        for event in changes {
            let _ = self.events.send(event);
        }
    }

    /// Last applied wins on the detail view; the next fetch replaces it.
    fn patch_detail(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) {
        self.detail.send_if_modified(|snapshot| match snapshot {
            Snapshot::Ready(detail) if detail.order.id == order_id => {
                detail.order.status = status;
                if let Some(payment_status) = payment_status {
                    detail.order.payment_status = payment_status;
                }
                true
            }
            _ => false,
        });
    }

    /// Folds a status read from the backend into local knowledge and returns
    /// the change to announce. Reads behind the known status are stale: the
    /// backend never moves an order backwards.
    fn adopt_server_status(
        &self,
        order_id: OrderId,
        known: Option<OrderStatus>,
        server: &OrderStatus,
    ) -> Option<SyncEvent> {
        let known = known?;
        if known == *server {
            return None;
        }
        if !known.can_advance_to(server) {
            debug!(order_id, known = %known, read = %server, "stale status read ignored");
            return None;
        }

        if let Some(mut confirmed) = self.confirmed.get_mut(&order_id) {
            *confirmed = server.clone();
        }
        info!(order_id, from = %known, to = %server, "backend reports a status change");
        Some(SyncEvent::StatusChanged {
            order_id,
            status: server.clone(),
        })
    }

    /// Row for `order_id` in the last fetched lists, mine first.
    fn listed_row(&self, order_id: OrderId) -> Option<OrderSummary> {
        [OrderListKind::Mine, OrderListKind::Available]
            .iter()
            .find_map(|kind| {
                self.listed
                    .get(kind)
                    .and_then(|view| view.find(order_id).cloned())
            })
    }

    /// Runs `operation` holding the order's mutation lock. The lock entry is
    /// dropped again once nobody else is waiting on it.
    async fn serialized<T>(&self, order_id: OrderId, operation: impl Future<Output = T>) -> T {
        let lock = self
            .order_locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let output = {
            let _guard = lock.lock().await;
            operation.await
        };

        drop(lock);
        self.order_locks
            .remove_if(&order_id, |_, lock| Arc::strong_count(lock) == 1);
        output
    }

    fn observe(&self, operation: &str, started: Instant) {
        self.metrics
            .mutation_latency_seconds
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct Backend {
        orders: Vec<OrderSummary>,
        details: HashMap<OrderId, OrderDetail>,
        empty_mine_after_claim: usize,
        pending_empty_mine: usize,
        reject_claims: bool,
        mine_calls: usize,
        update_calls: usize,
    }

    /// In-memory backend: processing orders are available, shipping ones
    /// belong to the courier.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        backend: StdMutex<Backend>,
    }

    impl FakeGateway {
        pub(crate) fn with_orders(ids: &[OrderId]) -> Self {
            let gateway = FakeGateway::default();
            gateway.backend.lock().unwrap().orders = ids
                .iter()
                .map(|id| OrderSummary {
                    id: *id,
                    status: OrderStatus::Processing,
                    total_amount: 50000.0,
                    thumbnail: None,
                })
                .collect();
            gateway
        }

        fn mine_lag(self, lag: usize) -> Self {
            self.backend.lock().unwrap().empty_mine_after_claim = lag;
            self
        }

        /// Changes an order server-side, as another client would.
        pub(crate) fn set_status(&self, order_id: OrderId, status: OrderStatus) {
            let mut backend = self.backend.lock().unwrap();
            let mut detail = None;
            if let Some(order) = backend.orders.iter_mut().find(|order| order.id == order_id) {
                order.status = status.clone();
                detail = Some(OrderDetail {
                    synthesized: false,
                    ..OrderDetail::synthesize(order)
                });
            }
            if let Some(detail) = detail {
                backend.details.insert(order_id, detail);
            }
        }

        pub(crate) fn remove(&self, order_id: OrderId) {
            let mut backend = self.backend.lock().unwrap();
            backend.orders.retain(|order| order.id != order_id);
            backend.details.remove(&order_id);
        }

        fn mine_calls(&self) -> usize {
            self.backend.lock().unwrap().mine_calls
        }

        fn update_calls(&self) -> usize {
            self.backend.lock().unwrap().update_calls
        }

        fn list(&self, status: OrderStatus) -> Vec<OrderSummary> {
            self.backend
                .lock()
                .unwrap()
                .orders
                .iter()
                .filter(|order| order.status == status)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl OrderGateway for FakeGateway {
        async fn list_available(&self, _page: PageRequest) -> Result<OrderListView, AppError> {
            Ok(OrderListView {
                kind: OrderListKind::Available,
                orders: self.list(OrderStatus::Processing),
            })
        }

        async fn list_mine(&self, _page: PageRequest) -> Result<OrderListView, AppError> {
            {
                let mut backend = self.backend.lock().unwrap();
                backend.mine_calls += 1;
                if backend.pending_empty_mine > 0 {
                    backend.pending_empty_mine -= 1;
                    return Ok(OrderListView::empty(OrderListKind::Mine));
                }
            }
            Ok(OrderListView {
                kind: OrderListKind::Mine,
                orders: self.list(OrderStatus::Shipping),
            })
        }

        async fn fetch_detail(&self, order_id: OrderId) -> Result<OrderDetail, AppError> {
            self.backend
                .lock()
                .unwrap()
                .details
                .get(&order_id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("order {order_id} details not found")))
        }

        async fn claim(&self, order_id: OrderId) -> Result<(), AppError> {
            let mut backend = self.backend.lock().unwrap();
            if backend.reject_claims {
                return Err(AppError::Server("claims are paused".to_string()));
            }
            let lag = backend.empty_mine_after_claim;
            let order = backend
                .orders
                .iter_mut()
                .find(|order| order.id == order_id)
                .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;
            if order.status != OrderStatus::Processing {
                return Err(AppError::AlreadyClaimed(format!("order {order_id} is taken")));
            }
            order.status = OrderStatus::Shipping;
            backend.pending_empty_mine = lag;
            Ok(())
        }

        async fn update_status(
            &self,
            order_id: OrderId,
            _payment_status: PaymentStatus,
            order_status: OrderStatus,
        ) -> Result<(), AppError> {
            if order_status == OrderStatus::Shipping {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let mut backend = self.backend.lock().unwrap();
            backend.update_calls += 1;
            if let Some(order) = backend.orders.iter_mut().find(|order| order.id == order_id) {
                order.status = order_status;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) seen: StdMutex<Vec<(&'static str, OrderId)>>,
    }

    impl Notifier for RecordingNotifier {
        fn order_claimed(&self, order_id: OrderId) {
            self.seen.lock().unwrap().push(("claimed", order_id));
        }

        fn order_delivered(&self, order_id: OrderId) {
            self.seen.lock().unwrap().push(("delivered", order_id));
        }
    }

    fn controller(
        gateway: Arc<FakeGateway>,
    ) -> (OrderSyncController, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = OrderSyncController::new(gateway, notifier.clone(), Metrics::new(), 64)
            .with_settle_policy(SettlePolicy::immediate());
        (controller, notifier)
    }

    fn ids(snapshot: Snapshot<OrderListView>) -> Vec<OrderId> {
        snapshot.ready().map(OrderListView::ids).unwrap_or_default()
    }

    #[tokio::test]
    async fn claim_moves_order_between_lists_after_settling() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1, 2, 3]).mine_lag(1));
        let (controller, notifier) = controller(gateway.clone());
        let mut events = controller.subscribe();

        controller.refresh_all().await.unwrap();
        assert_eq!(ids(controller.available()), vec![1, 2, 3]);
        let calls_before = gateway.mine_calls();

        let outcome = controller.claim(2, Some(42)).await.unwrap();
        assert!(outcome.first_claim);
        assert!(outcome.retried);
        assert_eq!(gateway.mine_calls() - calls_before, 2);

        let mine = controller.mine();
        let mine = mine.ready().unwrap();
        assert_eq!(mine.ids(), vec![2]);
        assert_eq!(mine.orders[0].status, OrderStatus::Shipping);
        assert_eq!(ids(controller.available()), vec![1, 3]);
        assert_eq!(controller.status_of(2), Some(OrderStatus::Shipping));
        assert_eq!(*notifier.seen.lock().unwrap(), vec![("claimed", 2)]);

        let mut claimed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::Claimed { order_id, customer_id } = event {
                claimed.push((order_id, customer_id));
            }
        }
        assert_eq!(claimed, vec![(2, Some(42))]);
    }

    #[tokio::test]
    async fn empty_my_orders_is_retried_exactly_once() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1]).mine_lag(5));
        let (controller, _notifier) = controller(gateway.clone());

        let outcome = controller.claim(1, None).await.unwrap();
        assert!(outcome.retried);
        assert_eq!(gateway.mine_calls(), 2);
        assert!(controller.mine().ready().unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_first_claim_counts_as_first() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1, 2]));
        let (controller, _notifier) = controller(gateway);

        assert!(controller.claim(1, None).await.unwrap().first_claim);
        let second = controller.claim(2, None).await.unwrap();
        assert!(!second.first_claim);
        assert!(!second.retried);
    }

    #[tokio::test]
    async fn rejected_claim_leaves_local_state_alone() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1]));
        let (controller, notifier) = controller(gateway.clone());
        controller.refresh_all().await.unwrap();
        let mut events = controller.subscribe();

        gateway.backend.lock().unwrap().reject_claims = true;
        let err = controller.claim(1, None).await.unwrap_err();

        assert!(matches!(err, AppError::Server(_)));
        assert_eq!(controller.status_of(1), Some(OrderStatus::Processing));
        assert_eq!(ids(controller.available()), vec![1]);
        assert!(notifier.seen.lock().unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn claiming_a_taken_order_reports_already_claimed() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1]));
        let (controller, _notifier) = controller(gateway);

        controller.claim(1, None).await.unwrap();
        let err = controller.claim(1, None).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyClaimed(_)));
    }

    #[tokio::test]
    async fn missing_detail_is_synthesized_from_list_row() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.backend.lock().unwrap().orders.push(OrderSummary {
            id: 99,
            status: OrderStatus::Processing,
            total_amount: 150000.0,
            thumbnail: None,
        });
        let (controller, _notifier) = controller(gateway);
        controller.refresh_available().await.unwrap();

        let detail = controller.load_detail(99).await.unwrap();
        assert!(detail.synthesized);
        assert_eq!(detail.order.id, 99);
        assert_eq!(detail.order.status, OrderStatus::Processing);
        assert_eq!(detail.order.total_amount, 150000.0);
        assert!(detail.items.is_empty());
        assert_eq!(controller.detail(), Snapshot::Ready(detail));
    }

    #[tokio::test]
    async fn unknown_detail_surfaces_not_found() {
        let (controller, _notifier) = controller(Arc::new(FakeGateway::default()));

        let err = controller.load_detail(404).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(matches!(controller.detail(), Snapshot::Failed(_)));
    }

    #[tokio::test]
    async fn concurrent_updates_settle_on_the_last_applied() {
        let gateway = Arc::new(FakeGateway::with_orders(&[5]));
        let (controller, _notifier) = controller(gateway);
        controller.refresh_all().await.unwrap();

        let (shipping, delivered) = tokio::join!(
            controller.update_status(5, PaymentStatus::Unpaid, OrderStatus::Shipping),
            controller.update_status(5, PaymentStatus::Paid, OrderStatus::Delivered),
        );

        shipping.unwrap();
        delivered.unwrap();
        assert_eq!(controller.status_of(5), Some(OrderStatus::Delivered));
    }

    #[tokio::test]
    async fn delivered_orders_cannot_move_back() {
        let gateway = Arc::new(FakeGateway::with_orders(&[5]));
        let (controller, notifier) = controller(gateway.clone());

        controller.claim(5, None).await.unwrap();
        controller.mark_delivered(5).await.unwrap();
        assert_eq!(gateway.update_calls(), 1);

        let err = controller
            .update_status(5, PaymentStatus::Paid, OrderStatus::Shipping)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Shipping
            }
        ));
        assert_eq!(gateway.update_calls(), 1);
        assert_eq!(
            *notifier.seen.lock().unwrap(),
            vec![("claimed", 5), ("delivered", 5)]
        );
    }

    #[tokio::test]
    async fn delivered_update_patches_the_detail_view() {
        let gateway = Arc::new(FakeGateway::with_orders(&[9]));
        let (controller, _notifier) = controller(gateway);
        controller.refresh_available().await.unwrap();
        controller.load_detail(9).await.unwrap();

        controller.claim(9, None).await.unwrap();
        controller.mark_delivered(9).await.unwrap();

        let detail = controller.detail();
        let detail = detail.ready().unwrap();
        assert_eq!(detail.order.status, OrderStatus::Delivered);
        assert_eq!(detail.order.payment_status, PaymentStatus::Paid);
    }

    fn status_changes(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<(OrderId, OrderStatus)> {
        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::StatusChanged { order_id, status } = event {
                changes.push((order_id, status));
            }
        }
        changes
    }

    #[tokio::test]
    async fn delivery_seen_in_a_fetched_detail_is_announced() {
        let gateway = Arc::new(FakeGateway::with_orders(&[5]));
        let (controller, _notifier) = controller(gateway.clone());
        controller.claim(5, Some(42)).await.unwrap();
        let mut events = controller.subscribe();

        gateway.set_status(5, OrderStatus::Delivered);
        let detail = controller.load_detail(5).await.unwrap();
        assert_eq!(detail.order.status, OrderStatus::Delivered);

        assert_eq!(controller.status_of(5), Some(OrderStatus::Delivered));
        assert_eq!(status_changes(&mut events), vec![(5, OrderStatus::Delivered)]);

        controller.refresh_mine().await.unwrap();
        assert!(status_changes(&mut events).is_empty());
    }

    #[tokio::test]
    async fn stale_reads_never_move_an_order_back() {
        let gateway = Arc::new(FakeGateway::with_orders(&[5]));
        let (controller, _notifier) = controller(gateway.clone());
        controller.claim(5, None).await.unwrap();
        controller.mark_delivered(5).await.unwrap();
        // the backend keeps serving the shipping record for a while
        gateway.set_status(5, OrderStatus::Shipping);
        let mut events = controller.subscribe();

        controller.load_detail(5).await.unwrap();
        controller.refresh_mine().await.unwrap();

        assert_eq!(controller.status_of(5), Some(OrderStatus::Delivered));
        assert!(status_changes(&mut events).is_empty());
    }

    #[tokio::test]
    async fn list_refresh_announces_orders_that_moved_elsewhere() {
        let gateway = Arc::new(FakeGateway::with_orders(&[3, 4]));
        let (controller, _notifier) = controller(gateway.clone());
        controller.refresh_all().await.unwrap();
        let mut events = controller.subscribe();

        gateway.set_status(3, OrderStatus::Shipping);
        controller.refresh_all().await.unwrap();

        assert_eq!(status_changes(&mut events), vec![(3, OrderStatus::Shipping)]);
        assert_eq!(controller.status_of(3), Some(OrderStatus::Shipping));
        assert_eq!(controller.status_of(4), Some(OrderStatus::Processing));
    }

    #[tokio::test]
    async fn synthesis_needs_a_row_in_the_current_lists() {
        let gateway = Arc::new(FakeGateway::with_orders(&[7]));
        let (controller, _notifier) = controller(gateway.clone());
        controller.refresh_all().await.unwrap();

        gateway.remove(7);
        controller.refresh_all().await.unwrap();
        assert!(ids(controller.available()).is_empty());

        let err = controller.load_detail(7).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(matches!(controller.detail(), Snapshot::Failed(_)));
    }

    #[tokio::test]
    async fn order_locks_are_dropped_after_mutations() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1, 2]));
        let (controller, _notifier) = controller(gateway);

        controller.claim(1, None).await.unwrap();
        let (claimed, delivered) = tokio::join!(
            controller.claim(2, None),
            controller.mark_delivered(1),
        );
        claimed.unwrap();
        delivered.unwrap();

        assert!(controller.order_locks.is_empty());
    }

    #[tokio::test]
    async fn watchers_see_each_published_snapshot() {
        let gateway = Arc::new(FakeGateway::with_orders(&[1]));
        let (controller, _notifier) = controller(gateway);
        let mut available = controller.subscribe_available();
        let mut mine = controller.subscribe_mine();
        let mut detail = controller.subscribe_detail();
        assert_eq!(*available.borrow_and_update(), Snapshot::Loading);

        controller.refresh_all().await.unwrap();
        controller.load_detail(1).await.unwrap();

        assert!(available.has_changed().unwrap());
        assert_eq!(ids(available.borrow_and_update().clone()), vec![1]);
        assert!(mine.has_changed().unwrap());
        assert!(mine.borrow_and_update().ready().unwrap().is_empty());
        assert!(detail.has_changed().unwrap());
        assert!(detail.borrow_and_update().ready().unwrap().synthesized);
    }
}
