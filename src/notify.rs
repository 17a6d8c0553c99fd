use tracing::info;

use crate::models::order::OrderId;

/// Local notification presenter. Presentation is entirely the
/// implementor's concern.
pub trait Notifier: Send + Sync {
    fn order_claimed(&self, order_id: OrderId);
    fn order_delivered(&self, order_id: OrderId);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn order_claimed(&self, order_id: OrderId) {
        info!(order_id, "order received");
    }

    fn order_delivered(&self, order_id: OrderId) {
        info!(order_id, "order marked as delivered");
    }
}
