use std::fmt;

use serde::{Deserialize, Serialize};

pub type OrderId = i64;
pub type UserId = i64;

/// Stand-in drop-off point for details rebuilt from a list row.
pub const PLACEHOLDER_LOCATION: GeoPoint = GeoPoint {
    lat: 10.762622,
    lng: 106.660172,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Processing,
    Shipping,
    Delivered,
    Other(String),
}

impl OrderStatus {
    /// Position in the processing -> shipping -> delivered lifecycle.
    /// Statuses outside the lifecycle have no rank.
    pub fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Processing => Some(0),
            OrderStatus::Shipping => Some(1),
            OrderStatus::Delivered => Some(2),
            OrderStatus::Other(_) => None,
        }
    }

    /// Whether a client may request `next` for an order currently in `self`.
    /// Re-applying the current status is allowed; moving backwards is not.
    pub fn can_advance_to(&self, next: &OrderStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target >= current,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Processing => "processing",
            OrderStatus::Shipping => "shipping",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "processing" => OrderStatus::Processing,
            "shipping" => OrderStatus::Shipping,
            "delivered" => OrderStatus::Delivered,
            _ => OrderStatus::Other(raw),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unpaid" => PaymentStatus::Unpaid,
            "paid" => PaymentStatus::Paid,
            _ => PaymentStatus::Other(raw),
        }
    }
}

impl From<PaymentStatus> for String {
    fn from(status: PaymentStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of an order list as the backend returns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSummary {
    pub id: OrderId,
    #[serde(rename = "order_status")]
    pub status: OrderStatus,
    pub total_amount: f64,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderListKind {
    /// Claimable orders, still processing.
    Available,
    /// Orders this courier has claimed and is shipping.
    Mine,
}

impl OrderListKind {
    pub fn label(&self) -> &'static str {
        match self {
            OrderListKind::Available => "available",
            OrderListKind::Mine => "mine",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderListView {
    pub kind: OrderListKind,
    pub orders: Vec<OrderSummary>,
}

impl OrderListView {
    pub fn empty(kind: OrderListKind) -> Self {
        Self {
            kind,
            orders: Vec::new(),
        }
    }

    pub fn find(&self, order_id: OrderId) -> Option<&OrderSummary> {
        self.orders.iter().find(|order| order.id == order_id)
    }

    pub fn ids(&self) -> Vec<OrderId> {
        self.orders.iter().map(|order| order.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    #[serde(rename = "user_id", default)]
    pub customer_id: Option<UserId>,
    #[serde(rename = "user_name", default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(rename = "order_status")]
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    #[serde(flatten)]
    pub location: Coordinates,
    pub total_amount: f64,
    #[serde(default)]
    pub thumbnail_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Flat `latitude`/`longitude` pair as the order endpoint encodes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<Coordinates> for GeoPoint {
    fn from(value: Coordinates) -> Self {
        GeoPoint {
            lat: value.latitude,
            lng: value.longitude,
        }
    }
}

impl From<GeoPoint> for Coordinates {
    fn from(value: GeoPoint) -> Self {
        Coordinates {
            latitude: value.lat,
            longitude: value.lng,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub product_id: i64,
    pub product_name: String,
    #[serde(default)]
    pub product_image: Option<String>,
    pub quantity: i64,
    pub price: f64,
    pub subtotal: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderDetail {
    pub order: Order,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    /// Set when the record was rebuilt from a list row because the detail
    /// endpoint had nothing. Such records carry no items and no contact data.
    #[serde(default)]
    pub synthesized: bool,
}

impl OrderDetail {
    pub fn synthesize(summary: &OrderSummary) -> Self {
        Self {
            order: Order {
                id: summary.id,
                customer_id: None,
                customer_name: None,
                phone: None,
                status: summary.status.clone(),
                payment_status: PaymentStatus::Unpaid,
                location: PLACEHOLDER_LOCATION.into(),
                total_amount: summary.total_amount,
                thumbnail_id: None,
                created_at: None,
            },
            items: Vec::new(),
            synthesized: true,
        }
    }

    pub fn location(&self) -> GeoPoint {
        self.order.location.into()
    }
}
