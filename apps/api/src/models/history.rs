use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// One tracked storefront event. Externally owned, append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RawEvent {
    pub user_id: String,
    pub session_id: Option<String>,
    pub event_name: String,
    pub event_time: DateTime<Utc>,
    pub path_name: Option<String>,
    pub payload: Option<Value>,
    pub event_location: Option<String>,
}

/// One completed order. `paid_amount` is in unit currency, not cents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RawOrder {
    pub order_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub products_payload: Option<Value>,
    pub paid_amount: f64,
    pub order_date: DateTime<Utc>,
    pub session_location: Option<String>,
}

/// A pending user together with the history needed to segment them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserHistory {
    pub user_id: String,
    /// Profile location, "City, Country".
    pub home_location: Option<String>,
    pub events: Vec<RawEvent>,
    pub orders: Vec<RawOrder>,
}
