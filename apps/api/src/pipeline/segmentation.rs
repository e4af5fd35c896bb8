//! Segmentation engine: deterministic, rule-based labelling of one user.
//!
//! Six independent facets over the supplied history, joined into one label:
//! `session2EventCount{Low|Medium|High}-session2OrderCount{..}-totalSpent{..}-`
//! `giftWrap{Yes|No}-shoppingCartAbandonment{Yes|No}-differentLocation{Yes|No}`.
//!
//! Missing or malformed fields degrade to the low/no bucket; only history that
//! cannot belong to the user (foreign rows, non-finite amounts) is an error.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::history::{RawEvent, RawOrder, UserHistory};
use crate::models::location::Location;

/// Label recorded when a user's history cannot be segmented.
pub const ERROR_LABEL: &str = "segmentationError";

const EVENTS_PER_SESSION_LOW_MAX: f64 = 10.0;
const EVENTS_PER_SESSION_MEDIUM_MAX: f64 = 20.0;
const ORDERS_PER_SESSION_LOW_MAX: f64 = 2.0;
const ORDERS_PER_SESSION_MEDIUM_MAX: f64 = 5.0;
const SPEND_LOW_MAX: f64 = 250.0;
const SPEND_MEDIUM_MAX: f64 = 1000.0;

const EVENT_CART_CLEAR: &str = "cart_clear";
const EVENT_CHECKOUT_CLICK: &str = "checkout_click";
const EVENT_CHECKOUT_SUCCESS: &str = "checkout_success";

const GIFT_KEYS: [&str; 3] = ["gift", "gift_wrap", "giftWrap"];

#[derive(Debug, Error, PartialEq)]
pub enum SegmentationError {
    #[error("{kind} row belongs to user '{found}'")]
    ForeignRow { kind: &'static str, found: String },

    #[error("order '{order_id}' has a non-finite paid amount")]
    NonFiniteAmount { order_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Volume {
    Low,
    Medium,
    High,
}

impl Volume {
    /// Upper bounds are inclusive: `low_max` itself is still `Low`.
    pub fn bucket(value: f64, low_max: f64, medium_max: f64) -> Self {
        if value <= low_max {
            Volume::Low
        } else if value <= medium_max {
            Volume::Medium
        } else {
            Volume::High
        }
    }

    fn as_label(self) -> &'static str {
        match self {
            Volume::Low => "Low",
            Volume::Medium => "Medium",
            Volume::High => "High",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFacets {
    pub event_volume: Volume,
    pub order_volume: Volume,
    pub total_spent: Volume,
    pub gift_wrap: bool,
    pub cart_abandonment: bool,
    pub different_location: bool,
}

impl SegmentFacets {
    pub fn label(&self) -> String {
        format!(
            "session2EventCount{}-session2OrderCount{}-totalSpent{}-giftWrap{}-shoppingCartAbandonment{}-differentLocation{}",
            self.event_volume.as_label(),
            self.order_volume.as_label(),
            self.total_spent.as_label(),
            yes_no(self.gift_wrap),
            yes_no(self.cart_abandonment),
            yes_no(self.different_location),
        )
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// Pluggable segmenter. The orchestrator holds an `Arc<dyn Segmenter>`.
pub trait Segmenter: Send + Sync {
    fn segment(&self, history: &UserHistory) -> Result<String, SegmentationError>;
}

/// Default rule-based segmenter.
pub struct RuleBasedSegmenter;

impl Segmenter for RuleBasedSegmenter {
    fn segment(&self, history: &UserHistory) -> Result<String, SegmentationError> {
        segment(
            &history.user_id,
            &history.events,
            &history.orders,
            history.home_location.as_deref(),
        )
        .map(|facets| facets.label())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Core facet computation
// ────────────────────────────────────────────────────────────────────────────

pub fn segment(
    user_id: &str,
    events: &[RawEvent],
    orders: &[RawOrder],
    home_location: Option<&str>,
) -> Result<SegmentFacets, SegmentationError> {
    if let Some(foreign) = events.iter().find(|e| e.user_id != user_id) {
        return Err(SegmentationError::ForeignRow {
            kind: "event",
            found: foreign.user_id.clone(),
        });
    }
    if let Some(foreign) = orders.iter().find(|o| o.user_id != user_id) {
        return Err(SegmentationError::ForeignRow {
            kind: "order",
            found: foreign.user_id.clone(),
        });
    }

    let mut total_spent = 0.0_f64;
    for order in orders {
        if !order.paid_amount.is_finite() {
            return Err(SegmentationError::NonFiniteAmount {
                order_id: order.order_id.clone(),
            });
        }
        total_spent += order.paid_amount;
    }

    let sessions: BTreeSet<&str> = events
        .iter()
        .filter_map(|e| non_empty(e.session_id.as_deref()))
        .chain(orders.iter().filter_map(|o| non_empty(o.session_id.as_deref())))
        .collect();

    let events_per_session = per_session(events.len(), sessions.len());
    let orders_per_session = per_session(orders.len(), sessions.len());

    let last = last_session(events, orders);
    let (gift_wrap, cart_abandonment, different_location) = match last {
        Some(session) => {
            let session_events: Vec<&RawEvent> = events
                .iter()
                .filter(|e| non_empty(e.session_id.as_deref()) == Some(session))
                .collect();
            let session_orders: Vec<&RawOrder> = orders
                .iter()
                .filter(|o| non_empty(o.session_id.as_deref()) == Some(session))
                .collect();
            (
                gift_wrap_in(&session_events, &session_orders),
                cart_abandoned_in(&session_events, &session_orders),
                location_differs(&session_events, events, home_location),
            )
        }
        None => (false, false, false),
    };

    Ok(SegmentFacets {
        event_volume: Volume::bucket(
            events_per_session,
            EVENTS_PER_SESSION_LOW_MAX,
            EVENTS_PER_SESSION_MEDIUM_MAX,
        ),
        order_volume: Volume::bucket(
            orders_per_session,
            ORDERS_PER_SESSION_LOW_MAX,
            ORDERS_PER_SESSION_MEDIUM_MAX,
        ),
        total_spent: Volume::bucket(total_spent, SPEND_LOW_MAX, SPEND_MEDIUM_MAX),
        gift_wrap,
        cart_abandonment,
        different_location,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn per_session(count: usize, sessions: usize) -> f64 {
    if sessions == 0 {
        0.0
    } else {
        count as f64 / sessions as f64
    }
}

/// Session of the most recent event, falling back to the most recent order.
fn last_session<'a>(events: &'a [RawEvent], orders: &'a [RawOrder]) -> Option<&'a str> {
    events
        .iter()
        .filter(|e| non_empty(e.session_id.as_deref()).is_some())
        .max_by(|a, b| a.event_time.cmp(&b.event_time))
        .and_then(|e| non_empty(e.session_id.as_deref()))
        .or_else(|| {
            orders
                .iter()
                .filter(|o| non_empty(o.session_id.as_deref()).is_some())
                .max_by(|a, b| a.order_date.cmp(&b.order_date))
                .and_then(|o| non_empty(o.session_id.as_deref()))
        })
}

fn gift_wrap_in(session_events: &[&RawEvent], session_orders: &[&RawOrder]) -> bool {
    session_events
        .iter()
        .filter_map(|e| e.payload.as_ref())
        .any(payload_has_gift)
        || session_orders
            .iter()
            .filter_map(|o| o.products_payload.as_ref())
            .any(|p| parse_payload(p).is_some_and(|v| products_have_gift(&v)))
}

fn cart_abandoned_in(session_events: &[&RawEvent], session_orders: &[&RawOrder]) -> bool {
    let initiated = session_events
        .iter()
        .any(|e| e.event_name == EVENT_CART_CLEAR || e.event_name == EVENT_CHECKOUT_CLICK);
    let completed = !session_orders.is_empty()
        || session_events
            .iter()
            .any(|e| e.event_name == EVENT_CHECKOUT_SUCCESS);
    initiated && !completed
}

/// Last located event of the session vs the profile location. Without a
/// profile location the user's earliest located event stands in for home.
fn location_differs(
    session_events: &[&RawEvent],
    all_events: &[RawEvent],
    home_location: Option<&str>,
) -> bool {
    let current = session_events
        .iter()
        .filter(|e| non_empty(e.event_location.as_deref()).is_some())
        .max_by(|a, b| a.event_time.cmp(&b.event_time))
        .and_then(|e| e.event_location.as_deref())
        .and_then(Location::parse);

    let home = non_empty(home_location)
        .and_then(Location::parse)
        .or_else(|| {
            all_events
                .iter()
                .filter(|e| non_empty(e.event_location.as_deref()).is_some())
                .min_by(|a, b| a.event_time.cmp(&b.event_time))
                .and_then(|e| e.event_location.as_deref())
                .and_then(Location::parse)
        });

    match (home, current) {
        (Some(home), Some(current)) => home.differs_from(&current),
        _ => false,
    }
}

/// Payloads arrive either as JSON or as JSON encoded in a string column.
fn parse_payload(raw: &Value) -> Option<Cow<'_, Value>> {
    match raw {
        Value::String(s) => serde_json::from_str::<Value>(s).ok().map(Cow::Owned),
        Value::Null => None,
        other => Some(Cow::Borrowed(other)),
    }
}

fn has_gift_flag(map: &Map<String, Value>) -> bool {
    GIFT_KEYS
        .iter()
        .any(|k| map.get(*k).and_then(Value::as_bool) == Some(true))
}

fn products_have_gift(products: &Value) -> bool {
    match products {
        Value::Object(items) => items
            .values()
            .any(|item| item.as_object().is_some_and(has_gift_flag)),
        Value::Array(items) => items
            .iter()
            .any(|item| item.as_object().is_some_and(has_gift_flag)),
        _ => false,
    }
}

fn payload_has_gift(payload: &Value) -> bool {
    let Some(parsed) = parse_payload(payload) else {
        return false;
    };
    match parsed.as_object() {
        Some(map) => has_gift_flag(map) || map.get("products").is_some_and(products_have_gift),
        None => false,
    }
}
