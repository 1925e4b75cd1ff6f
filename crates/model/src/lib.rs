//! Shared domain types for the loyalty-accrual backend.
//!
//! These types are used across the `repository`, `auth`, `poller`, and
//! `server` crates so that the order/balance state machine has exactly one
//! definition in the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered user: identity, credentials, and running balance.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub password_hash: Vec<u8>,
    /// Available balance.
    pub sum: f64,
    /// Lifetime debited total; never decreases.
    pub writeoff: f64,
}

/// Lifecycle status of an [`Order`], driven by the external accrual service.
///
/// ```text
/// NEW -> REGISTERED -> PROCESSING -> PROCESSED (terminal)
///                                 \-> INVALID   (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    New,
    Registered,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    /// `PROCESSED` and `INVALID` are sinks: no further transition is valid.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::Registered => "REGISTERED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Error returned when a status string doesn't match one of the five labels.
#[derive(Debug, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct ParseOrderStatusError(pub String);

impl FromStr for OrderStatus {
    type Err = ParseOrderStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "REGISTERED" => Ok(OrderStatus::Registered),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(ParseOrderStatusError(other.to_string())),
        }
    }
}

impl Serialize for OrderStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OrderStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single purchase tracked through the accrual lifecycle.
///
/// `id` is the order number itself (Luhn-valid), not a surrogate key.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: i64,
    pub status: OrderStatus,
    pub user_id: i64,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Non-null only when `status == Processed`.
    pub accrual: Option<f64>,
}

/// A debit of balance against an order; immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub order_id: i64,
    pub processed_at: DateTime<Utc>,
    pub sum: f64,
}

/// Result of submitting an order: inherently a three-way sum type rather
/// than a bare status string plus error, so call sites can't conflate
/// "already yours" with "owned by someone else".
#[derive(Debug, Clone, PartialEq)]
pub enum AddOrderOutcome {
    /// A fresh row was created in `NEW`.
    Inserted,
    /// The order already belongs to the calling user; carries its status so
    /// the caller can decide whether to re-enqueue it with the poller.
    AlreadyYours(OrderStatus),
    /// The order exists, but under a different user.
    OwnedByOther,
}

/// Available and lifetime-withdrawn balance, as reported to the client.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Balance {
    pub current: f64,
    pub withdrawn: f64,
}

/// One entry in the `GET /api/user/orders` response.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<f64>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(o: Order) -> Self {
        OrderView {
            number: o.id.to_string(),
            status: o.status,
            accrual: o.accrual,
            uploaded_at: o.uploaded_at,
        }
    }
}

/// Body of `POST /api/user/balance/withdraw`.
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    /// Absent when the client omits `sum` entirely, so the handler can
    /// tell "missing" (400) apart from "present but zero" (also 400).
    pub sum: Option<f64>,
}

/// One entry in the `GET /api/user/withdrawals` response.
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalView {
    pub order: String,
    pub sum: f64,
    pub processed_at: DateTime<Utc>,
}

impl From<Payment> for WithdrawalView {
    fn from(p: Payment) -> Self {
        WithdrawalView {
            order: p.order_id.to_string(),
            sum: p.sum,
            processed_at: p.processed_at,
        }
    }
}

/// Body of `POST /api/user/register` and `POST /api/user/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// The accrual service's `200` response body for `GET /api/orders/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccrualResponse {
    #[serde(deserialize_with = "deserialize_order_number")]
    pub order: i64,
    pub status: OrderStatus,
    #[serde(default)]
    pub accrual: Option<f64>,
}

fn deserialize_order_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Standard mod-10 checksum used to validate order numbers.
pub fn luhn_valid(number: i64) -> bool {
    if number < 0 {
        return false;
    }
    let digits: Vec<u32> = number
        .to_string()
        .chars()
        .rev()
        .map(|c| c.to_digit(10).unwrap())
        .collect();
    if digits.is_empty() {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
