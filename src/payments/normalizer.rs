//! Webhook payload normalization and field validation
//!
//! Two payload shapes are accepted:
//!
//! - provider-native: `{"event": "...", "data": {"amount", "reference", "status",
//!   "paid_at", "customer": {"phone"}, "metadata": {"order_id"}}}`
//! - flat (used by test tooling): `{"amount", "transaction_reference", "order_id",
//!   "customer_phone", "payment_date", "status"}`
//!
//! Normalization never fails. Anything it cannot read comes out as an empty
//! string or zero, and [`validate`] is the single place a payload is rejected.

use crate::payments::types::{CanonicalPayment, NotificationStatus};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

pub const MAX_REFERENCE_LEN: usize = 100;
pub const MAX_ORDER_ID_LEN: usize = 50;
pub const MAX_PHONE_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    Provider,
    Flat,
    Unrecognized,
}

impl PayloadShape {
    /// Explicit discriminator: a provider envelope has a string `event` and an
    /// object `data`; a flat payload carries `transaction_reference` at the top.
    pub fn classify(payload: &Value) -> Self {
        let has_event = payload.get("event").map(Value::is_string).unwrap_or(false);
        let has_data = payload.get("data").map(Value::is_object).unwrap_or(false);

        if has_event && has_data {
            PayloadShape::Provider
        } else if payload.get("transaction_reference").is_some() {
            PayloadShape::Flat
        } else {
            PayloadShape::Unrecognized
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AmountField {
    /// Absent, treated as zero
    Missing,
    Parsed(Decimal),
    Invalid(String),
}

/// Fields pulled out of a payload, not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPayment {
    pub shape: PayloadShape,
    pub amount: AmountField,
    pub transaction_reference: String,
    pub order_id: String,
    pub customer_phone: String,
    pub payment_date: String,
    pub status: String,
}

/// Field name to list of problems, serialized into the 400 response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::default();
        errors.add(field, message);
        errors
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<&str> = self.0.keys().map(String::as_str).collect();
        write!(f, "invalid fields: {}", fields.join(", "))
    }
}

pub fn normalize(payload: &Value) -> NormalizedPayment {
    let shape = PayloadShape::classify(payload);

    match shape {
        PayloadShape::Provider => NormalizedPayment {
            shape,
            amount: amount_at(payload.pointer("/data/amount")),
            transaction_reference: text_at(payload.pointer("/data/reference")),
            order_id: text_at(payload.pointer("/data/metadata/order_id")),
            customer_phone: text_at(payload.pointer("/data/customer/phone")),
            payment_date: text_at(payload.pointer("/data/paid_at")),
            status: provider_status(&text_at(payload.pointer("/data/status"))),
        },
        PayloadShape::Flat => NormalizedPayment {
            shape,
            amount: amount_at(payload.get("amount")),
            transaction_reference: text_at(payload.get("transaction_reference")),
            order_id: text_at(payload.get("order_id")),
            customer_phone: text_at(payload.get("customer_phone")),
            payment_date: text_at(payload.get("payment_date")),
            status: text_at(payload.get("status")).to_lowercase(),
        },
        PayloadShape::Unrecognized => NormalizedPayment {
            shape,
            amount: AmountField::Missing,
            transaction_reference: String::new(),
            order_id: String::new(),
            customer_phone: String::new(),
            payment_date: String::new(),
            status: String::new(),
        },
    }
}

pub fn validate(normalized: &NormalizedPayment) -> Result<CanonicalPayment, FieldErrors> {
    let mut errors = FieldErrors::default();

    if normalized.shape == PayloadShape::Unrecognized {
        errors.add("payload", "payload shape not recognized");
    }

    let amount = match &normalized.amount {
        AmountField::Missing => Decimal::ZERO,
        AmountField::Parsed(amount) => *amount,
        AmountField::Invalid(raw) => {
            errors.add("amount", format!("'{}' is not a number", raw));
            Decimal::ZERO
        }
    };
    if amount.is_sign_negative() && !amount.is_zero() {
        errors.add("amount", "must be greater than or equal to 0");
    }

    check_text(
        &mut errors,
        "transaction_reference",
        &normalized.transaction_reference,
        MAX_REFERENCE_LEN,
    );
    check_text(&mut errors, "order_id", &normalized.order_id, MAX_ORDER_ID_LEN);
    check_text(
        &mut errors,
        "customer_phone",
        &normalized.customer_phone,
        MAX_PHONE_LEN,
    );

    let payment_date = match parse_payment_date(&normalized.payment_date) {
        Some(date) => Some(date),
        None => {
            errors.add("payment_date", "must be a valid date");
            None
        }
    };

    let status = match NotificationStatus::parse(&normalized.status) {
        Some(status) => Some(status),
        None => {
            errors.add("status", "must be one of: successful, failed, pending");
            None
        }
    };

    match (errors.is_empty(), payment_date, status) {
        (true, Some(payment_date), Some(status)) => Ok(CanonicalPayment {
            amount,
            transaction_reference: normalized.transaction_reference.clone(),
            order_id: normalized.order_id.clone(),
            customer_phone: normalized.customer_phone.clone(),
            payment_date,
            status,
        }),
        _ => Err(errors),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and `YYYY-MM-DD`.
pub fn parse_payment_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(date.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn check_text(errors: &mut FieldErrors, field: &str, value: &str, max_len: usize) {
    if value.trim().is_empty() {
        errors.add(field, "is required");
    } else if value.chars().count() > max_len {
        errors.add(field, format!("must be at most {} characters", max_len));
    }
}

fn text_at(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn amount_at(value: Option<&Value>) -> AmountField {
    let raw = match value {
        None | Some(Value::Null) => return AmountField::Missing,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return AmountField::Invalid(other.to_string()),
    };

    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map(AmountField::Parsed)
        .unwrap_or(AmountField::Invalid(raw))
}

fn provider_status(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "success" | "successful" | "completed" => "successful".to_string(),
        "failed" | "failure" | "cancelled" | "reversed" => "failed".to_string(),
        "pending" | "processing" | "ongoing" => "pending".to_string(),
        other => other.to_string(),
    }
}
