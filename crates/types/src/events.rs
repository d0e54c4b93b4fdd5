//! Transaction events and their wire codec
//!
//! A transaction travels over the broker as a flat JSON object. Decoding is
//! strict about the fields that feed aggregation (identity, quantity, price)
//! and lenient about the ones the source data is known to get wrong
//! (timestamps, customer ids, numeric encodings).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::errors::{CodecError, Result};

/// Country recorded when the source omits one
pub const UNKNOWN_COUNTRY: &str = "UNKNOWN";

/// Prefix of customer ids synthesized for guest checkouts
pub const GUEST_CUSTOMER_PREFIX: &str = "GUEST-";

/// Epoch values above this are interpreted as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Accepted textual timestamp layouts besides RFC 3339
const NAIVE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

/// Tolerance between a declared total and quantity x unit_price
fn total_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Largest line total accepted, keeps window sums far from `Decimal::MAX`
pub fn max_total_amount() -> Decimal {
    Decimal::new(1_000_000_000_000_000, 0)
}

/// Event times outside `[1970-01-01, 9999-12-31]` count as unparseable
fn event_time_in_range(ts: &DateTime<Utc>) -> bool {
    (0..=253_402_300_799).contains(&ts.timestamp())
}

/// One line of an e-commerce invoice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Invoice number, never empty
    pub invoice_no: String,
    /// Product code
    pub stock_code: String,
    /// Free-form product description
    pub description: String,
    /// Customer id, synthesized when the source has none
    pub customer_id: String,
    /// Country of the customer
    pub country: String,
    /// Units sold; negative only on returns
    pub quantity: i64,
    /// Price per unit, never negative
    pub unit_price: Decimal,
    /// quantity x unit_price
    pub total_amount: Decimal,
    /// When the sale happened
    pub event_time: DateTime<Utc>,
    /// Explicit return marker from the source
    pub is_return: bool,
    /// `event_time` was substituted with the ingestion time
    pub event_time_inferred: bool,
    /// `customer_id` was synthesized
    pub customer_id_generated: bool,
}

impl Transaction {
    /// Create a transaction whose total is derived from quantity and price
    pub fn new(
        invoice_no: impl Into<String>,
        stock_code: impl Into<String>,
        customer_id: impl Into<String>,
        country: impl Into<String>,
        quantity: i64,
        unit_price: Decimal,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            invoice_no: invoice_no.into(),
            stock_code: stock_code.into(),
            description: String::new(),
            customer_id: customer_id.into(),
            country: country.into(),
            quantity,
            unit_price,
            total_amount: Decimal::from(quantity) * unit_price,
            event_time,
            is_return: false,
            event_time_inferred: false,
            customer_id_generated: false,
        }
    }

    /// Override the total amount
    pub fn with_total_amount(mut self, total_amount: Decimal) -> Self {
        self.total_amount = total_amount;
        self
    }

    /// Set the product description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether this line belongs to a return or cancellation.
    ///
    /// Cancelled invoices carry a `C` prefix in the source dataset.
    pub fn is_return(&self) -> bool {
        self.is_return || self.invoice_no.starts_with('C')
    }

    /// Stable identity of this event across redeliveries
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.invoice_no.as_bytes());
        hasher.update(b"|");
        hasher.update(self.stock_code.as_bytes());
        hasher.update(b"|");
        hasher.update(self.event_time.timestamp_millis().to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Inbound shape; every field is inspected once here and never again
#[derive(Debug, Deserialize)]
struct RawTransaction {
    invoice_no: Option<Value>,
    stock_code: Option<Value>,
    description: Option<String>,
    quantity: Option<Value>,
    unit_price: Option<Value>,
    total_amount: Option<Value>,
    customer_id: Option<Value>,
    country: Option<String>,
    #[serde(alias = "event_time")]
    invoice_date: Option<Value>,
    #[serde(default)]
    is_return: bool,
}

/// Outbound shape, numbers written as JSON numbers
#[derive(Debug, Serialize)]
struct WireTransaction<'a> {
    invoice_no: &'a str,
    stock_code: &'a str,
    description: &'a str,
    quantity: i64,
    #[serde(with = "rust_decimal::serde::float")]
    unit_price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    total_amount: Decimal,
    customer_id: &'a str,
    country: &'a str,
    invoice_date: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_return: bool,
}

/// Encode a transaction into its wire form
pub fn encode_transaction(tx: &Transaction) -> Result<Vec<u8>> {
    let wire = WireTransaction {
        invoice_no: &tx.invoice_no,
        stock_code: &tx.stock_code,
        description: &tx.description,
        quantity: tx.quantity,
        unit_price: tx.unit_price,
        total_amount: tx.total_amount,
        customer_id: &tx.customer_id,
        country: &tx.country,
        invoice_date: tx.event_time.to_rfc3339(),
        is_return: tx.is_return,
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode and validate a wire payload, using the current time as the
/// fallback event time.
pub fn decode_transaction(payload: &[u8]) -> Result<Transaction> {
    decode_transaction_at(payload, Utc::now())
}

/// Decode and validate a wire payload.
///
/// `ingested_at` replaces a missing or unparseable `invoice_date`.
pub fn decode_transaction_at(payload: &[u8], ingested_at: DateTime<Utc>) -> Result<Transaction> {
    let raw: RawTransaction = serde_json::from_slice(payload)?;

    let invoice_no = raw
        .invoice_no
        .as_ref()
        .and_then(text_of)
        .ok_or(CodecError::MissingField("invoice_no"))?;
    if invoice_no.is_empty() {
        return Err(CodecError::MissingField("invoice_no"));
    }

    let stock_code = raw.stock_code.as_ref().and_then(text_of).unwrap_or_default();

    let quantity = raw
        .quantity
        .as_ref()
        .ok_or(CodecError::MissingField("quantity"))
        .and_then(|v| integer_from_value("quantity", v))?;

    let unit_price = raw
        .unit_price
        .as_ref()
        .ok_or(CodecError::MissingField("unit_price"))
        .and_then(|v| decimal_from_value("unit_price", v))?;
    if unit_price < Decimal::ZERO {
        return Err(CodecError::NegativeUnitPrice(unit_price.to_string()));
    }

    let is_return = raw.is_return || invoice_no.starts_with('C');
    if quantity < 0 && !is_return {
        return Err(CodecError::NegativeQuantity {
            invoice_no,
            quantity,
        });
    }

    let computed = Decimal::from(quantity)
        .checked_mul(unit_price)
        .filter(|total| total.abs() <= max_total_amount())
        .ok_or_else(|| CodecError::InvalidField {
            field: "total_amount",
            reason: format!("{quantity} x {unit_price} exceeds {}", max_total_amount()),
        })?;
    // A declared total only has to agree with the product; the exact
    // product is kept so float noise from producers never reaches revenue.
    if let Some(value) = raw.total_amount.as_ref().filter(|v| !v.is_null()) {
        let declared = decimal_from_value("total_amount", value)?;
        let mismatch = declared
            .checked_sub(computed)
            .map_or(true, |diff| diff.abs() > total_tolerance());
        if mismatch {
            return Err(CodecError::TotalMismatch {
                declared: declared.to_string(),
                computed: computed.to_string(),
            });
        }
    }

    let (customer_id, customer_id_generated) = match raw.customer_id.as_ref().and_then(customer_of) {
        Some(id) => (id, false),
        None => (guest_customer_id(&invoice_no), true),
    };

    let country = raw
        .country
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());

    let parsed = raw
        .invoice_date
        .as_ref()
        .and_then(parse_event_time)
        .filter(event_time_in_range);
    let (event_time, event_time_inferred) = match parsed {
        Some(ts) => (ts, false),
        None => (ingested_at, true),
    };

    Ok(Transaction {
        invoice_no,
        stock_code,
        description: raw.description.unwrap_or_default(),
        customer_id,
        country,
        quantity,
        unit_price,
        total_amount: computed,
        event_time,
        is_return: raw.is_return,
        event_time_inferred,
        customer_id_generated,
    })
}

/// Deterministic id for a checkout without a customer, so replays of the
/// same invoice always count as the same guest.
fn guest_customer_id(invoice_no: &str) -> String {
    let digest = Sha256::digest(invoice_no.as_bytes());
    let hex = format!("{:x}", digest);
    format!("{}{}", GUEST_CUSTOMER_PREFIX, &hex[..16])
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Customer ids arrive as strings, integers or floats ("17850.0")
fn customer_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        },
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    if text.is_empty() || text.eq_ignore_ascii_case("nan") || text.eq_ignore_ascii_case("none") {
        return None;
    }
    match text.strip_suffix(".0") {
        Some(stripped) if stripped.chars().all(|c| c.is_ascii_digit()) => Some(stripped.to_string()),
        _ => Some(text),
    }
}

fn parse_decimal(field: &'static str, text: &str) -> Result<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| CodecError::InvalidField {
            field,
            reason: format!("{text:?}: {e}"),
        })
}

fn decimal_from_value(field: &'static str, value: &Value) -> Result<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(field, &n.to_string()),
        Value::String(s) => parse_decimal(field, s.trim()),
        other => Err(CodecError::InvalidField {
            field,
            reason: format!("expected a number, got {other}"),
        }),
    }
}

fn integer_from_value(field: &'static str, value: &Value) -> Result<i64> {
    if let Value::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Ok(i);
        }
    }
    let decimal = decimal_from_value(field, value)?;
    if !decimal.fract().is_zero() {
        return Err(CodecError::InvalidField {
            field,
            reason: format!("{decimal} is not a whole number"),
        });
    }
    decimal.to_i64().ok_or_else(|| CodecError::InvalidField {
        field,
        reason: format!("{decimal} is out of range"),
    })
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.unsigned_abs() > EPOCH_MILLIS_THRESHOLD as u64 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

fn parse_event_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => from_epoch(i),
            None => {
                let secs = n.as_f64()?;
                if !secs.is_finite() {
                    return None;
                }
                if secs.abs() > EPOCH_MILLIS_THRESHOLD as f64 {
                    from_epoch(secs as i64)
                } else {
                    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
                }
            }
        },
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(epoch) = text.parse::<i64>() {
        return from_epoch(epoch);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(text: &str) -> Decimal {
        text.parse().unwrap()
    }

    fn ingest_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn decode(json: serde_json::Value) -> Result<Transaction> {
        decode_transaction_at(json.to_string().as_bytes(), ingest_time())
    }

    #[test]
    fn test_decode_producer_payload() {
        let tx = decode(serde_json::json!({
            "invoice_no": "536365",
            "stock_code": "85123A",
            "description": "WHITE HANGING HEART T-LIGHT HOLDER",
            "quantity": 6,
            "invoice_date": 1291191960,
            "unit_price": 2.55,
            "customer_id": "17850.0",
            "country": "United Kingdom",
            "total_amount": 15.299999999999999
        }))
        .unwrap();

        assert_eq!(tx.invoice_no, "536365");
        assert_eq!(tx.customer_id, "17850");
        assert_eq!(tx.quantity, 6);
        assert_eq!(tx.unit_price, dec("2.55"));
        assert_eq!(tx.total_amount, dec("15.30"));
        assert_eq!(tx.event_time, Utc.timestamp_opt(1291191960, 0).unwrap());
        assert!(!tx.event_time_inferred);
        assert!(!tx.customer_id_generated);
    }

    #[test]
    fn test_total_amount_computed_when_absent() {
        let tx = decode(serde_json::json!({
            "invoice_no": "1",
            "quantity": 3,
            "unit_price": "4.10"
        }))
        .unwrap();
        assert_eq!(tx.total_amount, dec("12.30"));
        assert_eq!(tx.country, UNKNOWN_COUNTRY);
    }

    #[test]
    fn test_missing_invoice_rejected() {
        let err = decode(serde_json::json!({"quantity": 1, "unit_price": 1.0})).unwrap_err();
        assert_eq!(err, CodecError::MissingField("invoice_no"));

        let err = decode(serde_json::json!({"invoice_no": "  ", "quantity": 1, "unit_price": 1.0}))
            .unwrap_err();
        assert_eq!(err, CodecError::MissingField("invoice_no"));
    }

    #[test]
    fn test_negative_price_rejected() {
        let err = decode(serde_json::json!({"invoice_no": "1", "quantity": 1, "unit_price": -0.5}))
            .unwrap_err();
        assert_eq!(err.reason(), "negative_unit_price");
    }

    #[test]
    fn test_negative_quantity_only_on_returns() {
        let err = decode(serde_json::json!({"invoice_no": "536379", "quantity": -1, "unit_price": 27.5}))
            .unwrap_err();
        assert_eq!(err.reason(), "negative_quantity");

        let tx = decode(serde_json::json!({"invoice_no": "C536379", "quantity": -1, "unit_price": 27.5}))
            .unwrap();
        assert!(tx.is_return());
        assert_eq!(tx.total_amount, dec("-27.5"));

        let tx = decode(serde_json::json!({
            "invoice_no": "536380", "quantity": -2, "unit_price": 1, "is_return": true
        }))
        .unwrap();
        assert!(tx.is_return());
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let err = decode(serde_json::json!({
            "invoice_no": "1", "quantity": 1, "unit_price": 12.0, "total_amount": -3.0
        }))
        .unwrap_err();
        assert_eq!(err.reason(), "total_mismatch");
    }

    #[test]
    fn test_unparseable_time_falls_back_to_ingestion() {
        let tx = decode(serde_json::json!({
            "invoice_no": "1", "quantity": 1, "unit_price": 1, "invoice_date": "yesterday-ish"
        }))
        .unwrap();
        assert_eq!(tx.event_time, ingest_time());
        assert!(tx.event_time_inferred);
    }

    #[test]
    fn test_time_formats() {
        let expected = Utc.with_ymd_and_hms(2010, 12, 1, 8, 26, 0).unwrap();
        for raw in [
            serde_json::json!("2010-12-01 08:26:00"),
            serde_json::json!("12/1/2010 8:26"),
            serde_json::json!("2010-12-01T08:26:00Z"),
            serde_json::json!(1291191960000i64),
            serde_json::json!("1291191960"),
        ] {
            let tx = decode(serde_json::json!({
                "invoice_no": "1", "quantity": 1, "unit_price": 1, "invoice_date": raw
            }))
            .unwrap();
            assert_eq!(tx.event_time, expected, "format {raw}");
        }
    }

    #[test]
    fn test_event_time_alias() {
        let tx = decode(serde_json::json!({
            "invoice_no": "1", "quantity": 1, "unit_price": 1, "event_time": "2010-12-01T08:26:00Z"
        }))
        .unwrap();
        assert!(!tx.event_time_inferred);
    }

    #[test]
    fn test_guest_customer_is_deterministic() {
        let a = decode(serde_json::json!({"invoice_no": "9", "quantity": 1, "unit_price": 1, "customer_id": "nan"}))
            .unwrap();
        let b = decode(serde_json::json!({"invoice_no": "9", "quantity": 2, "unit_price": 1}))
            .unwrap();
        assert!(a.customer_id_generated);
        assert!(a.customer_id.starts_with(GUEST_CUSTOMER_PREFIX));
        assert_eq!(a.customer_id, b.customer_id);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode_transaction_at(b"not json", ingest_time()).unwrap_err();
        assert_eq!(err.reason(), "malformed");

        let err = decode(serde_json::json!({"invoice_no": "1", "quantity": "many", "unit_price": 1}))
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_field");
    }

    #[test]
    fn test_encode_then_decode_preserves_event() {
        let tx = Transaction::new(
            "536365",
            "71053",
            "17850",
            "United Kingdom",
            6,
            dec("3.39"),
            Utc.with_ymd_and_hms(2010, 12, 1, 8, 26, 0).unwrap(),
        )
        .with_description("WHITE METAL LANTERN");

        let payload = encode_transaction(&tx).unwrap();
        let decoded = decode_transaction_at(&payload, ingest_time()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_idempotency_key_ignores_quantity_edits() {
        let ts = ingest_time();
        let a = Transaction::new("1", "A", "c", "UK", 1, dec("1"), ts);
        let b = Transaction::new("1", "A", "c", "UK", 5, dec("1"), ts);
        let c = Transaction::new("1", "B", "c", "UK", 1, dec("1"), ts);
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_ne!(a.idempotency_key(), c.idempotency_key());
        assert_eq!(a.idempotency_key().len(), 64);
    }

    #[test]
    fn test_overflowing_amounts_are_invalid() {
        let err = decode(serde_json::json!({
            "invoice_no": "1", "quantity": i64::MAX, "unit_price": "79228162514264337593543950335"
        }))
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { field: "total_amount", .. }));

        // Representable, but past the per-line ceiling
        let err = decode(serde_json::json!({
            "invoice_no": "1", "quantity": 1_000_000, "unit_price": "1000000000000"
        }))
        .unwrap_err();
        assert_eq!(err.reason(), "invalid_field");

        let err = decode(serde_json::json!({
            "invoice_no": "1", "quantity": 2, "unit_price": 5,
            "total_amount": "-79228162514264337593543950335"
        }))
        .unwrap_err();
        assert_eq!(err.reason(), "total_mismatch");
    }

    #[test]
    fn test_extreme_epochs_fall_back_to_ingestion() {
        for raw in [
            serde_json::json!(i64::MIN),
            serde_json::json!(i64::MAX),
            serde_json::json!(-1),
            serde_json::json!("-9223372036854775808"),
            serde_json::json!(-1e300),
            serde_json::json!("+262142-01-01T00:00:00Z"),
        ] {
            let tx = decode(serde_json::json!({
                "invoice_no": "1", "quantity": 1, "unit_price": 1, "invoice_date": raw
            }))
            .unwrap();
            assert_eq!(tx.event_time, ingest_time(), "value {raw}");
            assert!(tx.event_time_inferred);
        }
    }
}
