//! Strategy signals and the trade intents they carry.

use crate::contract::{ContractKind, ContractParams, LimitOrder};
use crate::error::{CoreError, Result};
use crate::money;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique signal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalId(String);

impl SignalId {
    /// Format: `sig_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("sig_{ts}_{uuid_short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strategy-layer intent to place one trade.
///
/// The payload is opaque to the queue and worker pool; only the handler
/// interprets it. `pattern_detected` marks the signal as high priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub signal_id: SignalId,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pattern_detected: bool,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
}

impl Signal {
    pub fn new(pattern_detected: bool, payload: serde_json::Value) -> Self {
        Self {
            signal_id: SignalId::new(),
            created_at: Utc::now(),
            pattern_detected,
            payload,
            retry_count: 0,
        }
    }

    pub fn high_priority(payload: serde_json::Value) -> Self {
        Self::new(true, payload)
    }

    pub fn low_priority(payload: serde_json::Value) -> Self {
        Self::new(false, payload)
    }

    #[inline]
    pub fn is_high_priority(&self) -> bool {
        self.pattern_detected
    }

    /// Copy of this signal for another processing attempt.
    #[must_use]
    pub fn retried(mut self) -> Self {
        self.retry_count += 1;
        self
    }

    /// Age in milliseconds relative to `now`.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds().max(0)
    }
}

/// Trade request decoded from a signal payload.
///
/// Strategies send `{"stake":1.0,"contract_type":"DIGITDIFF","barrier":0,"symbol":"R_100"}`
/// plus optional duration, currency, accumulator fields and `bot_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    pub contract_type: ContractKind,
    pub symbol: String,
    #[serde(with = "money::float")]
    pub stake: Decimal,
    #[serde(
        default,
        deserialize_with = "money::string_or_number_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub barrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_unit: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, with = "money::float_opt", skip_serializing_if = "Option::is_none")]
    pub growth_rate: Option<Decimal>,
    #[serde(default, with = "money::float_opt", skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
}

fn default_bot_name() -> String {
    "digit-bot".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

impl TradeIntent {
    /// Decode and validate a signal payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let intent: Self = serde_json::from_value(payload.clone())
            .map_err(|e| CoreError::InvalidPayload(e.to_string()))?;
        intent.contract_params().validate()?;
        Ok(intent)
    }

    /// Contract parameters for proposal/buy. Digit contracts default to one tick.
    pub fn contract_params(&self) -> ContractParams {
        let accumulator = self.contract_type.is_accumulator();
        let (duration, duration_unit) = if accumulator {
            (None, None)
        } else {
            (
                Some(self.duration.unwrap_or(1)),
                Some(self.duration_unit.clone().unwrap_or_else(|| "t".to_string())),
            )
        };

        ContractParams {
            contract_type: self.contract_type.clone(),
            symbol: self.symbol.clone(),
            amount: self.stake,
            basis: "stake".to_string(),
            currency: self.currency.clone(),
            duration,
            duration_unit,
            barrier: self.barrier.clone(),
            growth_rate: self.growth_rate,
            limit_order: self.take_profit.map(|take_profit| LimitOrder { take_profit }),
        }
    }
}
