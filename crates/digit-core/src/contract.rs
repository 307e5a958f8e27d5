//! Contract specifications and identifiers.
//!
//! `ContractParams` is the single description of "what to trade" that flows
//! from a strategy intent into the proposal and buy requests.

use crate::money;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broker contract type (e.g. `DIGITDIFF`, `ACCU`).
///
/// Open-position quotas are tracked per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractKind(String);

impl ContractKind {
    pub const DIGIT_DIFF: &'static str = "DIGITDIFF";
    pub const DIGIT_MATCH: &'static str = "DIGITMATCH";
    pub const DIGIT_OVER: &'static str = "DIGITOVER";
    pub const DIGIT_UNDER: &'static str = "DIGITUNDER";
    pub const DIGIT_EVEN: &'static str = "DIGITEVEN";
    pub const DIGIT_ODD: &'static str = "DIGITODD";
    pub const ACCUMULATOR: &'static str = "ACCU";

    /// Create a kind, normalising to the broker's upper-case spelling.
    pub fn new(kind: impl AsRef<str>) -> Self {
        Self(kind.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accumulators run until take-profit or barrier breach and carry no duration.
    pub fn is_accumulator(&self) -> bool {
        self.0 == Self::ACCUMULATOR
    }

    /// Digit contracts need a barrier digit, except even/odd.
    pub fn needs_barrier(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::DIGIT_DIFF | Self::DIGIT_MATCH | Self::DIGIT_OVER | Self::DIGIT_UNDER
        )
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContractKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Broker-assigned contract id. The broker sends integers; tests and
/// fixtures sometimes use strings, so both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContractId(String);

impl<'de> Deserialize<'de> for ContractId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        money::string_or_number(deserializer).map(Self)
    }
}

impl ContractId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire form: a number when the id is numeric, otherwise the string.
    pub fn to_wire(&self) -> serde_json::Value {
        match self.0.parse::<u64>() {
            Ok(n) => serde_json::Value::from(n),
            Err(_) => serde_json::Value::from(self.0.clone()),
        }
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accumulator take-profit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    #[serde(with = "money::float")]
    pub take_profit: Decimal,
}

/// Parameters of a contract as sent in `proposal` and `buy.parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractParams {
    pub contract_type: ContractKind,
    pub symbol: String,
    #[serde(with = "money::float")]
    pub amount: Decimal,
    #[serde(default = "default_basis")]
    pub basis: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_unit: Option<String>,
    #[serde(
        default,
        deserialize_with = "money::string_or_number_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub barrier: Option<String>,
    #[serde(default, with = "money::float_opt", skip_serializing_if = "Option::is_none")]
    pub growth_rate: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_order: Option<LimitOrder>,
}

fn default_basis() -> String {
    "stake".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

impl ContractParams {
    /// Digit contract settling after `ticks` ticks.
    pub fn digit(
        kind: impl Into<ContractKind>,
        symbol: impl Into<String>,
        stake: Decimal,
        barrier: Option<u8>,
        ticks: u32,
    ) -> Self {
        Self {
            contract_type: kind.into(),
            symbol: symbol.into(),
            amount: stake,
            basis: default_basis(),
            currency: default_currency(),
            duration: Some(ticks),
            duration_unit: Some("t".to_string()),
            barrier: barrier.map(|b| b.to_string()),
            growth_rate: None,
            limit_order: None,
        }
    }

    /// Accumulator contract with a growth rate and optional take-profit.
    pub fn accumulator(
        symbol: impl Into<String>,
        stake: Decimal,
        growth_rate: Decimal,
        take_profit: Option<Decimal>,
    ) -> Self {
        Self {
            contract_type: ContractKind::new(ContractKind::ACCUMULATOR),
            symbol: symbol.into(),
            amount: stake,
            basis: default_basis(),
            currency: default_currency(),
            duration: None,
            duration_unit: None,
            barrier: None,
            growth_rate: Some(growth_rate),
            limit_order: take_profit.map(|take_profit| LimitOrder { take_profit }),
        }
    }

    /// Check the fields the broker would otherwise reject with an API error.
    pub fn validate(&self) -> crate::Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(crate::CoreError::InvalidContract("empty symbol".to_string()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(crate::CoreError::InvalidContract(format!(
                "stake must be positive, got {}",
                self.amount
            )));
        }
        if self.contract_type.needs_barrier() && self.barrier.is_none() {
            return Err(crate::CoreError::InvalidContract(format!(
                "{} requires a barrier",
                self.contract_type
            )));
        }
        if self.contract_type.is_accumulator() && self.growth_rate.is_none() {
            return Err(crate::CoreError::InvalidContract(
                "accumulator requires growth_rate".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache key over the stable fields, in sorted key order.
    ///
    /// Two parameter sets price identically iff their fingerprints match.
    pub fn fingerprint(&self) -> String {
        let mut fields: BTreeMap<&'static str, String> = BTreeMap::new();
        fields.insert("amount", self.amount.normalize().to_string());
        fields.insert("basis", self.basis.clone());
        fields.insert("contract_type", self.contract_type.to_string());
        fields.insert("currency", self.currency.to_ascii_uppercase());
        fields.insert("symbol", self.symbol.clone());
        if let Some(duration) = self.duration {
            fields.insert("duration", duration.to_string());
        }
        if let Some(unit) = &self.duration_unit {
            fields.insert("duration_unit", unit.clone());
        }
        if let Some(barrier) = &self.barrier {
            fields.insert("barrier", barrier.clone());
        }
        if let Some(rate) = self.growth_rate {
            fields.insert("growth_rate", rate.normalize().to_string());
        }
        if let Some(limit) = &self.limit_order {
            fields.insert("take_profit", limit.take_profit.normalize().to_string());
        }

        fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kind_normalised() {
        let kind = ContractKind::new(" digitdiff ");
        assert_eq!(kind.as_str(), "DIGITDIFF");
        assert!(kind.needs_barrier());
        assert!(!kind.is_accumulator());
        assert!(ContractKind::new("accu").is_accumulator());
    }

    #[test]
    fn test_contract_id_accepts_number_and_string() {
        let a: ContractId = serde_json::from_str("123456").unwrap();
        let b: ContractId = serde_json::from_str("\"C1\"").unwrap();
        assert_eq!(a.as_str(), "123456");
        assert_eq!(a.to_wire(), serde_json::json!(123456));
        assert_eq!(b.to_wire(), serde_json::json!("C1"));
    }

    #[test]
    fn test_fingerprint_ignores_construction_order() {
        let a = ContractParams::digit("DIGITDIFF", "R_100", dec!(1.0), Some(0), 1);
        let mut b = ContractParams::digit("DIGITDIFF", "R_100", dec!(1.00), Some(0), 1);
        b.currency = "usd".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("amount=1|barrier=0|basis=stake"));
    }

    #[test]
    fn test_fingerprint_varies_on_amount_and_symbol() {
        let base = ContractParams::digit("DIGITDIFF", "R_100", dec!(1), Some(0), 1);
        let mut other_amount = base.clone();
        other_amount.amount = dec!(2);
        let mut other_symbol = base.clone();
        other_symbol.symbol = "R_50".to_string();
        let mut other_barrier = base.clone();
        other_barrier.barrier = Some("7".to_string());

        assert_ne!(base.fingerprint(), other_amount.fingerprint());
        assert_ne!(base.fingerprint(), other_symbol.fingerprint());
        assert_ne!(base.fingerprint(), other_barrier.fingerprint());
    }

    #[test]
    fn test_params_serialize_without_absent_fields() {
        let params = ContractParams::accumulator("R_10", dec!(5), dec!(0.03), Some(dec!(2)));
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["contract_type"], "ACCU");
        assert_eq!(value["amount"], serde_json::json!(5.0));
        assert_eq!(value["growth_rate"], serde_json::json!(0.03));
        assert_eq!(value["limit_order"]["take_profit"], serde_json::json!(2.0));
        assert!(value.get("duration").is_none());
        assert!(value.get("barrier").is_none());
    }

    #[test]
    fn test_validate() {
        let ok = ContractParams::digit("DIGITDIFF", "R_100", dec!(1), Some(3), 1);
        assert!(ok.validate().is_ok());

        let mut no_barrier = ok.clone();
        no_barrier.barrier = None;
        assert!(no_barrier.validate().is_err());

        let mut zero_stake = ok.clone();
        zero_stake.amount = Decimal::ZERO;
        assert!(zero_stake.validate().is_err());

        let even = ContractParams::digit("DIGITEVEN", "R_100", dec!(1), None, 1);
        assert!(even.validate().is_ok());
    }
}
