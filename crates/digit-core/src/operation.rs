//! Settled trade records.

use crate::money;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome label stored with each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationResult {
    Win,
    Loss,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Win => write!(f, "WIN"),
            Self::Loss => write!(f, "LOSS"),
        }
    }
}

/// Settled trade record surfaced to the persistence collaborator.
///
/// Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub bot_name: String,
    #[serde(with = "money::float")]
    pub profit: Decimal,
    #[serde(with = "money::float")]
    pub profit_percentage: Decimal,
    #[serde(with = "money::float")]
    pub stake: Decimal,
    pub timestamp: DateTime<Utc>,
    pub operation_result: OperationResult,
}

impl Operation {
    /// Build the record for a settled contract. A zero profit counts as a loss.
    pub fn from_settlement(
        bot_name: impl Into<String>,
        stake: Decimal,
        profit: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let profit_percentage = if stake.is_zero() {
            Decimal::ZERO
        } else {
            (profit / stake * Decimal::ONE_HUNDRED).round_dp(2)
        };
        let operation_result = if profit > Decimal::ZERO {
            OperationResult::Win
        } else {
            OperationResult::Loss
        };

        Self {
            bot_name: bot_name.into(),
            profit,
            profit_percentage,
            stake,
            timestamp,
            operation_result,
        }
    }

    #[inline]
    pub fn is_win(&self) -> bool {
        self.operation_result == OperationResult::Win
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_win_record() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let op = Operation::from_settlement("diff_bot", dec!(1.0), dec!(0.95), ts);
        assert!(op.is_win());
        assert_eq!(op.profit_percentage, dec!(95));

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["operation_result"], "WIN");
        assert_eq!(value["profit"], serde_json::json!(0.95));
        assert_eq!(value["stake"], serde_json::json!(1.0));
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_loss_record() {
        let op = Operation::from_settlement("diff_bot", dec!(2), dec!(-2), Utc::now());
        assert_eq!(op.operation_result, OperationResult::Loss);
        assert_eq!(op.profit_percentage, dec!(-100));

        let zero = Operation::from_settlement("diff_bot", dec!(2), Decimal::ZERO, Utc::now());
        assert_eq!(zero.operation_result, OperationResult::Loss);
    }

    #[test]
    fn test_zero_stake_has_zero_percentage() {
        let op = Operation::from_settlement("b", Decimal::ZERO, dec!(1), Utc::now());
        assert_eq!(op.profit_percentage, Decimal::ZERO);
    }
}
