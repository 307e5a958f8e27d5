//! Serde helpers for broker money fields.
//!
//! The broker speaks JSON numbers for prices and stakes. Internally every
//! amount is a `Decimal`; these helpers write decimals as numbers and accept
//! either numbers or strings on the way in.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serializer};

/// `Decimal` <-> JSON number.
pub mod float {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        // Parsing the decimal text gives the f64 nearest to the exact value.
        let f: f64 = value
            .normalize()
            .to_string()
            .parse()
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_f64(f)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        <Decimal as Deserialize>::deserialize(deserializer)
    }
}

/// `Option<Decimal>` <-> optional JSON number.
pub mod float_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Decimal>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => float::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Decimal>, D::Error> {
        Option::<Decimal>::deserialize(deserializer)
    }
}

/// Accepts `"C1"`, `12345` or `1.5` and keeps the textual form.
pub fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Optional variant of [`string_or_number`]; `null` maps to `None`.
pub fn string_or_number_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Amount {
        #[serde(with = "float")]
        value: Decimal,
        #[serde(default, with = "float_opt", skip_serializing_if = "Option::is_none")]
        limit: Option<Decimal>,
    }

    #[test]
    fn test_decimal_written_as_number() {
        let json = serde_json::to_string(&Amount {
            value: dec!(1.95),
            limit: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"value":1.95}"#);
    }

    #[test]
    fn test_decimal_read_from_number_or_string() {
        let a: Amount = serde_json::from_str(r#"{"value":0.95}"#).unwrap();
        assert_eq!(a.value, dec!(0.95));
        assert!(a.limit.is_none());

        let b: Amount = serde_json::from_str(r#"{"value":"10.5","limit":2}"#).unwrap();
        assert_eq!(b.value, dec!(10.5));
        assert_eq!(b.limit, Some(dec!(2)));
    }

    #[test]
    fn test_amount_survives_json_round_trip() {
        let original = Amount {
            value: dec!(12.345),
            limit: Some(dec!(0.03)),
        };
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, r#"{"value":12.345,"limit":0.03}"#);

        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, dec!(12.345));
        assert_eq!(back.limit, Some(dec!(0.03)));
    }
}
