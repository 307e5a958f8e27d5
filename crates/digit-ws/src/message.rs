//! Broker JSON-RPC message types.
//!
//! Requests are JSON objects keyed by the method name plus a `req_id`.
//! Responses echo `req_id`, name the payload key in `msg_type`, and carry
//! either the payload or an `error` object.

use crate::error::{WsError, WsResult};
use digit_core::money;
use digit_core::{ContractId, ContractKind};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Method
// ============================================================================

/// RPC method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Authorize,
    Ping,
    Proposal,
    Buy,
    ProposalOpenContract,
    Portfolio,
    TicksHistory,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Authorize => "authorize",
            Method::Ping => "ping",
            Method::Proposal => "proposal",
            Method::Buy => "buy",
            Method::ProposalOpenContract => "proposal_open_contract",
            Method::Portfolio => "portfolio",
            Method::TicksHistory => "ticks_history",
            Method::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "authorize" => Method::Authorize,
            "ping" => Method::Ping,
            "proposal" => Method::Proposal,
            "buy" => Method::Buy,
            "proposal_open_contract" => Method::ProposalOpenContract,
            "portfolio" => Method::Portfolio,
            "ticks_history" => Method::TicksHistory,
            other => Method::Other(other.to_string()),
        }
    }

    /// Contract status polling methods.
    #[must_use]
    pub fn is_poll(&self) -> bool {
        matches!(self, Method::ProposalOpenContract | Method::Portfolio)
    }

    /// Methods a session accepts before authorization completes.
    #[must_use]
    pub fn allowed_unauthorized(&self) -> bool {
        matches!(self, Method::Authorize | Method::Ping)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Broker-signalled error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Broker-side throttling. Handled as a transport-class failure.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        self.code.eq_ignore_ascii_case("RateLimit")
            || self.message.to_ascii_lowercase().contains("rate limit")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// `Ok(payload)` or the broker's `Err{code, message}`.
pub type ApiResult<T> = Result<T, ApiError>;

/// One response frame.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Echoed correlation id (absent on subscription pushes).
    pub req_id: Option<String>,
    /// Payload key, e.g. `proposal`.
    pub msg_type: String,
    /// Broker error, if any.
    pub error: Option<ApiError>,
    /// Full frame.
    pub body: Value,
}

impl ApiResponse {
    /// Interpret a decoded frame.
    pub fn from_value(body: Value) -> WsResult<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| WsError::ParseError("frame is not a JSON object".to_string()))?;

        let req_id = match obj.get("req_id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let msg_type = obj
            .get("msg_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let error = match obj.get("error") {
            Some(e) if !e.is_null() => Some(serde_json::from_value::<ApiError>(e.clone())?),
            _ => None,
        };

        Ok(Self {
            req_id,
            msg_type,
            error,
            body,
        })
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Payload under the `msg_type` key, or the embedded error.
    pub fn payload(&self) -> ApiResult<&Value> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        Ok(self.body.get(&self.msg_type).unwrap_or(&Value::Null))
    }

    /// Decode the payload into `T`. The outer result reports malformed
    /// frames, the inner one broker errors.
    pub fn parse<T: DeserializeOwned>(&self) -> WsResult<ApiResult<T>> {
        match self.payload() {
            Ok(payload) => Ok(Ok(T::deserialize(payload).map_err(|e| {
                WsError::ParseError(format!("{} payload: {e}", self.msg_type))
            })?)),
            Err(error) => Ok(Err(error)),
        }
    }
}

/// `proposal` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalQuote {
    pub id: String,
    #[serde(with = "money::float")]
    pub ask_price: Decimal,
    #[serde(with = "money::float")]
    pub payout: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longcode: Option<String>,
}

/// `buy` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BuyReceipt {
    pub contract_id: ContractId,
    #[serde(with = "money::float")]
    pub buy_price: Decimal,
    #[serde(default)]
    pub longcode: Option<String>,
    #[serde(default, deserialize_with = "money::string_or_number_opt")]
    pub transaction_id: Option<String>,
}

/// `proposal_open_contract` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenContractState {
    #[serde(default)]
    pub contract_id: Option<ContractId>,
    #[serde(default)]
    pub contract_type: Option<ContractKind>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_sold: bool,
    #[serde(default, with = "money::float_opt")]
    pub profit: Option<Decimal>,
    #[serde(default, with = "money::float_opt")]
    pub buy_price: Option<Decimal>,
    #[serde(default, with = "money::float_opt")]
    pub sell_price: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
}

/// One entry of the `portfolio.contracts` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PortfolioContract {
    pub contract_id: ContractId,
    pub contract_type: ContractKind,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_sold: bool,
    #[serde(default, with = "money::float_opt")]
    pub buy_price: Option<Decimal>,
    #[serde(default)]
    pub symbol: Option<String>,
}

/// `portfolio` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Portfolio {
    #[serde(default)]
    pub contracts: Vec<PortfolioContract>,
}

/// `history` payload of `ticks_history`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickHistory {
    #[serde(default)]
    pub prices: Vec<Decimal>,
    #[serde(default)]
    pub times: Vec<i64>,
}

/// The broker sends `is_sold` as `0`/`1`; fixtures use booleans.
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected bool or 0/1, got {other}"
        ))),
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Serialise a request with its correlation id.
///
/// `params` must be a JSON object; the method key is added when missing.
pub fn envelope(params: Value, method: &Method, req_id: &str) -> WsResult<String> {
    let Value::Object(mut obj) = params else {
        return Err(WsError::ParseError(format!(
            "{method} params must be a JSON object"
        )));
    };
    if !obj.contains_key(method.as_str()) {
        obj.insert(method.as_str().to_string(), Value::from(1));
    }
    obj.insert("req_id".to_string(), Value::from(req_id));
    Ok(serde_json::to_string(&Value::Object(obj))?)
}

/// Request builders for the methods the fabric uses.
pub mod requests {
    use super::*;
    use digit_core::ContractParams;

    pub fn authorize(token: &str) -> Value {
        serde_json::json!({ "authorize": token })
    }

    pub fn ping() -> Value {
        serde_json::json!({ "ping": 1 })
    }

    pub fn proposal(params: &ContractParams) -> WsResult<Value> {
        let mut obj = Map::new();
        obj.insert("proposal".to_string(), Value::from(1));
        if let Value::Object(fields) = serde_json::to_value(params)? {
            obj.extend(fields);
        }
        Ok(Value::Object(obj))
    }

    /// Buy a previously quoted proposal at its ask price.
    pub fn buy_proposal(proposal_id: &str, price: Decimal) -> Value {
        serde_json::json!({ "buy": proposal_id, "price": number(price) })
    }

    /// Buy without a proposal round-trip, pricing from `params`.
    pub fn buy_direct(params: &ContractParams) -> WsResult<Value> {
        Ok(serde_json::json!({
            "buy": 1,
            "price": number(params.amount),
            "parameters": serde_json::to_value(params)?,
        }))
    }

    pub fn open_contract(contract_id: &ContractId) -> Value {
        serde_json::json!({
            "proposal_open_contract": 1,
            "contract_id": contract_id.to_wire(),
        })
    }

    pub fn portfolio() -> Value {
        serde_json::json!({ "portfolio": 1 })
    }

    pub fn ticks_history(symbol: &str, count: u32) -> Value {
        serde_json::json!({
            "ticks_history": symbol,
            "count": count,
            "end": "latest",
            "style": "ticks",
        })
    }

    fn number(value: Decimal) -> Value {
        value
            .normalize()
            .to_string()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
