//! Stratum wire messages: newline-delimited JSON requests, responses and notifications

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const NOT_SUPPORTED: i32 = 20;
pub const JOB_NOT_FOUND: i32 = 21;
pub const DUPLICATE_SHARE: i32 = 22;
pub const LOW_DIFFICULTY_SHARE: i32 = 23;
pub const UNAUTHORIZED_WORKER: i32 = 24;
pub const NOT_SUBSCRIBED: i32 = 25;

/// Stratum method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StratumMethod {
    Subscribe,
    Authorize,
    Configure,
    MultiVersion,
    Submit,
    GetTransactions,
    ExtranonceSubscribe,
    SetDifficulty,
    SetTarget,
    Notify,
    Other(String),
}

impl StratumMethod {
    pub fn as_str(&self) -> &str {
        match self {
            StratumMethod::Subscribe => "mining.subscribe",
            StratumMethod::Authorize => "mining.authorize",
            StratumMethod::Configure => "mining.configure",
            StratumMethod::MultiVersion => "mining.multi_version",
            StratumMethod::Submit => "mining.submit",
            StratumMethod::GetTransactions => "mining.get_transactions",
            StratumMethod::ExtranonceSubscribe => "mining.extranonce.subscribe",
            StratumMethod::SetDifficulty => "mining.set_difficulty",
            StratumMethod::SetTarget => "mining.set_target",
            StratumMethod::Notify => "mining.notify",
            StratumMethod::Other(s) => s,
        }
    }
}

impl From<&str> for StratumMethod {
    fn from(s: &str) -> Self {
        match s {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.authorize" => StratumMethod::Authorize,
            "mining.configure" => StratumMethod::Configure,
            "mining.multi_version" => StratumMethod::MultiVersion,
            "mining.submit" => StratumMethod::Submit,
            "mining.get_transactions" => StratumMethod::GetTransactions,
            "mining.extranonce.subscribe" => StratumMethod::ExtranonceSubscribe,
            "mining.set_difficulty" => StratumMethod::SetDifficulty,
            "mining.set_target" => StratumMethod::SetTarget,
            "mining.notify" => StratumMethod::Notify,
            other => StratumMethod::Other(other.to_string()),
        }
    }
}

/// Stratum request message. Any non-null JSON value is accepted; missing members
/// read as a null id, an empty method and no params.
#[derive(Debug, Clone, PartialEq)]
pub struct StratumRequest {
    pub id: Value,
    pub method: StratumMethod,
    pub params: Vec<Value>,
    pub raw: Value,
}

impl StratumRequest {
    pub fn from_value(raw: Value) -> Self {
        let id = raw.get("id").cloned().unwrap_or(Value::Null);
        let method = StratumMethod::from(raw.get("method").and_then(Value::as_str).unwrap_or_default());
        let params = match raw.get("params") {
            Some(Value::Array(params)) => params.clone(),
            _ => vec![],
        };
        Self { id, method, params, raw }
    }

    pub fn param_str(&self, index: usize) -> String {
        match self.params.get(index) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Parse one framed line into a request. A bare `null` carries no members to
/// read and is rejected like unparseable input.
pub fn parse_message(line: &[u8]) -> Result<StratumRequest, serde_json::Error> {
    match serde_json::from_slice::<Value>(line)? {
        Value::Null => Err(serde::de::Error::custom("message is null")),
        raw => Ok(StratumRequest::from_value(raw)),
    }
}

/// Stratum error triple, serialized as `[code, "message", data]`
#[derive(Debug, Clone, PartialEq)]
pub struct StratumFault {
    pub code: i32,
    pub message: String,
    pub data: Value,
}

impl StratumFault {
    pub fn new(code: i32, message: &str) -> Self {
        Self { code, message: message.to_string(), data: Value::Null }
    }

    pub fn not_supported() -> Self {
        Self::new(NOT_SUPPORTED, "Not supported.")
    }

    pub fn unauthorized_worker() -> Self {
        Self::new(UNAUTHORIZED_WORKER, "unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(NOT_SUBSCRIBED, "not subscribed")
    }

    pub fn to_value(&self) -> Value {
        json!([self.code, self.message, self.data])
    }
}

impl Serialize for StratumFault {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.code, &self.message, &self.data).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StratumFault {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (code, message, data) = <(i32, String, Value)>::deserialize(deserializer)?;
        Ok(Self { code, message, data })
    }
}

/// Stratum response message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<StratumFault>,
}

/// Server-initiated message, always carrying a null id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumNotification {
    pub id: Option<u64>,
    pub method: String,
    pub params: Vec<Value>,
}

/// Create a success response
pub fn create_success_response(id: Value, result: Value) -> StratumResponse {
    StratumResponse { id, result, error: None }
}

/// Create an error response
pub fn create_error_response(id: Value, result: Value, error: StratumFault) -> StratumResponse {
    StratumResponse { id, result, error: Some(error) }
}

/// Create a notification message
pub fn create_notification(method: StratumMethod, params: Vec<Value>) -> StratumNotification {
    StratumNotification { id: None, method: method.as_str().to_string(), params }
}
