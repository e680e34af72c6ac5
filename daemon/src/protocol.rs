use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized RPC access. Invalid RPC username or password";
pub const UNPARSEABLE_MESSAGE: &str = "Could not parse RPC data from daemon response";
pub const NO_COMMANDS_MESSAGE: &str = "No commands passed to daemon";

/// A single daemon call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self { method: method.to_string(), params }
    }

    pub(crate) fn to_body(&self, id: u64) -> Value {
        json!({ "method": self.method, "params": self.params, "id": id })
    }
}

/// Outcome of one call against one endpoint. Failures are carried as data:
/// `error` is set and `result` holds a description of the failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub error: bool,
    pub result: Value,
    pub instance: Option<String>,
    pub data: Option<String>,
}

impl RpcResponse {
    pub fn failure(instance: Option<&str>, message: &str, data: Option<String>) -> Self {
        Self { error: true, result: Value::String(message.to_string()), instance: instance.map(str::to_string), data }
    }

    pub fn no_commands() -> Self {
        Self::failure(None, NO_COMMANDS_MESSAGE, None)
    }

    /// Interprets one decoded JSON-RPC reply object. A non-null `error` member
    /// marks the response as failed and becomes its result.
    pub(crate) fn from_reply(instance: &str, reply: &Value, data: String) -> Self {
        let error = reply.get("error").filter(|e| !e.is_null());
        match error {
            Some(error) => Self { error: true, result: error.clone(), instance: Some(instance.to_string()), data: Some(data) },
            None => Self {
                error: false,
                result: reply.get("result").cloned().unwrap_or(Value::Null),
                instance: Some(instance.to_string()),
                data: Some(data),
            },
        }
    }
}

/// Reply of one endpoint to a command set: a single response for a single
/// request (or for a transport failure), one response per request for a batch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RpcReply {
    Single(RpcResponse),
    Batch(Vec<RpcResponse>),
}

impl RpcReply {
    /// Only single replies can fail as a whole; a decoded batch reached the endpoint.
    pub fn is_error(&self) -> bool {
        match self {
            RpcReply::Single(response) => response.error,
            RpcReply::Batch(_) => false,
        }
    }

    pub fn responses(&self) -> &[RpcResponse] {
        match self {
            RpcReply::Single(response) => std::slice::from_ref(response),
            RpcReply::Batch(responses) => responses,
        }
    }

    pub fn into_single(self) -> Option<RpcResponse> {
        match self {
            RpcReply::Single(response) => Some(response),
            RpcReply::Batch(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_interpretation() {
        let ok = RpcResponse::from_reply("127.0.0.1", &json!({"error": null, "result": {"height": 1}}), "raw".into());
        assert!(!ok.error);
        assert_eq!(ok.result, json!({"height": 1}));
        assert_eq!(ok.instance.as_deref(), Some("127.0.0.1"));

        let failed = RpcResponse::from_reply("127.0.0.1", &json!({"error": {"code": -8}, "result": null}), "raw".into());
        assert!(failed.error);
        assert_eq!(failed.result, json!({"code": -8}));
    }

    #[test]
    fn test_no_commands_shape() {
        let value = serde_json::to_value(RpcResponse::no_commands()).unwrap();
        assert_eq!(value, json!({"error": true, "result": "No commands passed to daemon", "instance": null, "data": null}));
    }

    #[test]
    fn test_request_body() {
        let body = RpcRequest::new("getblocktemplate", vec![json!({"rules": ["segwit"]})]).to_body(7);
        assert_eq!(body["method"], "getblocktemplate");
        assert_eq!(body["id"], 7);
        assert_eq!(body["params"][0]["rules"][0], "segwit");
    }
}
