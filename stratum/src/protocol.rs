//! Stratum protocol message types and parsing

use crate::error::{StratumError, StratumResult};
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{self, DeserializeOwned, IgnoredAny, SeqAccess, Visitor},
};
use serde_json::{Value, json};
use std::fmt;

/// Methods spoken between the pool and its miners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StratumMethod {
    // miner -> pool
    Subscribe,
    Authorize,
    Submit,
    SuggestDifficulty,
    GetOprHash,
    // pool -> miner
    GetVersion,
    ShowMessage,
    Reconnect,
    SetNonce,
    SetTarget,
    Other(String),
}

impl StratumMethod {
    pub fn as_str(&self) -> &str {
        match self {
            StratumMethod::Subscribe => "mining.subscribe",
            StratumMethod::Authorize => "mining.authorize",
            StratumMethod::Submit => "mining.submit",
            StratumMethod::SuggestDifficulty => "mining.suggest_difficulty",
            // the misspelling is what deployed miners send
            StratumMethod::GetOprHash => "mining.get_oprhash",
            StratumMethod::GetVersion => "client.get_version",
            StratumMethod::ShowMessage => "client.show_message",
            StratumMethod::Reconnect => "client.reconnect",
            StratumMethod::SetNonce => "mining.set_nonce",
            StratumMethod::SetTarget => "mining.set_target",
            StratumMethod::Other(method) => method,
        }
    }
}

impl From<&str> for StratumMethod {
    fn from(method: &str) -> Self {
        match method {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.authorize" => StratumMethod::Authorize,
            "mining.submit" => StratumMethod::Submit,
            "mining.suggest_difficulty" => StratumMethod::SuggestDifficulty,
            "mining.get_oprhash" => StratumMethod::GetOprHash,
            "client.get_version" => StratumMethod::GetVersion,
            "client.show_message" => StratumMethod::ShowMessage,
            "client.reconnect" => StratumMethod::Reconnect,
            "mining.set_nonce" => StratumMethod::SetNonce,
            "mining.set_target" => StratumMethod::SetTarget,
            other => StratumMethod::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StratumMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque request id, echoed back in the response. Ids we issue ourselves are
/// always numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl RequestId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(id) => Some(*id),
            RequestId::Text(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::Text(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{}", id),
            RequestId::Text(id) => write!(f, "{:?}", id),
        }
    }
}

/// Stratum request message. A request without an id is a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default = "empty_params", deserialize_with = "params_or_empty")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Array(vec![])
}

fn params_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.unwrap_or_else(empty_params))
}

impl Request {
    pub fn new(id: Option<RequestId>, method: StratumMethod, params: Vec<Value>) -> Self {
        Self { id, method: method.as_str().to_string(), params: Value::Array(params) }
    }

    pub fn subscribe(id: u64) -> Self {
        Self::new(Some(id.into()), StratumMethod::Subscribe, vec![])
    }

    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Self::new(Some(id.into()), StratumMethod::Authorize, vec![json!(username), json!(password)])
    }

    pub fn submit(id: u64, username: &str, job_id: &str, nonce: &str, opr_hash: &str) -> Self {
        Self::new(Some(id.into()), StratumMethod::Submit, vec![json!(username), json!(job_id), json!(nonce), json!(opr_hash)])
    }

    pub fn suggest_difficulty(id: u64, preferred_difficulty: &str) -> Self {
        Self::new(Some(id.into()), StratumMethod::SuggestDifficulty, vec![json!(preferred_difficulty)])
    }

    pub fn get_opr_hash(id: u64, job_id: &str) -> Self {
        Self::new(Some(id.into()), StratumMethod::GetOprHash, vec![json!(job_id)])
    }

    pub fn get_version(id: u64) -> Self {
        Self::new(Some(id.into()), StratumMethod::GetVersion, vec![])
    }

    pub fn show_message(id: u64, message: &str) -> Self {
        Self::new(Some(id.into()), StratumMethod::ShowMessage, vec![json!(message)])
    }

    pub fn reconnect(id: u64, hostname: &str, port: &str, wait: &str) -> Self {
        Self::new(Some(id.into()), StratumMethod::Reconnect, vec![json!(hostname), json!(port), json!(wait)])
    }

    pub fn set_nonce(nonce: &str) -> Self {
        Self::new(None, StratumMethod::SetNonce, vec![json!(nonce)])
    }

    pub fn set_target(target: &str) -> Self {
        Self::new(None, StratumMethod::SetTarget, vec![json!(target)])
    }

    pub fn method(&self) -> StratumMethod {
        StratumMethod::from(self.method.as_str())
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Reinterprets the params as `T`.
    pub fn fit_params<T: DeserializeOwned>(&self) -> StratumResult<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|err| StratumError::Protocol(format!("invalid params for {}: {}", self.method, err)))
    }
}

/// Stratum response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<RequestId>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

/// Stratum error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(RpcError { code, message: message.into(), data: None }) }
    }

    pub fn from_error(id: Option<RequestId>, err: &StratumError) -> Self {
        Self::error(id, err.code(), err.to_string())
    }

    pub fn version(id: Option<RequestId>, version: &str) -> Self {
        Self::success(id, json!(version))
    }

    /// No error and a result that is neither null nor `false`.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !matches!(self.result, None | Some(Value::Null) | Some(Value::Bool(false)))
    }

    pub fn fit_result<T: DeserializeOwned>(&self) -> StratumResult<T> {
        serde_json::from_value(self.result.clone().unwrap_or(Value::Null))
            .map_err(|err| StratumError::Protocol(format!("invalid result for response {:?}: {}", self.id, err)))
    }
}

/// Any line a peer may send, before it is known to be a request or a response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl RawMessage {
    pub fn decode(line: &str) -> StratumResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// A message carrying a method is a request.
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn into_message(self) -> Message {
        match self.method {
            Some(method) => Message::Request(Request { id: self.id, method, params: self.params.unwrap_or_else(empty_params) }),
            None => Message::Response(Response { id: self.id, result: self.result, error: self.error }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn decode(line: &str) -> StratumResult<Self> {
        let raw = RawMessage::decode(line)?;
        if raw.method.is_none() && raw.id.is_none() && raw.result.is_none() && raw.error.is_none() {
            return Err(StratumError::Protocol(format!("neither a request nor a response: {}", line)));
        }
        Ok(raw.into_message())
    }

    pub fn request(&self) -> Option<&Request> {
        match self {
            Message::Request(request) => Some(request),
            Message::Response(_) => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Message::Response(response) => Some(response),
            Message::Request(_) => None,
        }
    }
}

/// Serializes `message` as one newline-terminated line.
pub fn encode<T: Serialize>(message: &T) -> StratumResult<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Params of a method that takes none: `[]` or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoParams;

impl<'de> Deserialize<'de> for NoParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NoParamsVisitor;

        impl<'de> Visitor<'de> for NoParamsVisitor {
            type Value = NoParams;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an empty params array")
            }

            fn visit_unit<E: de::Error>(self) -> Result<NoParams, E> {
                Ok(NoParams)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<NoParams, A::Error> {
                match seq.next_element::<IgnoredAny>()? {
                    None => Ok(NoParams),
                    Some(_) => Err(de::Error::invalid_length(1, &self)),
                }
            }
        }

        deserializer.deserialize_any(NoParamsVisitor)
    }
}

/// `mining.authorize` params: `[username, password]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String)")]
pub struct AuthorizeParams {
    pub username: String,
    pub password: String,
}

impl From<(String, String)> for AuthorizeParams {
    fn from((username, password): (String, String)) -> Self {
        Self { username, password }
    }
}

/// `mining.submit` params: `[username, job_id, nonce, opr_hash]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String, String, String)")]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub nonce: String,
    pub opr_hash: String,
}

impl From<(String, String, String, String)> for SubmitParams {
    fn from((username, job_id, nonce, opr_hash): (String, String, String, String)) -> Self {
        Self { username, job_id, nonce, opr_hash }
    }
}

/// `mining.suggest_difficulty` params: `[difficulty]`, as a string or a number
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(Value,)")]
pub struct SuggestDifficultyParams {
    pub preferred_difficulty: String,
}

impl From<(Value,)> for SuggestDifficultyParams {
    fn from((value,): (Value,)) -> Self {
        let preferred_difficulty = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Self { preferred_difficulty }
    }
}

/// `mining.get_oprhash` params: `[job_id]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String,)")]
pub struct GetOprHashParams {
    pub job_id: String,
}

impl From<(String,)> for GetOprHashParams {
    fn from((job_id,): (String,)) -> Self {
        Self { job_id }
    }
}

/// `client.show_message` params: `[message]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String,)")]
pub struct ShowMessageParams {
    pub message: String,
}

impl From<(String,)> for ShowMessageParams {
    fn from((message,): (String,)) -> Self {
        Self { message }
    }
}

/// `client.reconnect` params: `[hostname, port, wait]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String, String)")]
pub struct ReconnectParams {
    pub hostname: String,
    pub port: String,
    pub wait: String,
}

impl From<(String, String, String)> for ReconnectParams {
    fn from((hostname, port, wait): (String, String, String)) -> Self {
        Self { hostname, port, wait }
    }
}

/// `mining.set_nonce` and `mining.set_target` params: `[hex]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String,)")]
pub struct HexParams {
    pub hex: String,
}

impl From<(String,)> for HexParams {
    fn from((hex,): (String,)) -> Self {
        Self { hex }
    }
}

impl HexParams {
    /// Parses the hex string, which carries no `0x` prefix on the wire.
    pub fn to_u64(&self) -> StratumResult<u64> {
        u64::from_str_radix(self.hex.strip_prefix("0x").unwrap_or(&self.hex), 16)
            .map_err(|err| StratumError::Protocol(format!("invalid hex value {}: {}", self.hex, err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_reconstruction_keeps_envelope() {
        let request = Request::reconnect(7, "pipe", "1234", "3");
        let line = encode(&request).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let decoded = Message::decode(std::str::from_utf8(&line).unwrap().trim_end()).unwrap();
        let Message::Request(decoded) = decoded else { panic!("expected a request") };
        assert_eq!(decoded, request);
        assert_eq!(decoded.method(), StratumMethod::Reconnect);

        let params: ReconnectParams = decoded.fit_params().unwrap();
        assert_eq!(params, ReconnectParams { hostname: "pipe".into(), port: "1234".into(), wait: "3".into() });
    }

    #[test]
    fn test_missing_or_null_params_become_empty() {
        for line in [r#"{"id":1,"method":"client.get_version"}"#, r#"{"id":1,"method":"client.get_version","params":null}"#] {
            let Message::Request(request) = Message::decode(line).unwrap() else { panic!("expected a request") };
            assert_eq!(request.params, json!([]));
            assert_eq!(request.fit_params::<NoParams>().unwrap(), NoParams);
        }
    }

    #[test]
    fn test_fit_params_rejects_wrong_shape() {
        let request = Request { id: Some(RequestId::Number(1)), method: "client.get_version".into(), params: json!(["unexpected"]) };
        assert!(matches!(request.fit_params::<NoParams>(), Err(StratumError::Protocol(_))));

        let request = Request { id: Some(RequestId::Number(2)), method: "mining.authorize".into(), params: json!(["user"]) };
        assert!(matches!(request.fit_params::<AuthorizeParams>(), Err(StratumError::Protocol(_))));

        let request = Request { id: Some(RequestId::Number(3)), method: "mining.set_nonce".into(), params: json!({"nonce": "ab"}) };
        assert!(request.fit_params::<HexParams>().is_err());
    }

    #[test]
    fn test_response_is_recognized_without_method() {
        let message = Message::decode(r#"{"id":4,"result":"0.0.1","error":null}"#).unwrap();
        let Message::Response(response) = message else { panic!("expected a response") };
        assert_eq!(response.id, Some(RequestId::Number(4)));
        assert!(response.is_success());
        assert_eq!(response.fit_result::<String>().unwrap(), "0.0.1");

        let message = Message::decode(r#"{"id":5,"result":null,"error":{"code":24,"message":"unauthorized worker"}}"#).unwrap();
        let Message::Response(response) = message else { panic!("expected a response") };
        assert!(!response.is_success());
        assert_eq!(response.error.unwrap().code, 24);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode("not json"), Err(StratumError::Json(_))));
        assert!(matches!(Message::decode("{}"), Err(StratumError::Protocol(_))));
        // a null result is still a response
        let message = Message::decode(r#"{"id":1,"result":null,"error":null}"#).unwrap();
        assert_eq!(message.response().and_then(|response| response.id.clone()), Some(RequestId::Number(1)));
        assert!(message.request().is_none());
        assert!(Message::decode(r#""work-1""#).is_err());
    }

    #[test]
    fn test_notifications_carry_no_id() {
        let request = Request::set_nonce("ffeabea");
        assert!(request.is_notification());
        let params: HexParams = request.fit_params().unwrap();
        assert_eq!(params.to_u64().unwrap(), 268348394);
    }

    #[test]
    fn test_hex_allows_a_single_prefix() {
        assert_eq!(HexParams { hex: "0x1f".into() }.to_u64().unwrap(), 31);
        assert_eq!(HexParams { hex: "00ff".into() }.to_u64().unwrap(), 255);
        assert!(HexParams { hex: "0x0x1".into() }.to_u64().is_err());
    }

    #[test]
    fn test_string_ids_are_kept() {
        let Message::Request(request) = Message::decode(r#"{"id":"a1","method":"mining.subscribe","params":[]}"#).unwrap() else {
            panic!("expected a request")
        };
        assert_eq!(request.id, Some(RequestId::from("a1")));
        assert!(!request.is_notification());

        let reply = Response::success(request.id.clone(), json!(true));
        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"id": "a1", "result": true, "error": null}));

        let message = Message::decode(r#"{"id":"b2","result":true,"error":null}"#).unwrap();
        let id = message.response().and_then(|response| response.id.clone()).unwrap();
        assert_eq!(id.as_u64(), None);
        assert_eq!(RequestId::from(7u64).as_u64(), Some(7));
    }

    #[test]
    fn test_suggest_difficulty_accepts_numbers() {
        let request = Request { id: Some(RequestId::Number(1)), method: "mining.suggest_difficulty".into(), params: json!([512]) };
        let params: SuggestDifficultyParams = request.fit_params().unwrap();
        assert_eq!(params.preferred_difficulty, "512");
    }

    #[test]
    fn test_unknown_methods_are_preserved() {
        let method = StratumMethod::from("mining.extranonce.subscribe");
        assert_eq!(method, StratumMethod::Other("mining.extranonce.subscribe".to_string()));
        assert_eq!(method.to_string(), "mining.extranonce.subscribe");
        assert_eq!(StratumMethod::from("mining.get_oprhash"), StratumMethod::GetOprHash);
    }
}
