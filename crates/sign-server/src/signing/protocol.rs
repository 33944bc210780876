//! JSON messages exchanged with the remote signing endpoint.
//!
//! ```text
//! remote → client   {"_method":"open", ...}                               handshake
//! client → remote   {"_id":"7","_method":"cus-sec_SpcSignDataAsPEM",
//!                    "args":{"inData":"...","passwd":"..."}}
//! remote → client   {"_id":7,"_status":"00","_args":{"Result":true,
//!                    "Data":["<signature>","<cert no>"],"Error":[]}}       nested
//!                or {"Result":true,"Data":[...],"Error":[]}                flat
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::backend::{Result, SigningError, SigningRequest};

pub const HANDSHAKE_METHOD: &str = "open";
pub const SIGN_METHOD: &str = "cus-sec_SpcSignDataAsPEM";
pub const SUCCESS_STATUS: &str = "00";

#[derive(Debug, Serialize)]
struct SignRequestMessage<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_method")]
    method: &'static str,
    args: SignArgs<'a>,
}

#[derive(Debug, Serialize)]
struct SignArgs<'a> {
    #[serde(rename = "inData")]
    in_data: &'a str,
    passwd: &'a str,
}

#[derive(Debug, Deserialize)]
struct HandshakeMessage {
    #[serde(rename = "_method")]
    method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Outcome {
    #[serde(rename = "Result", default)]
    result: Value,
    #[serde(rename = "Data", default)]
    data: Value,
    #[serde(rename = "Error", default)]
    errors: Value,
}

/// What the remote produced for one sign request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignReply {
    /// Echoed `_id`, when the response carried one.
    pub id: Option<String>,
    pub signature: String,
    /// `None` when the remote returned a signature only.
    pub certificate_number: Option<String>,
}

pub fn encode_sign_request(id: &str, request: &SigningRequest) -> Result<String> {
    let message = SignRequestMessage {
        id,
        method: SIGN_METHOD,
        args: SignArgs {
            in_data: request.payload(),
            passwd: request.secret(),
        },
    };
    serde_json::to_string(&message)
        .map_err(|e| SigningError::Protocol(format!("serializing sign request: {e}")))
}

/// Accepts the first inbound message only if it announces `"_method": "open"`.
pub fn check_handshake(text: &str) -> Result<()> {
    let message: HandshakeMessage = serde_json::from_str(text)
        .map_err(|e| SigningError::Handshake(format!("handshake is not valid JSON: {e}")))?;

    match message.method.as_deref() {
        Some(HANDSHAKE_METHOD) => Ok(()),
        other => Err(SigningError::Handshake(format!(
            "unexpected handshake method {other:?}"
        ))),
    }
}

/// Interprets a sign response in either the nested or the flat shape.
pub fn parse_sign_response(text: &str) -> Result<SignReply> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SigningError::Protocol(format!("response is not valid JSON: {e}")))?;
    let Value::Object(top) = value else {
        return Err(SigningError::Protocol("response is not a JSON object".into()));
    };

    let id = top.get("_id").and_then(id_string);

    let outcome = if let Some(args) = top.get("_args") {
        let outcome = outcome_from(args)?;
        check_status(&top, &outcome)?;
        outcome
    } else if top.contains_key("Result") {
        outcome_from(&Value::Object(top))?
    } else {
        return Err(SigningError::Protocol("unrecognized response format".into()));
    };

    if !is_truthy(&outcome.result) {
        return Err(SigningError::Rejected {
            errors: strings(&outcome.errors),
        });
    }

    let mut data = strings(&outcome.data).into_iter();
    let Some(signature) = data.next() else {
        return Err(SigningError::Protocol("empty result data".into()));
    };

    Ok(SignReply {
        id,
        signature,
        certificate_number: data.next(),
    })
}

fn outcome_from(value: &Value) -> Result<Outcome> {
    match value {
        Value::Object(_) => serde_json::from_value(value.clone())
            .map_err(|e| SigningError::Protocol(format!("malformed result: {e}"))),
        Value::Null => Ok(Outcome::default()),
        _ => Err(SigningError::Protocol("`_args` is not an object".into())),
    }
}

fn check_status(top: &Map<String, Value>, outcome: &Outcome) -> Result<()> {
    let status = match top.get("_status") {
        None => return Ok(()),
        Some(value) if !is_truthy(value) => return Ok(()),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    if status == SUCCESS_STATUS {
        Ok(())
    } else {
        Err(SigningError::Status {
            status,
            errors: strings(&outcome.errors),
        })
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Flattens a JSON array into strings; anything else is treated as empty.
fn strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}
