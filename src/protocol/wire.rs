//! Wire format
//!
//! Newline-delimited JSON, one message per line, UTF-8:
//!
//! ```text
//! Greeting: {"name":"<product>","service":"<svc>","version":"<ver>"}
//! Command:  {"cmd":"<name>","param":[<v1>,<v2>,...]}
//! Result:   {}  or  {"out":<value>}
//! Error:    {"err":<int>,"out":"<message>","errStack":"<trace>"}
//! ```
//!
//! Writers flush after every line because the peer blocks waiting for it.

use crate::error::{ProtocolError, Result};
use crate::protocol::command::ProtocolCommand;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;

/// Message used when an error reply carries no `out`
pub const NO_DETAILS: &str = "no details available";

/// Stack used when an error reply carries no `errStack`
pub const NO_STACK_TRACE: &str = "no stack trace available";

/// First line sent by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
    pub service: String,
    pub version: String,
}

impl Greeting {
    pub fn new(name: impl Into<String>, service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            version: version.into(),
        }
    }
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `{}` or `{"out":...}`
    Output(Option<Value>),
    /// `{"err":...}`; `message` and `stack` are `None` when the peer omitted them
    Error {
        code: i32,
        message: Option<String>,
        stack: Option<String>,
    },
}

#[derive(Serialize)]
struct OutputReply<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    out: Option<&'a Value>,
}

#[derive(Serialize)]
struct ErrorReply<'a> {
    err: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    out: Option<&'a str>,
    #[serde(rename = "errStack", skip_serializing_if = "Option::is_none")]
    err_stack: Option<&'a str>,
}

/// Serialize any message to a single line (no trailing newline)
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Format {
        line: String::new(),
        reason: e.to_string(),
    })
}

pub fn encode_output(out: Option<&Value>) -> Result<String> {
    encode(&OutputReply { out })
}

pub fn encode_error(code: i32, message: &str, stack: Option<&str>) -> Result<String> {
    encode(&ErrorReply {
        err: code,
        out: Some(message),
        err_stack: stack,
    })
}

/// Parse a line that must be a JSON object
pub fn decode_object(line: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(line.trim_end_matches(['\r', '\n'])) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtocolError::Format {
            line: line.to_string(),
            reason: "expected a JSON object".to_string(),
        }),
        Err(e) => Err(ProtocolError::Format {
            line: line.to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn decode_command(line: &str) -> Result<ProtocolCommand> {
    let object = decode_object(line)?;
    match object.get("cmd") {
        Some(Value::String(_)) => {}
        _ => {
            return Err(ProtocolError::Format {
                line: line.to_string(),
                reason: "command key 'cmd' must be a string".to_string(),
            })
        }
    }
    if let Some(param) = object.get("param") {
        if !param.is_array() {
            return Err(ProtocolError::Format {
                line: line.to_string(),
                reason: "command key 'param' must be an array".to_string(),
            });
        }
    }

    serde_json::from_value(Value::Object(object)).map_err(|e| ProtocolError::Format {
        line: line.to_string(),
        reason: e.to_string(),
    })
}

pub fn decode_response(line: &str) -> Result<Response> {
    let mut object = decode_object(line)?;

    let Some(err) = object.remove("err") else {
        return Ok(Response::Output(object.remove("out")));
    };

    let code = err
        .as_i64()
        .and_then(|code| i32::try_from(code).ok())
        .ok_or_else(|| ProtocolError::Format {
            line: line.to_string(),
            reason: "error key 'err' must be an integer".to_string(),
        })?;

    let message = match object.remove("out") {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message),
        Some(other) => Some(other.to_string()),
    };

    let stack = match object.remove("errStack") {
        None | Some(Value::Null) => None,
        Some(Value::String(stack)) => Some(stack),
        Some(other) => Some(other.to_string()),
    };

    Ok(Response::Error {
        code,
        message,
        stack,
    })
}

/// Write one line and flush
pub fn write_line<W: Write + ?Sized>(writer: &mut W, line: &str) -> std::io::Result<()> {
    let mut buffer = Vec::with_capacity(line.len() + 1);
    buffer.extend_from_slice(line.as_bytes());
    buffer.push(b'\n');
    writer.write_all(&buffer)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_greeting_key_order() {
        let greeting = Greeting::new("pgVault", "test", "1.0.0");
        assert_eq!(
            encode(&greeting).unwrap(),
            r#"{"name":"pgVault","service":"test","version":"1.0.0"}"#
        );
    }

    #[test]
    fn test_encode_output() {
        assert_eq!(encode_output(None).unwrap(), "{}");
        assert_eq!(encode_output(Some(&json!(true))).unwrap(), r#"{"out":true}"#);
        assert_eq!(
            encode_output(Some(&json!(["value1", "value2"]))).unwrap(),
            r#"{"out":["value1","value2"]}"#
        );
    }

    #[test]
    fn test_encode_error() {
        assert_eq!(
            encode_error(25, "sample error message", Some("stack data")).unwrap(),
            r#"{"err":25,"out":"sample error message","errStack":"stack data"}"#
        );
        assert_eq!(
            encode_error(39, "invalid command 'bogus'", None).unwrap(),
            r#"{"err":39,"out":"invalid command 'bogus'"}"#
        );
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response("{}").unwrap(), Response::Output(None));
        assert_eq!(
            decode_response(r#"{"out":[1,"two",null,false]}"#).unwrap(),
            Response::Output(Some(json!([1, "two", null, false])))
        );
        assert_eq!(
            decode_response(r#"{"err":39,"out":"very serious error"}"#).unwrap(),
            Response::Error {
                code: 39,
                message: Some("very serious error".to_string()),
                stack: None,
            }
        );
        assert_eq!(
            decode_response(r#"{"err":255}"#).unwrap(),
            Response::Error {
                code: 255,
                message: None,
                stack: None,
            }
        );
    }

    #[test]
    fn test_decode_response_bad_shapes() {
        assert!(matches!(
            decode_response("bogus greeting"),
            Err(ProtocolError::Format { .. })
        ));
        assert!(matches!(
            decode_response("[1,2]"),
            Err(ProtocolError::Format { .. })
        ));
        assert!(matches!(
            decode_response(r#"{"err":"x"}"#),
            Err(ProtocolError::Format { .. })
        ));
    }

    #[test]
    fn test_decode_command() {
        let command = decode_command(r#"{"cmd":"command1","param":["param1",2,true,null]}"#).unwrap();
        assert_eq!(command.name(), "command1");
        assert_eq!(command.params(), &[json!("param1"), json!(2), json!(true), Value::Null]);

        let command = decode_command(r#"{"cmd":"noop"}"#).unwrap();
        assert_eq!(command.name(), "noop");
        assert!(command.params().is_empty());

        assert!(decode_command(r#"{"cmd":1}"#).is_err());
        assert!(decode_command(r#"{"param":[]}"#).is_err());
        assert!(decode_command(r#"{"cmd":"x","param":"y"}"#).is_err());
    }

    #[test]
    fn test_write_line_flushes_single_line() {
        let mut buffer = Vec::new();
        write_line(&mut buffer, r#"{"cmd":"noop"}"#).unwrap();
        assert_eq!(buffer, b"{\"cmd\":\"noop\"}\n");
    }
}
