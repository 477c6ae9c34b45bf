//! Protocol command: a name plus an ordered list of scalar parameters

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A command sent from a client to a server
///
/// Serializes as `{"cmd":"<name>","param":[...]}` with `param` omitted when
/// there are no parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCommand {
    #[serde(rename = "cmd")]
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    param: Vec<Value>,
}

impl ProtocolCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param: Vec::new(),
        }
    }

    /// Append a parameter, builder style
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.param.push(value.into());
        self
    }

    /// Append a parameter in place
    pub fn param_add(&mut self, value: impl Into<Value>) -> &mut Self {
        self.param.push(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Value] {
        &self.param
    }

    /// Wire form of the command, without the trailing newline
    pub fn to_json(&self) -> String {
        // A struct of a string and a list of JSON values always serializes
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"cmd":"{}"}}"#, self.name))
    }
}

impl fmt::Display for ProtocolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{command: {}}}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_json() {
        let command = ProtocolCommand::new("command1").param("param1").param("param2");
        assert_eq!(command.to_json(), r#"{"cmd":"command1","param":["param1","param2"]}"#);
        assert_eq!(command.to_string(), "{command: command1}");
    }

    #[test]
    fn test_command_without_params() {
        let command = ProtocolCommand::new("command2");
        assert_eq!(command.to_json(), r#"{"cmd":"command2"}"#);
        assert_eq!(command.to_string(), "{command: command2}");
        assert!(command.params().is_empty());
    }

    #[test]
    fn test_param_add_in_place() {
        let mut command = ProtocolCommand::new("archive-get");
        command.param_add("000000010000000100000001").param_add(true);
        assert_eq!(command.params(), &[json!("000000010000000100000001"), json!(true)]);
    }

    #[test]
    fn test_scalar_types_preserved() {
        let command = ProtocolCommand::new("mixed")
            .param("text")
            .param(42)
            .param(-7)
            .param(false)
            .param(Value::Null);

        let decoded: ProtocolCommand = serde_json::from_str(&command.to_json()).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.params()[1], json!(42));
        assert!(decoded.params()[4].is_null());
    }
}
