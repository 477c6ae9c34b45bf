use super::Config;
use crate::error::{ErrorKind, ProtocolError};
use crate::protocol::{ProtocolHandler, ServerIo};
use serde_json::Value;

/// Command answered by [`ConfigHandler`]
pub const COMMAND_OPTION: &str = "option";

/// Answers `option` queries from a client
///
/// The params are option names; the output is the list of their values in
/// the same order, with defaults applied and `null` for options that are
/// unset and have no default.
pub struct ConfigHandler {
    config: Config,
}

impl ConfigHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ProtocolHandler for ConfigHandler {
    fn handle(&mut self, command: &str, params: &[Value], server: &mut ServerIo) -> anyhow::Result<bool> {
        if command != COMMAND_OPTION {
            return Ok(false);
        }

        let values = params
            .iter()
            .map(|param| match param {
                Value::String(name) => Ok(self.config.value_or_default(name).map_or(Value::Null, Value::String)),
                other => Err(ProtocolError::raised(
                    ErrorKind::Assert,
                    format!("option name must be a string, got {other}"),
                )),
            })
            .collect::<Result<Vec<Value>, ProtocolError>>()?;

        server.response(Some(Value::Array(values)))?;
        Ok(true)
    }
}
