//! Structured PowerShell commands.
//!
//! A [`PsCommand`] pairs a static script body with named parameters. The
//! parameters travel as base64-encoded JSON and are decoded into `$p` on the
//! host before the body runs, so no caller-supplied value is ever spliced into
//! script text.

use base64::Engine;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A named script plus its parameters.
#[derive(Debug, Clone)]
pub struct PsCommand {
    id: Uuid,
    name: &'static str,
    script: &'static str,
    parameters: Map<String, Value>,
}

impl PsCommand {
    pub fn new(name: &'static str, script: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            script,
            parameters: Map::new(),
        }
    }

    /// Add a parameter, visible to the script as `$p.<key>`.
    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Correlation id used in log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn script(&self) -> &'static str {
        self.script
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// String parameter; `None` for absent or JSON null.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// Render the script text handed to PowerShell.
    pub fn render(&self) -> String {
        let json = Value::Object(self.parameters.clone()).to_string();
        let encoded = base64::engine::general_purpose::STANDARD.encode(json.as_bytes());
        format!(
            "$ErrorActionPreference = 'Stop'\n$p = [System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{}')) | ConvertFrom-Json\n{}",
            encoded, self.script
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_payload(rendered: &str) -> Value {
        let start = rendered.find("FromBase64String('").unwrap() + "FromBase64String('".len();
        let end = start + rendered[start..].find('\'').unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&rendered[start..end])
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn render_keeps_hostile_values_out_of_script_text() {
        let evil = "x'; Remove-Item C:\\ -Recurse; '";
        let cmd = PsCommand::new("Test", "Write-Output $p.VmName").arg("VmName", evil);
        let rendered = cmd.render();
        assert!(!rendered.contains("Remove-Item"));
        assert!(rendered.ends_with("Write-Output $p.VmName"));
        assert_eq!(decode_payload(&rendered)["VmName"], evil);
    }

    #[test]
    fn render_sets_error_preference_inside_the_script() {
        let rendered = PsCommand::new("Test", "Get-VM").render();
        assert!(rendered.starts_with("$ErrorActionPreference = 'Stop'\n$p = "));
    }

    #[test]
    fn accessors_read_typed_parameters() {
        let cmd = PsCommand::new("Test", "")
            .arg("VmName", "web01")
            .arg("ControllerNumber", 2u32)
            .arg("Path", Option::<String>::None);
        assert_eq!(cmd.get_str("VmName"), Some("web01"));
        assert_eq!(cmd.get_u32("ControllerNumber"), Some(2));
        assert_eq!(cmd.get("Path"), Some(&Value::Null));
        assert_eq!(cmd.get_str("Path"), None);
        assert_eq!(cmd.get_u32("Missing"), None);
    }

    #[test]
    fn each_command_gets_its_own_id() {
        let a = PsCommand::new("A", "");
        let b = PsCommand::new("A", "");
        assert_ne!(a.id(), b.id());
    }
}
