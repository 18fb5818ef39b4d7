//! Code that installs auxiliary services (package management, inspection,
//! variable listing) inside the kernel.
//!
//! The services themselves live in a Python module next to the kernel and
//! talk to the editor over comms. The gateway only imports that module and
//! calls its entry point once. Comm payloads stay opaque to the gateway.

use crate::config::RegistrationConfig;
use crate::error::ConfigError;

impl RegistrationConfig {
    /// Python source for the registration `execute_request`.
    ///
    /// A configured `code` override is returned verbatim.
    pub fn render_code(&self) -> Result<String, ConfigError> {
        if let Some(code) = &self.code {
            return Ok(code.clone());
        }

        if !is_dotted_identifier(&self.module) {
            return Err(ConfigError::InvalidIdentifier {
                field: "module",
                value: self.module.clone(),
            });
        }
        if !is_identifier(&self.entry_point) {
            return Err(ConfigError::InvalidIdentifier {
                field: "entry_point",
                value: self.entry_point.clone(),
            });
        }

        let mut code = String::new();
        if !self.python_path.is_empty() {
            code.push_str("import sys\n");
            // inserted back to front so the first entry wins
            for path in self.python_path.iter().rev() {
                code.push_str(&format!(
                    "sys.path.insert(0, {})\n",
                    python_str(&path.to_string_lossy())
                ));
            }
        }
        code.push_str(&format!(
            "from {} import {}\n{}(session_mode={})\n",
            self.module,
            self.entry_point,
            self.entry_point,
            python_str(self.session_mode.as_str())
        ));
        Ok(code)
    }
}

/// JSON string literals are valid Python string literals.
fn python_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {
            chars.all(|c| c == '_' || c.is_alphanumeric())
        }
        _ => false,
    }
}

fn is_dotted_identifier(name: &str) -> bool {
    name.split('.').all(is_identifier)
}
