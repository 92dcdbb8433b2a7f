use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const OPTION_POLICY_TRACING: &str = "PolicyTracing";

#[derive(Clone, Copy, Debug)]
pub struct OptionSpec {
    pub name: &'static str,
    /// Preprocessor symbol the option maps to in generated headers.
    pub define: &'static str,
    pub description: &'static str,
}

/// Options the daemon accepts at runtime.
pub const DAEMON_OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: OPTION_POLICY_TRACING,
    define: "POLICY_TRACE",
    description: "Enable tracing when resolving policy (Debug)",
}];

/// Named boolean switches, kept sorted so rendered output is stable.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoolOptions(BTreeMap<String, bool>);

impl BoolOptions {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), value);
    }

    /// Applies `changes` and returns the number of options whose value changed.
    pub fn apply(&mut self, changes: &BTreeMap<String, bool>) -> usize {
        let mut changed = 0;
        for (name, value) in changes {
            if self.0.insert(name.clone(), *value) != Some(*value) {
                changed += 1;
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &bool)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `#define` for every enabled option of `library`, `#undef` otherwise.
    pub fn header_defines(&self, library: &[OptionSpec]) -> String {
        let mut out = String::new();
        for spec in library {
            let directive = if self.is_enabled(spec.name) {
                "#define"
            } else {
                "#undef"
            };
            out.push_str(&format!("{directive} {}\n", spec.define));
        }
        out
    }
}

impl Display for BoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, value) in &self.0 {
            let state = if *value { "Enabled" } else { "Disabled" };
            writeln!(f, "{name:<24} {state}")?;
        }
        Ok(())
    }
}

/// Rejects names not present in `library`.
pub fn validate(library: &[OptionSpec], changes: &BTreeMap<String, bool>) -> Result<()> {
    for name in changes.keys() {
        if !library.iter().any(|spec| spec.name == name.as_str()) {
            return Err(Error::Validation(format!("unknown option {name}")));
        }
    }
    Ok(())
}

/// Parses `Name`, `!Name`, `Name=true|false|enable|disable`.
pub fn parse_option(input: &str) -> Result<(String, bool)> {
    let input = input.trim();
    let (name, value) = match input.split_once('=') {
        Some((name, value)) => {
            let value = match value.to_ascii_lowercase().as_str() {
                "true" | "on" | "enable" | "enabled" => true,
                "false" | "off" | "disable" | "disabled" => false,
                other => {
                    return Err(Error::Validation(format!(
                        "invalid value {other} for option {name}"
                    )));
                }
            };
            (name, value)
        }
        None => match input.strip_prefix('!') {
            Some(name) => (name, false),
            None => (input, true),
        },
    };
    if name.is_empty() {
        return Err(Error::Validation("empty option name".into()));
    }
    Ok((name.to_string(), value))
}
