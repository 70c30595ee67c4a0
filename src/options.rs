// ============================================
// options.rs - options.json parsing
// ============================================
//
// options.json is written by the bundle patcher and looks like:
//
//   {
//     "install": {
//       "quiet": true,
//       "startAfterInstall": false,
//       "createDesktopShortcut": true,
//       "createStartMenuShortcut": true,
//       "installPath": "D:\\Wayk"
//     },
//     "postInstallScript": { "importWaykNowModule": true },
//     "enrollment": { "url": "https://den.example", "token": "..." },
//     "config": { "analyticsEnabled": false, "generatedPasswordLength": 8 }
//   }
//
// Every field is optional. Scalar fields are looked up one by one with
// dotted paths; a field that is missing (or has the wrong JSON type)
// keeps its default. "config" members are kept in document order.
// ============================================

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    /// Syntax error, non-object root, or unsupported config value
    #[error("invalid options JSON: {0}")]
    InvalidJson(String),

    /// The options file could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, OptionsError>;

/// One entry of the "config" object, value already rendered as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub key: String,
    pub value: String,
}

/// Parsed options.json
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsDocument {
    pub quiet: bool,
    pub start_after_install: bool,
    pub create_desktop_shortcut: bool,
    pub create_start_menu_shortcut: bool,
    pub import_module_required: bool,
    pub install_directory: Option<String>,
    pub enrollment_url: Option<String>,
    pub enrollment_token: Option<String>,
    pub config: Vec<ConfigOverride>,
}

impl Default for OptionsDocument {
    fn default() -> Self {
        Self {
            quiet: false,
            start_after_install: false,
            create_desktop_shortcut: true,
            create_start_menu_shortcut: true,
            import_module_required: false,
            install_directory: None,
            enrollment_url: None,
            enrollment_token: None,
            config: Vec::new(),
        }
    }
}

impl OptionsDocument {
    /// Read and parse an options file
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&bytes)
    }

    /// Parse options from raw JSON bytes
    pub fn from_slice(json: &[u8]) -> Result<Self> {
        let root: Value = serde_json::from_slice(json).map_err(|e| OptionsError::InvalidJson(e.to_string()))?;
        Self::from_value(&root)
    }

    fn from_value(root: &Value) -> Result<Self> {
        let root = root
            .as_object()
            .ok_or_else(|| OptionsError::InvalidJson("root is not an object".to_string()))?;

        let defaults = Self::default();
        let flag = |path: &str, default: bool| dotget(root, path).and_then(Value::as_bool).unwrap_or(default);
        let text = |path: &str| dotget(root, path).and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            quiet: flag("install.quiet", defaults.quiet),
            start_after_install: flag("install.startAfterInstall", defaults.start_after_install),
            create_desktop_shortcut: flag("install.createDesktopShortcut", defaults.create_desktop_shortcut),
            create_start_menu_shortcut: flag("install.createStartMenuShortcut", defaults.create_start_menu_shortcut),
            import_module_required: flag("postInstallScript.importWaykNowModule", defaults.import_module_required),
            install_directory: text("install.installPath"),
            enrollment_url: text("enrollment.url"),
            enrollment_token: text("enrollment.token"),
            config: match root.get("config") {
                Some(Value::Object(members)) => config_overrides(members)?,
                _ => Vec::new(),
            },
        })
    }
}

impl FromStr for OptionsDocument {
    type Err = OptionsError;

    fn from_str(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }
}

/// Follow a dotted path ("install.quiet") through nested objects
fn dotget<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn config_overrides(members: &Map<String, Value>) -> Result<Vec<ConfigOverride>> {
    members
        .iter()
        .map(|(key, value)| {
            Ok(ConfigOverride {
                key: key.clone(),
                value: config_value_text(key, value)?,
            })
        })
        .collect()
}

/// Strings verbatim, booleans as "true"/"false", numbers truncated to integers
fn config_value_text(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Ok(u.to_string())
            } else {
                // `as` saturates out-of-range floats
                let truncated = n.as_f64().unwrap_or_default().trunc() as i64;
                Ok(truncated.to_string())
            }
        }
        other => Err(OptionsError::InvalidJson(format!(
            "config.{key} has unsupported type ({})",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================
// TESTS
// ============================================
