// ============================================
// install.rs - Agent installer command line
// ============================================
//
// The agent binary installs itself when started with one of:
//
//   "C:\...\WaykNow_x64.exe" install-local-package "C:\...\Installer_x64.msi" KEY="VALUE" ...
//   "C:\...\WaykNow_x64.exe" install KEY="VALUE" ...
//
// The KEY="VALUE" pairs are MSI properties. InstallCommandBuilder grows
// the command one option at a time and refuses to go past the
// CreateProcessW command line limit instead of truncating.
// ============================================

use std::fmt;

use thiserror::Error;

// ============================================
// CONSTANTS
// ============================================

/// Starting capacity of the command line buffer, in UTF-16 units
pub const MIN_CLI_CAPACITY: usize = 256;

/// CreateProcessW limit (32767) + null terminator, in UTF-16 units
pub const MAX_CLI_CAPACITY: usize = 32768;

/// Value given to the shortcut and launch flags to turn them off.
///
/// Installer revisions disagree on "" versus "0"; the empty string is the
/// one the agent MSI treats as unset.
pub const FLAG_DISABLED_VALUE: &str = "";

pub const INSTALL_LOCAL_PACKAGE_COMMAND: &str = "install-local-package";
pub const INSTALL_COMMAND: &str = "install";

pub const ENROLL_URL_PROPERTY: &str = "ENROLL_DEN_URL";
pub const ENROLL_TOKEN_PROPERTY: &str = "ENROLL_TOKEN_ID";
pub const INSTALL_DIR_PROPERTY: &str = "INSTALLDIR";
pub const DESKTOP_SHORTCUT_PROPERTY: &str = "INSTALLDESKTOPSHORTCUT";
pub const START_MENU_SHORTCUT_PROPERTY: &str = "INSTALLSTARTMENUSHORTCUT";
pub const SUPPRESS_LAUNCH_PROPERTY: &str = "SUPPRESSLAUNCH";
pub const BRANDING_FILE_PROPERTY: &str = "BRANDING_FILE";
pub const CONFIG_PROPERTY_PREFIX: &str = "CONFIG_";

// ============================================
// VALUE ALIASES
// ============================================

const ACCESS_CONTROL_LEVELS: &[(&str, &str)] = &[("allow", "1"), ("confirm", "2"), ("disable", "4")];

const LOGGING_LEVELS: &[(&str, &str)] = &[
    ("trace", "0"),
    ("debug", "1"),
    ("info", "2"),
    ("warn", "3"),
    ("error", "4"),
    ("critical", "5"),
    ("off", "6"),
];

const QUALITY_MODES: &[(&str, &str)] = &[("low", "1"), ("medium", "2"), ("high", "3")];

const PASSWORD_CHAR_SETS: &[(&str, &str)] = &[("numeric", "0"), ("alphanumeric", "1")];

const PASSWORD_TYPES: &[(&str, &str)] = &[("generated", "0"), ("custom", "1")];

const CONTROL_MODES: &[(&str, &str)] = &[("both", "0"), ("client", "1"), ("server", "2")];

/// Config keys whose values are symbolic names for numeric settings
fn value_aliases(key: &str) -> Option<&'static [(&'static str, &'static str)]> {
    match key {
        "accessControlViewing"
        | "accessControlInteract"
        | "accessControlClipboard"
        | "accessControlFileTransfer"
        | "accessControlExec"
        | "accessControlChat" => Some(ACCESS_CONTROL_LEVELS),
        "loggingLevel" => Some(LOGGING_LEVELS),
        "qualityMode" => Some(QUALITY_MODES),
        "generatedPasswordCharSet" => Some(PASSWORD_CHAR_SETS),
        "personalPasswordType" => Some(PASSWORD_TYPES),
        "controlMode" => Some(CONTROL_MODES),
        _ => None,
    }
}

/// Translate `value` through the alias table of `key`, if it has one.
///
/// Names match case-insensitively; a value that is already one of the
/// numeric targets passes through.
pub fn translate_config_value<'v>(key: &str, value: &'v str) -> Result<&'v str> {
    let Some(aliases) = value_aliases(key) else {
        return Ok(value);
    };

    for &(name, number) in aliases {
        if value.eq_ignore_ascii_case(name) {
            return Ok(number);
        }
        if value == number {
            return Ok(value);
        }
    }

    let expected: Vec<&str> = aliases.iter().map(|(name, _)| *name).collect();
    Err(CommandLineError::InvalidArgs(format!(
        "unknown value '{value}' for config option '{key}' (expected one of: {})",
        expected.join(", ")
    )))
}

/// `analyticsEnabled` -> `ANALYTICS_ENABLED`
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() * 2);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() && i != 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

/// Config keys become part of an unquoted MSI property name
fn validate_config_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CommandLineError::InvalidArgs("config option name is empty".to_string()));
    }
    if key.chars().any(|c| c == '"' || c == '=' || c.is_whitespace() || c.is_control()) {
        return Err(CommandLineError::InvalidArgs(format!(
            "config option name '{key}' contains quotes, '=' or whitespace"
        )));
    }
    Ok(())
}

/// MSI property name for a config override
pub fn config_property_name(key: &str) -> String {
    format!("{CONFIG_PROPERTY_PREFIX}{}", to_snake_case(key))
}

// ============================================
// ERRORS
// ============================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("invalid installer arguments: {0}")]
    InvalidArgs(String),

    #[error("installer command line would need {required} characters (limit is {limit})")]
    TooBigCli { required: usize, limit: usize },

    #[error("out of memory while building the installer command line")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, CommandLineError>;

// ============================================
// QUOTING
// ============================================

/// How many times a quoted value is escaped.
///
/// `Single` follows the CommandLineToArgvW / MSVC CRT rules, so the
/// receiving process sees the original value. `Nested` escapes twice for
/// command lines that a second interpreter re-parses (`"` becomes `\\\"`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuoteEscaping {
    #[default]
    Single,
    Nested,
}

impl QuoteEscaping {
    fn passes(self) -> usize {
        match self {
            QuoteEscaping::Single => 1,
            QuoteEscaping::Nested => 2,
        }
    }

    /// Escape the content of a value that will be wrapped in quotes
    pub fn escape(self, value: &str) -> String {
        let mut escaped = value.to_string();
        for _ in 0..self.passes() {
            escaped = escape_quoted_content(&escaped);
        }
        escaped
    }
}

/// One pass of argv escaping for text placed between double quotes
fn escape_quoted_content(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    let mut backslashes = 0;
    for c in value.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
            }
        }
        if c != '\\' {
            out.push(c);
        }
    }
    // Trailing backslashes sit right before the closing quote
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out
}

/// Split a command line the way CommandLineToArgvW does for arguments.
pub fn split_command_line(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let mut count = 1;
                while chars.peek() == Some(&'\\') {
                    chars.next();
                    count += 1;
                }
                if chars.peek() == Some(&'"') {
                    current.extend(std::iter::repeat('\\').take(count / 2));
                    if count % 2 == 1 {
                        chars.next();
                        current.push('"');
                    }
                } else {
                    current.extend(std::iter::repeat('\\').take(count));
                }
                in_token = true;
            }
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
                in_token = true;
            }
            ' ' | '\t' if !in_quotes => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        args.push(current);
    }
    args
}

// ============================================
// BUILDER
// ============================================

/// A finished installer command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCommand {
    program: String,
    command_line: String,
    arguments_start: usize,
}

impl InstallCommand {
    /// Path of the executable to start
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whole command line, starting with the quoted program
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Everything after the quoted program
    pub fn arguments(&self) -> &str {
        &self.command_line[self.arguments_start..]
    }
}

impl fmt::Display for InstallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line)
    }
}

/// Grows the installer command line option by option.
///
/// Each append is all-or-nothing: on error the command line is left as it
/// was before the call.
#[derive(Debug)]
pub struct InstallCommandBuilder {
    program: String,
    cli: String,
    /// Length of `cli` in UTF-16 units
    len: usize,
    capacity: usize,
    arguments_start: usize,
    escaping: QuoteEscaping,
}

impl InstallCommandBuilder {
    /// Start a command line for `program`.
    ///
    /// With a local package the sub-command is
    /// `install-local-package "<msi>"`, otherwise `install`.
    pub fn new(program: &str, local_package: Option<&str>, escaping: QuoteEscaping) -> Result<Self> {
        if program.is_empty() {
            return Err(CommandLineError::InvalidArgs("installer executable path is empty".to_string()));
        }

        let mut builder = Self {
            program: program.to_string(),
            cli: String::new(),
            len: 0,
            capacity: 0,
            arguments_start: 0,
            escaping,
        };

        let quoted_program = builder.quoted(program);
        builder.append(&quoted_program)?;
        builder.arguments_start = builder.cli.len() + 1;

        let seed = match local_package {
            Some(msi) if msi.is_empty() => {
                return Err(CommandLineError::InvalidArgs("installer package path is empty".to_string()))
            }
            Some(msi) => format!(" {INSTALL_LOCAL_PACKAGE_COMMAND} {}", builder.quoted(msi)),
            None => format!(" {INSTALL_COMMAND}"),
        };
        builder.append(&seed)?;

        Ok(builder)
    }

    pub fn with_local_package(program: &str, msi: &str) -> Result<Self> {
        Self::new(program, Some(msi), QuoteEscaping::default())
    }

    pub fn with_download(program: &str) -> Result<Self> {
        Self::new(program, None, QuoteEscaping::default())
    }

    /// ENROLL_DEN_URL and ENROLL_TOKEN_ID, appended together or not at all
    pub fn set_enrollment_options(&mut self, url: &str, token: &str) -> Result<()> {
        if url.is_empty() || token.is_empty() {
            return Err(CommandLineError::InvalidArgs(
                "enrollment requires both a URL and a token".to_string(),
            ));
        }
        let text = format!(
            "{}{}",
            self.option_text(ENROLL_URL_PROPERTY, url),
            self.option_text(ENROLL_TOKEN_PROPERTY, token)
        );
        self.append(&text)
    }

    /// CONFIG_<SNAKE_CASE_KEY>="value", with alias translation
    pub fn set_config_option(&mut self, key: &str, value: &str) -> Result<()> {
        validate_config_key(key)?;
        let value = translate_config_value(key, value)?;
        let text = self.option_text(&config_property_name(key), value);
        self.append(&text)
    }

    pub fn set_install_directory(&mut self, dir: &str) -> Result<()> {
        self.append_option(INSTALL_DIR_PROPERTY, dir)
    }

    pub fn disable_desktop_shortcut(&mut self) -> Result<()> {
        self.append_option(DESKTOP_SHORTCUT_PROPERTY, FLAG_DISABLED_VALUE)
    }

    pub fn disable_start_menu_shortcut(&mut self) -> Result<()> {
        self.append_option(START_MENU_SHORTCUT_PROPERTY, FLAG_DISABLED_VALUE)
    }

    /// Let the installer start the agent when it finishes
    pub fn disable_suppress_launch(&mut self) -> Result<()> {
        self.append_option(SUPPRESS_LAUNCH_PROPERTY, FLAG_DISABLED_VALUE)
    }

    pub fn set_branding_file(&mut self, path: &str) -> Result<()> {
        self.append_option(BRANDING_FILE_PROPERTY, path)
    }

    /// Current text, for inspection before `build`
    pub fn as_str(&self) -> &str {
        &self.cli
    }

    /// Current length in UTF-16 units, the measure the limit applies to
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn build(self) -> InstallCommand {
        InstallCommand {
            program: self.program,
            command_line: self.cli,
            arguments_start: self.arguments_start,
        }
    }

    fn append_option(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CommandLineError::InvalidArgs("option name is empty".to_string()));
        }
        let text = self.option_text(key, value);
        self.append(&text)
    }

    fn quoted(&self, value: &str) -> String {
        format!("\"{}\"", self.escaping.escape(value))
    }

    fn option_text(&self, key: &str, value: &str) -> String {
        format!(" {key}={}", self.quoted(value))
    }

    /// Append `text`, doubling the capacity from MIN_CLI_CAPACITY until the
    /// content plus a terminator fits. Lengths are counted in UTF-16 units,
    /// as CreateProcessW counts them.
    fn append(&mut self, text: &str) -> Result<()> {
        let text_len = text.encode_utf16().count();
        let required = self.len + text_len + 1;

        let mut capacity = self.capacity.max(MIN_CLI_CAPACITY);
        while capacity < required {
            capacity *= 2;
        }
        if capacity > MAX_CLI_CAPACITY {
            return Err(CommandLineError::TooBigCli {
                required,
                limit: MAX_CLI_CAPACITY,
            });
        }

        self.cli.try_reserve(text.len()).map_err(|_| CommandLineError::OutOfMemory)?;
        self.capacity = capacity;
        self.cli.push_str(text);
        self.len += text_len;
        Ok(())
    }
}

// ============================================
// TESTS
// ============================================
