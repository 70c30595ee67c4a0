// ============================================
// tools.rs - Operating system glue
// ============================================
//
// This module handles everything the deployment needs from the host:
//   - Single instance guard (named mutex)
//   - Loading the bundle embedded as an RCDATA resource
//   - Detecting which agent bitness to deploy
//   - Reading the agent installation directory from the registry
//   - Launching the installer and PowerShell
//   - ${VAR} expansion for path arguments
//
// Off Windows the resource, registry and mutex calls have stand-ins so
// the rest of the tool can be exercised with a bundle file.
// ============================================

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use crate::bundle::Bitness;
use crate::deploy::Host;
use crate::install::InstallCommand;

/// Resource id of the embedded bundle (RT_RCDATA)
pub const BUNDLE_RESOURCE_ID: u16 = 101;

#[cfg(windows)]
const INSTANCE_MUTEX_NAME: &str = "Global\\WaykNowCSEInstance";

#[cfg(not(windows))]
const INSTANCE_LOCK_FILE_NAME: &str = "wayk_cse.lock";

/// Registry key written by the agent installer (HKLM)
pub const AGENT_REGISTRY_KEY: &str = "SOFTWARE\\Devolutions\\Wayk Agent";
pub const AGENT_INSTALL_DIR_VALUE: &str = "InstallDir";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(windows)]
fn to_wide(text: &str) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    std::ffi::OsStr::new(text).encode_wide().chain(std::iter::once(0)).collect()
}

// ============================================
// SINGLE INSTANCE
// ============================================

/// Held for the whole run; only one deployment may run per machine.
#[derive(Debug)]
pub struct InstanceGuard {
    #[cfg(windows)]
    handle: winapi::um::winnt::HANDLE,
    #[cfg(not(windows))]
    lock_path: PathBuf,
}

impl InstanceGuard {
    /// Returns `Ok(None)` when another instance already holds the guard.
    #[cfg(windows)]
    pub fn acquire() -> Result<Option<Self>> {
        use winapi::shared::winerror::ERROR_ALREADY_EXISTS;
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::synchapi::CreateMutexW;

        let name = to_wide(INSTANCE_MUTEX_NAME);
        unsafe {
            let handle = CreateMutexW(std::ptr::null_mut(), 1, name.as_ptr());
            if handle.is_null() {
                bail!("CreateMutexW failed with error {}", GetLastError());
            }
            if GetLastError() == ERROR_ALREADY_EXISTS {
                CloseHandle(handle);
                return Ok(None);
            }
            Ok(Some(Self { handle }))
        }
    }

    #[cfg(not(windows))]
    pub fn acquire() -> Result<Option<Self>> {
        Self::acquire_at(&std::env::temp_dir().join(INSTANCE_LOCK_FILE_NAME))
    }

    /// Lock file stand-in for the named mutex.
    ///
    /// The file holds the owner's PID. A lock left behind by a process
    /// that is gone is removed and taken over.
    #[cfg(not(windows))]
    pub fn acquire_at(lock_path: &Path) -> Result<Option<Self>> {
        use std::io::Write;

        for _ in 0..2 {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(lock_path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("Failed to write lock file {}", lock_path.display()))?;
                    return Ok(Some(Self {
                        lock_path: lock_path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_owner_alive(lock_path) {
                        return Ok(None);
                    }
                    log::warn!("Removing stale lock file {}", lock_path.display());
                    match std::fs::remove_file(lock_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e)
                                .with_context(|| format!("Failed to remove stale lock file {}", lock_path.display()))
                        }
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to create lock file {}", lock_path.display())),
            }
        }
        // Another instance took the lock between removal and creation
        Ok(None)
    }
}

/// Whether the PID recorded in a lock file belongs to a running process.
///
/// An unreadable or empty lock file counts as held, since its owner may
/// still be writing it.
#[cfg(not(windows))]
fn lock_owner_alive(lock_path: &Path) -> bool {
    let text = match std::fs::read_to_string(lock_path) {
        Ok(text) => text,
        Err(e) => return e.kind() != std::io::ErrorKind::NotFound,
    };
    match text.trim().parse::<u32>() {
        Ok(pid) => process_alive(pid),
        Err(_) => text.trim().is_empty(),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(true)
}

impl Drop for InstanceGuard {
    #[cfg(windows)]
    fn drop(&mut self) {
        unsafe {
            winapi::um::synchapi::ReleaseMutex(self.handle);
            winapi::um::handleapi::CloseHandle(self.handle);
        }
    }

    #[cfg(not(windows))]
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

// ============================================
// EMBEDDED BUNDLE
// ============================================

/// Bytes of the bundle linked into this executable
#[cfg(windows)]
pub fn load_embedded_bundle() -> Result<Vec<u8>> {
    use winapi::um::libloaderapi::{FindResourceW, LoadResource, LockResource, SizeofResource};
    use winapi::um::winuser::{MAKEINTRESOURCEW, RT_RCDATA};

    unsafe {
        let module = std::ptr::null_mut();
        let resource = FindResourceW(module, MAKEINTRESOURCEW(BUNDLE_RESOURCE_ID), RT_RCDATA as _);
        if resource.is_null() {
            bail!("No bundle resource ({BUNDLE_RESOURCE_ID}) in this executable");
        }
        let size = SizeofResource(module, resource) as usize;
        let loaded = LoadResource(module, resource);
        if loaded.is_null() || size == 0 {
            bail!("Failed to load bundle resource ({BUNDLE_RESOURCE_ID})");
        }
        let data = LockResource(loaded) as *const u8;
        if data.is_null() {
            bail!("Failed to lock bundle resource ({BUNDLE_RESOURCE_ID})");
        }
        Ok(std::slice::from_raw_parts(data, size).to_vec())
    }
}

#[cfg(not(windows))]
pub fn load_embedded_bundle() -> Result<Vec<u8>> {
    bail!("Embedded bundles are only available on Windows; pass --bundle <file>")
}

/// Read a bundle from disk instead of the resource section
pub fn load_bundle_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read bundle {}", path.display()))
}

// ============================================
// BITNESS
// ============================================

impl Bitness {
    /// x64 for 64-bit builds and for 32-bit builds running under WOW64
    pub fn detect() -> Bitness {
        if cfg!(target_pointer_width = "64") || is_wow64() {
            Bitness::X64
        } else {
            Bitness::X86
        }
    }
}

#[cfg(windows)]
fn is_wow64() -> bool {
    use winapi::um::processthreadsapi::GetCurrentProcess;
    use winapi::um::wow64apiset::IsWow64Process;

    let mut wow64 = 0;
    unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64) != 0 && wow64 != 0 }
}

#[cfg(not(windows))]
fn is_wow64() -> bool {
    false
}

// ============================================
// REGISTRY
// ============================================

/// Where the agent was installed, if the installer recorded it
#[cfg(windows)]
pub fn installation_directory() -> Option<PathBuf> {
    use winapi::shared::minwindef::DWORD;
    use winapi::shared::winerror::ERROR_SUCCESS;
    use winapi::um::winreg::{RegGetValueW, HKEY_LOCAL_MACHINE, RRF_RT_REG_SZ};

    // The agent is 64-bit on x64 machines; read its view even from a 32-bit process
    const RRF_SUBKEY_WOW6464KEY: DWORD = 0x0001_0000;

    let key = to_wide(AGENT_REGISTRY_KEY);
    let value = to_wide(AGENT_INSTALL_DIR_VALUE);
    let flags = RRF_RT_REG_SZ | RRF_SUBKEY_WOW6464KEY;

    unsafe {
        let mut size: DWORD = 0;
        let status = RegGetValueW(
            HKEY_LOCAL_MACHINE,
            key.as_ptr(),
            value.as_ptr(),
            flags,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut size,
        );
        if status != ERROR_SUCCESS as i32 || size == 0 {
            return None;
        }

        let mut buffer = vec![0u16; (size as usize + 1) / 2];
        let status = RegGetValueW(
            HKEY_LOCAL_MACHINE,
            key.as_ptr(),
            value.as_ptr(),
            flags,
            std::ptr::null_mut(),
            buffer.as_mut_ptr() as *mut _,
            &mut size,
        );
        if status != ERROR_SUCCESS as i32 {
            return None;
        }

        let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
        let dir = String::from_utf16_lossy(&buffer[..len]);
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }
}

#[cfg(not(windows))]
pub fn installation_directory() -> Option<PathBuf> {
    None
}

// ============================================
// PROCESS LAUNCHING
// ============================================

/// Start the installer and wait for its exit code
pub fn run_installer(command: &InstallCommand) -> Result<i32> {
    let mut process = Command::new(command.program());

    // The arguments are already quoted for CommandLineToArgvW
    #[cfg(windows)]
    process.raw_arg(command.arguments());

    #[cfg(not(windows))]
    process.args(crate::install::split_command_line(command.arguments()));

    let status = process
        .status()
        .with_context(|| format!("Failed to start {}", command.program()))?;

    status
        .code()
        .with_context(|| format!("{} was terminated without an exit code", command.program()))
}

#[cfg(windows)]
pub fn powershell_path() -> Result<PathBuf> {
    let system_root = std::env::var_os("SYSTEMROOT").context("SYSTEMROOT is not set")?;
    Ok(PathBuf::from(system_root)
        .join("System32")
        .join("WindowsPowerShell")
        .join("v1.0")
        .join("powershell.exe"))
}

#[cfg(not(windows))]
pub fn powershell_path() -> Result<PathBuf> {
    Ok(PathBuf::from("pwsh"))
}

/// Run `command` through PowerShell without a console window.
///
/// A non-zero exit code is an error.
pub fn run_powershell(command: &str) -> Result<()> {
    let powershell = powershell_path()?;
    let mut process = Command::new(&powershell);
    process.args(["-WindowStyle", "Hidden", "-ExecutionPolicy", "Bypass", "-NoLogo", "-Command"]);
    process.arg(command);

    #[cfg(windows)]
    process.creation_flags(CREATE_NO_WINDOW);

    let status = process
        .status()
        .with_context(|| format!("Failed to start {}", powershell.display()))?;

    if !status.success() {
        bail!("PowerShell exited with {status}");
    }
    Ok(())
}

/// `Import-Module -Name '<module>'; .'<script>'`
pub fn init_script_command(module: Option<&Path>, script: &Path) -> String {
    let script = ps_quote(&script.to_string_lossy());
    match module {
        Some(module) => format!("Import-Module -Name {}; .{}", ps_quote(&module.to_string_lossy()), script),
        None => format!(".{script}"),
    }
}

/// PowerShell single-quoted string literal
fn ps_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// The real host: installer and PowerShell processes, registry lookups
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run_installer(&self, command: &InstallCommand) -> Result<i32> {
        run_installer(command)
    }

    fn run_powershell(&self, command: &str) -> Result<()> {
        run_powershell(command)
    }

    fn installation_directory(&self) -> Option<PathBuf> {
        installation_directory()
    }
}

// ============================================
// ENVIRONMENT EXPANSION
// ============================================

/// Expand `${NAME}` references from the environment.
///
/// `$$` produces a literal `$`. A `$` followed by anything other than `{`
/// or `$`, an unterminated `${`, and an unset variable are all errors.
pub fn expand_env_vars(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(after) = rest.strip_prefix('$') {
            out.push('$');
            rest = after;
            continue;
        }

        let Some(after) = rest.strip_prefix('{') else {
            bail!("Invalid expression in '{input}': '$' must be followed by '{{' or '$'");
        };
        let Some(end) = after.find('}') else {
            bail!("Invalid expression in '{input}': missing closing '}}'");
        };

        let name = &after[..end];
        let value = std::env::var(name).with_context(|| format!("Environment variable '{name}' is not set"))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

// ============================================
// TESTS
// ============================================
