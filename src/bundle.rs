// ============================================
// bundle.rs - Deployment bundle catalog and extraction
// ============================================
//
// The bundle embedded in the executable has a fixed layout:
//
//   bundle.zip
//   ├── options.json            # required
//   ├── WaykNow_x86.exe         # required for the matching bitness
//   ├── WaykNow_x64.exe
//   ├── Installer_x86.msi       # optional (absent = online install)
//   ├── Installer_x64.msi
//   ├── branding.zip            # optional
//   ├── init.ps1                # optional post-install script
//   └── PowerShell/...          # optional module (older bundles keep it
//                               # under Wayk_x86/ and Wayk_x64/)
//
// extract_all() unpacks these in a fixed order and reports which of the
// optional assets were there.
// ============================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::archive::{Archive, ArchiveError, Extraction};

// ============================================
// CATALOG
// ============================================

pub const OPTIONS_FILE_NAME: &str = "options.json";
pub const BRANDING_FILE_NAME: &str = "branding.zip";
pub const INIT_SCRIPT_FILE_NAME: &str = "init.ps1";
pub const POWERSHELL_FOLDER_NAME: &str = "PowerShell";

/// Module folder below the PowerShell folder, as passed to Import-Module
pub const POWERSHELL_MODULE_SUBPATH: &str = "Modules/WaykNow";

/// Target CPU word width of the binaries to deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub fn as_str(self) -> &'static str {
        match self {
            Bitness::X86 => "x86",
            Bitness::X64 => "x64",
        }
    }

    /// `WaykNow_x86.exe` / `WaykNow_x64.exe`
    pub fn agent_binary_name(self) -> String {
        format!("WaykNow_{}.exe", self.as_str())
    }

    /// `Installer_x86.msi` / `Installer_x64.msi`
    pub fn installer_name(self) -> String {
        format!("Installer_{}.msi", self.as_str())
    }

    /// Folder holding the PowerShell subtree in older bundle layouts
    pub fn legacy_folder_name(self) -> String {
        format!("Wayk_{}", self.as_str())
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bitness {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "32" => Ok(Bitness::X86),
            "x64" | "64" => Ok(Bitness::X64),
            _ => Err(format!("unknown bitness '{s}' (expected x86 or x64)")),
        }
    }
}

// ============================================
// ERRORS & REPORT
// ============================================

#[derive(Error, Debug)]
pub enum BundleError {
    /// One of the two mandatory assets is not in the archive
    #[error("required bundle asset '{0}' was not found")]
    NotFound(String),

    /// An asset is present but could not be extracted
    #[error("failed to extract '{asset}': {source}")]
    Extraction {
        asset: String,
        #[source]
        source: ArchiveError,
    },
}

pub type Result<T> = std::result::Result<T, BundleError>;

/// Which optional assets came out of the bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleContentReport {
    pub has_installer: bool,
    pub has_branding: bool,
    pub has_post_install_script: bool,
    pub has_powershell_module: bool,
}

impl BundleContentReport {
    /// No MSI was embedded; the agent has to fetch it
    pub fn download_required(&self) -> bool {
        !self.has_installer
    }
}

/// A bundle unpacked into a directory
#[derive(Debug, Clone)]
pub struct ExtractedBundle {
    directory: PathBuf,
    bitness: Bitness,
    report: BundleContentReport,
}

impl ExtractedBundle {
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    pub fn report(&self) -> &BundleContentReport {
        &self.report
    }

    pub fn options_file(&self) -> PathBuf {
        self.directory.join(OPTIONS_FILE_NAME)
    }

    pub fn agent_binary(&self) -> PathBuf {
        self.directory.join(self.bitness.agent_binary_name())
    }

    pub fn installer_package(&self) -> Option<PathBuf> {
        self.report
            .has_installer
            .then(|| self.directory.join(self.bitness.installer_name()))
    }

    pub fn branding_file(&self) -> Option<PathBuf> {
        self.report
            .has_branding
            .then(|| self.directory.join(BRANDING_FILE_NAME))
    }

    pub fn init_script(&self) -> Option<PathBuf> {
        self.report
            .has_post_install_script
            .then(|| self.directory.join(INIT_SCRIPT_FILE_NAME))
    }

    pub fn powershell_module(&self) -> Option<PathBuf> {
        self.report.has_powershell_module.then(|| {
            let mut path = self.directory.join(POWERSHELL_FOLDER_NAME);
            path.extend(POWERSHELL_MODULE_SUBPATH.split('/'));
            path
        })
    }
}

// ============================================
// EXTRACTION
// ============================================

/// Unpack the bundle into `target_dir` (which must already exist).
///
/// Order:
/// 1. options.json - required
/// 2. agent binary for `bitness` - required
/// 3. MSI installer - optional
/// 4. branding.zip - optional
/// 5. init.ps1 - optional
/// 6. PowerShell module subtree - optional, only next to an init script
pub fn extract_all(archive: &mut Archive<'_>, bitness: Bitness, target_dir: &Path) -> Result<ExtractedBundle> {
    extract_required(archive, target_dir, OPTIONS_FILE_NAME)?;
    extract_required(archive, target_dir, &bitness.agent_binary_name())?;

    let mut report = BundleContentReport {
        has_installer: extract_optional(archive, target_dir, &bitness.installer_name())?,
        has_branding: extract_optional(archive, target_dir, BRANDING_FILE_NAME)?,
        has_post_install_script: extract_optional(archive, target_dir, INIT_SCRIPT_FILE_NAME)?,
        has_powershell_module: false,
    };

    if report.has_post_install_script {
        report.has_powershell_module = extract_powershell_module(archive, bitness, target_dir)?;
    }

    Ok(ExtractedBundle {
        directory: target_dir.to_path_buf(),
        bitness,
        report,
    })
}

fn extract_required(archive: &mut Archive<'_>, target_dir: &Path, name: &str) -> Result<()> {
    match extract_optional(archive, target_dir, name)? {
        true => Ok(()),
        false => Err(BundleError::NotFound(name.to_string())),
    }
}

fn extract_optional(archive: &mut Archive<'_>, target_dir: &Path, name: &str) -> Result<bool> {
    archive
        .extract_optional(name, &target_dir.join(name))
        .map(Extraction::is_extracted)
        .map_err(|source| BundleError::Extraction {
            asset: name.to_string(),
            source,
        })
}

/// Try the current layout first, then the per-bitness legacy folder.
fn extract_powershell_module(archive: &mut Archive<'_>, bitness: Bitness, target_dir: &Path) -> Result<bool> {
    let destination = target_dir.join(POWERSHELL_FOLDER_NAME);
    let legacy_prefix = format!("{}/{}", bitness.legacy_folder_name(), POWERSHELL_FOLDER_NAME);

    for prefix in [POWERSHELL_FOLDER_NAME, legacy_prefix.as_str()] {
        let written = archive
            .extract_subtree(prefix, &destination)
            .map_err(|source| BundleError::Extraction {
                asset: prefix.to_string(),
                source,
            })?;
        if written > 0 {
            return Ok(true);
        }
    }

    Ok(false)
}

// ============================================
// TESTS
// ============================================
