// ============================================
// error.rs - Run-level errors and process exit codes
// ============================================
//
// Each deployment stage has its own error type (archive, bundle,
// options, install). CseError wraps them and decides the exit code
// the executable returns.
// ============================================

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::bundle::BundleError;
use crate::install::CommandLineError;
use crate::options::OptionsError;

const CSE_APP_ERROR_BASE: i32 = -0x1000_0000;

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    Success = 0,
    BundleExtraction = CSE_APP_ERROR_BASE,
    MultipleInstances = CSE_APP_ERROR_BASE - 1,
    OptionsParsing = CSE_APP_ERROR_BASE - 2,
    CommandLine = CSE_APP_ERROR_BASE - 3,
    InstallerLaunch = CSE_APP_ERROR_BASE - 4,
    InstallerFailed = CSE_APP_ERROR_BASE - 5,
    PostInstallScript = CSE_APP_ERROR_BASE - 6,
    Environment = CSE_APP_ERROR_BASE - 7,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Code handed to the OS.
    ///
    /// Unix keeps only the low 8 bits of an exit status, so there the
    /// failures are numbered from 64 upwards instead.
    pub fn process_code(self) -> i32 {
        if cfg!(windows) || self == ExitStatus::Success {
            self.code()
        } else {
            64 + (CSE_APP_ERROR_BASE - self.code())
        }
    }
}

#[derive(Error, Debug)]
pub enum CseError {
    #[error("another instance is already running")]
    MultipleInstances,

    /// Bundle could not be located, opened or prepared for extraction
    #[error("bundle unavailable: {0}")]
    BundleUnavailable(#[source] anyhow::Error),

    #[error("bundle archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("bundle extraction failed: {0}")]
    Bundle(#[from] BundleError),

    #[error("options parsing failed: {0}")]
    Options(#[from] OptionsError),

    #[error("installer command line: {0}")]
    CommandLine(#[from] CommandLineError),

    #[error("failed to launch the installer: {0}")]
    InstallerLaunch(#[source] anyhow::Error),

    #[error("installer exited with code {0}")]
    InstallerFailed(i32),

    #[error("post-install script failed: {0}")]
    PostInstallScript(#[source] anyhow::Error),

    #[error("{0}")]
    Environment(#[source] anyhow::Error),
}

impl CseError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            CseError::MultipleInstances => ExitStatus::MultipleInstances,
            CseError::BundleUnavailable(_) | CseError::Archive(_) | CseError::Bundle(_) => {
                ExitStatus::BundleExtraction
            }
            CseError::Options(_) => ExitStatus::OptionsParsing,
            CseError::CommandLine(_) => ExitStatus::CommandLine,
            CseError::InstallerLaunch(_) => ExitStatus::InstallerLaunch,
            CseError::InstallerFailed(_) => ExitStatus::InstallerFailed,
            CseError::PostInstallScript(_) => ExitStatus::PostInstallScript,
            CseError::Environment(_) => ExitStatus::Environment,
        }
    }
}

pub type Result<T> = std::result::Result<T, CseError>;
