// ============================================
// deploy.rs - Deployment driver
// ============================================
//
// Runs one deployment from start to finish:
//
//   Init → ExtractBundle → ParseOptions → BuildInstallCommand
//        → RunInstaller → RunPostInstallScript (if init.ps1) → Cleanup
//
// The first failing stage ends the run. Cleanup of the extraction
// directory is always attempted afterwards and never changes the result.
//
// Processes and the registry are reached through the Host trait so the
// sequencing can be tested without installing anything.
// ============================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::Archive;
use crate::bundle::{self, Bitness, BundleContentReport, ExtractedBundle, POWERSHELL_FOLDER_NAME, POWERSHELL_MODULE_SUBPATH};
use crate::error::{CseError, Result};
use crate::install::{CommandLineError, InstallCommand, InstallCommandBuilder, QuoteEscaping};
use crate::options::OptionsDocument;
use crate::tools;

// ============================================
// HOST
// ============================================

/// What the driver needs from the machine it runs on
pub trait Host {
    /// Start the installer, wait, and return its exit code
    fn run_installer(&self, command: &InstallCommand) -> anyhow::Result<i32>;

    /// Run a PowerShell command; a non-zero exit is an error
    fn run_powershell(&self, command: &str) -> anyhow::Result<()>;

    /// Agent installation directory recorded by the installer
    fn installation_directory(&self) -> Option<PathBuf>;
}

// ============================================
// STAGES
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ExtractBundle,
    ParseOptions,
    BuildInstallCommand,
    RunInstaller,
    RunPostInstallScript,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::ExtractBundle => "extract bundle",
            Stage::ParseOptions => "parse options",
            Stage::BuildInstallCommand => "build install command",
            Stage::RunInstaller => "run installer",
            Stage::RunPostInstallScript => "run post-install script",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Run one stage, logging its start and any failure
fn stage<T>(stage: Stage, body: impl FnOnce() -> Result<T>) -> Result<T> {
    debug!("Stage: {stage}");
    body().inspect_err(|e| error!("Stage '{stage}' failed: {e}"))
}

// ============================================
// DEPLOYMENT
// ============================================

/// Settings for one run
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Where the bundle is unpacked. A directory that does not exist yet is
    /// created and removed at the end of the run; an existing one gets a
    /// fresh `wayk-cse-<uuid>` subdirectory instead.
    pub extraction_dir: PathBuf,
    pub bitness: Bitness,
    /// Stop after building the installer command line
    pub dry_run: bool,
    /// Leave the extraction directory in place
    pub keep_extracted: bool,
    pub escaping: QuoteEscaping,
}

/// What a successful run did
#[derive(Debug, Clone)]
pub struct DeploymentSummary {
    pub command_line: String,
    /// Directory this run extracted into
    pub extraction_dir: PathBuf,
    pub report: BundleContentReport,
    pub quiet: bool,
    /// None for a dry run
    pub installer_exit_code: Option<i32>,
    pub post_install_script_ran: bool,
}

pub struct Deployment<'a> {
    bundle: &'a [u8],
    config: DeploymentConfig,
}

impl<'a> Deployment<'a> {
    pub fn new(bundle: &'a [u8], config: DeploymentConfig) -> Self {
        Self { bundle, config }
    }

    pub fn run(&self, host: &dyn Host) -> Result<DeploymentSummary> {
        let dir = stage(Stage::Init, || {
            let dir = create_extraction_dir(&self.config.extraction_dir)?;
            info!(
                "Deploying {} agent (extraction directory: {})",
                self.config.bitness,
                dir.display()
            );
            Ok(dir)
        })?;

        let outcome = self.run_stages(host, &dir);

        debug!("Stage: {}", Stage::Cleanup);
        self.cleanup(&dir);

        outcome
    }

    fn run_stages(&self, host: &dyn Host, dir: &Path) -> Result<DeploymentSummary> {
        let bundle = stage(Stage::ExtractBundle, || {
            let mut archive = Archive::open(self.bundle)?;
            let extracted = bundle::extract_all(&mut archive, self.config.bitness, dir)?;
            info!(
                "Extracted {} bundle ({} entries) to {}: {:?}",
                extracted.bitness(),
                archive.count(),
                extracted.directory().display(),
                extracted.report()
            );
            Ok(extracted)
        })?;

        let options = stage(Stage::ParseOptions, || Ok(OptionsDocument::from_path(&bundle.options_file())?))?;

        let command = stage(Stage::BuildInstallCommand, || {
            let command = build_bundle_command(&bundle, &options, self.config.escaping)?;
            info!("Installer command line: {command}");
            Ok(command)
        })?;

        let mut summary = DeploymentSummary {
            command_line: command.command_line().to_string(),
            extraction_dir: dir.to_path_buf(),
            report: *bundle.report(),
            quiet: options.quiet,
            installer_exit_code: None,
            post_install_script_ran: false,
        };

        if self.config.dry_run {
            info!("Dry run, the installer is not started");
            return Ok(summary);
        }

        let exit_code = stage(Stage::RunInstaller, || {
            if bundle.report().download_required() {
                info!("No embedded installer package, the agent will download it");
            }
            let code = host.run_installer(&command).map_err(CseError::InstallerLaunch)?;
            info!("Installer exited with code {code}");
            match code {
                0 => Ok(code),
                _ => Err(CseError::InstallerFailed(code)),
            }
        })?;
        summary.installer_exit_code = Some(exit_code);

        if let Some(script) = bundle.init_script() {
            stage(Stage::RunPostInstallScript, || {
                let module = if options.import_module_required {
                    Some(module_path(host, &bundle).ok_or_else(|| {
                        CseError::PostInstallScript(anyhow!("WaykNow PowerShell module was not found"))
                    })?)
                } else {
                    None
                };
                let command = tools::init_script_command(module.as_deref(), &script);
                debug!("PowerShell command: {command}");
                host.run_powershell(&command).map_err(CseError::PostInstallScript)
            })?;
            summary.post_install_script_ran = true;
        }

        Ok(summary)
    }

    fn cleanup(&self, dir: &Path) {
        if self.config.keep_extracted {
            info!("Keeping extracted files in {}", dir.display());
            return;
        }
        match fs::remove_dir_all(dir) {
            Ok(()) => debug!("Removed {}", dir.display()),
            Err(e) => warn!("Failed to remove {}: {e}", dir.display()),
        }
    }
}

/// Create the directory the run owns. Cleanup only ever removes this one;
/// an existing `extraction_dir` gets a unique subdirectory instead.
fn create_extraction_dir(requested: &Path) -> Result<PathBuf> {
    let dir = if requested.exists() {
        requested.join(format!("wayk-cse-{}", Uuid::new_v4()))
    } else {
        requested.to_path_buf()
    };

    let created = match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).and_then(|()| fs::create_dir(&dir))
        }
        _ => fs::create_dir(&dir),
    };
    created.map_err(|e| CseError::Environment(anyhow!("Failed to create {}: {e}", dir.display())))?;
    Ok(dir)
}

/// Installed module first, then the copy that came with the bundle
fn module_path(host: &dyn Host, bundle: &ExtractedBundle) -> Option<PathBuf> {
    let installed = host.installation_directory().map(|dir| {
        let mut path = dir.join(POWERSHELL_FOLDER_NAME);
        path.extend(POWERSHELL_MODULE_SUBPATH.split('/'));
        path
    });

    match installed {
        Some(path) if path.is_dir() => Some(path),
        Some(path) => {
            warn!("{} does not exist, using the bundled module", path.display());
            bundle.powershell_module()
        }
        None => bundle.powershell_module(),
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn build_bundle_command(
    bundle: &ExtractedBundle,
    options: &OptionsDocument,
    escaping: QuoteEscaping,
) -> std::result::Result<InstallCommand, CommandLineError> {
    let package = bundle.installer_package().map(|p| path_text(&p));
    let branding = bundle.branding_file().map(|p| path_text(&p));
    build_install_command(
        &path_text(&bundle.agent_binary()),
        package.as_deref(),
        branding.as_deref(),
        options,
        escaping,
    )
}

/// Turn parsed options into the installer command line.
///
/// Options are appended in this order: enrollment, config overrides,
/// install directory, desktop shortcut, start menu shortcut, suppress
/// launch, branding file.
pub fn build_install_command(
    program: &str,
    package: Option<&str>,
    branding_file: Option<&str>,
    options: &OptionsDocument,
    escaping: QuoteEscaping,
) -> std::result::Result<InstallCommand, CommandLineError> {
    let mut builder = InstallCommandBuilder::new(program, package, escaping)?;

    match (options.enrollment_url.as_deref(), options.enrollment_token.as_deref()) {
        (Some(url), Some(token)) => builder.set_enrollment_options(url, token)?,
        (None, None) => {}
        _ => {
            return Err(CommandLineError::InvalidArgs(
                "enrollment requires both enrollment.url and enrollment.token".to_string(),
            ))
        }
    }

    for config in &options.config {
        builder.set_config_option(&config.key, &config.value)?;
    }

    if let Some(dir) = options.install_directory.as_deref() {
        builder.set_install_directory(dir)?;
    }
    if !options.create_desktop_shortcut {
        builder.disable_desktop_shortcut()?;
    }
    if !options.create_start_menu_shortcut {
        builder.disable_start_menu_shortcut()?;
    }
    if options.start_after_install {
        builder.disable_suppress_launch()?;
    }
    if let Some(branding) = branding_file {
        builder.set_branding_file(branding)?;
    }

    Ok(builder.build())
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::zip_bytes;
    use crate::error::ExitStatus;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeHost {
        exit_code: i32,
        launch_fails: bool,
        script_fails: bool,
        install_dir: Option<PathBuf>,
        installer_calls: RefCell<Vec<String>>,
        powershell_calls: RefCell<Vec<String>>,
    }

    impl Host for FakeHost {
        fn run_installer(&self, command: &InstallCommand) -> anyhow::Result<i32> {
            self.installer_calls.borrow_mut().push(command.command_line().to_string());
            if self.launch_fails {
                anyhow::bail!("cannot start {}", command.program());
            }
            Ok(self.exit_code)
        }

        fn run_powershell(&self, command: &str) -> anyhow::Result<()> {
            self.powershell_calls.borrow_mut().push(command.to_string());
            if self.script_fails {
                anyhow::bail!("PowerShell exited with 1");
            }
            Ok(())
        }

        fn installation_directory(&self) -> Option<PathBuf> {
            self.install_dir.clone()
        }
    }

    const OPTIONS: &[u8] = br#"{
        "enrollment": { "url": "http://my-url.com", "token": "1234567890" },
        "install": { "startAfterInstall": false },
        "config": { "analyticsEnabled": "false" }
    }"#;

    fn config(dir: &Path) -> DeploymentConfig {
        DeploymentConfig {
            extraction_dir: dir.to_path_buf(),
            bitness: Bitness::X64,
            dry_run: false,
            keep_extracted: false,
            escaping: QuoteEscaping::Single,
        }
    }

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("cse");
        (root, dir)
    }

    #[test]
    fn test_end_to_end_command_line() {
        let options = OptionsDocument::from_slice(OPTIONS).unwrap();
        let command = build_install_command(
            "C:\\wayk.exe",
            Some("C:\\installer.msi"),
            None,
            &options,
            QuoteEscaping::Single,
        )
        .unwrap();

        assert_eq!(
            command.command_line(),
            "\"C:\\wayk.exe\" install-local-package \"C:\\installer.msi\" \
             ENROLL_DEN_URL=\"http://my-url.com\" ENROLL_TOKEN_ID=\"1234567890\" \
             CONFIG_ANALYTICS_ENABLED=\"false\""
        );
    }

    #[test]
    fn test_option_order() {
        let options = OptionsDocument::from_slice(
            br#"{
                "install": {
                    "startAfterInstall": true,
                    "createDesktopShortcut": false,
                    "createStartMenuShortcut": false,
                    "installPath": "D:\\wayk"
                },
                "config": { "zeta": 1, "alpha": "a" }
            }"#,
        )
        .unwrap();
        let command =
            build_install_command("C:\\wayk.exe", None, Some("C:\\b.zip"), &options, QuoteEscaping::Single).unwrap();

        assert_eq!(
            command.command_line(),
            "\"C:\\wayk.exe\" install CONFIG_ZETA=\"1\" CONFIG_ALPHA=\"a\" INSTALLDIR=\"D:\\wayk\" \
             INSTALLDESKTOPSHORTCUT=\"\" INSTALLSTARTMENUSHORTCUT=\"\" SUPPRESSLAUNCH=\"\" \
             BRANDING_FILE=\"C:\\b.zip\""
        );
    }

    #[test]
    fn test_half_enrollment_is_rejected() {
        let options = OptionsDocument::from_slice(br#"{"enrollment":{"url":"http://den"}}"#).unwrap();
        let result = build_install_command("C:\\wayk.exe", None, None, &options, QuoteEscaping::Single);
        assert!(matches!(result, Err(CommandLineError::InvalidArgs(_))));
    }

    #[test]
    fn test_successful_run() {
        let bytes = zip_bytes(&[
            ("options.json", OPTIONS),
            ("WaykNow_x64.exe", b"MZ"),
            ("Installer_x64.msi", b"msi"),
        ]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();

        let summary = Deployment::new(&bytes, config(&dir)).run(&host).unwrap();

        assert_eq!(summary.installer_exit_code, Some(0));
        assert!(!summary.post_install_script_ran);
        assert!(summary.report.has_installer);
        assert!(summary.command_line.contains(" install-local-package "));
        assert!(summary.command_line.ends_with("CONFIG_ANALYTICS_ENABLED=\"false\""));
        assert_eq!(*host.installer_calls.borrow(), vec![summary.command_line.clone()]);
        assert!(host.powershell_calls.borrow().is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn test_download_when_no_package() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ")]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();

        let summary = Deployment::new(&bytes, config(&dir)).run(&host).unwrap();

        assert!(summary.report.download_required());
        assert!(summary.command_line.ends_with("\" install"));
    }

    #[test]
    fn test_dry_run_skips_installer() {
        let bytes = zip_bytes(&[("options.json", OPTIONS), ("WaykNow_x64.exe", b"MZ"), ("init.ps1", b"")]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();
        let mut cfg = config(&dir);
        cfg.dry_run = true;

        let summary = Deployment::new(&bytes, cfg).run(&host).unwrap();

        assert_eq!(summary.installer_exit_code, None);
        assert!(host.installer_calls.borrow().is_empty());
        assert!(host.powershell_calls.borrow().is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn test_keep_extracted() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ")]);
        let (_root, dir) = scratch();
        let mut cfg = config(&dir);
        cfg.keep_extracted = true;

        Deployment::new(&bytes, cfg).run(&FakeHost::default()).unwrap();

        assert!(dir.join("options.json").exists());
    }

    #[test]
    fn test_existing_directory_is_not_removed() {
        let bytes = zip_bytes(&[("options.json", OPTIONS), ("WaykNow_x64.exe", b"MZ")]);
        let root = tempfile::tempdir().unwrap();
        let documents = root.path().join("Documents");
        fs::create_dir(&documents).unwrap();
        fs::write(documents.join("thesis.docx"), b"chapter one").unwrap();
        let mut cfg = config(&documents);
        cfg.dry_run = true;

        let summary = Deployment::new(&bytes, cfg).run(&FakeHost::default()).unwrap();

        assert!(summary.extraction_dir.starts_with(&documents));
        assert_ne!(summary.extraction_dir, documents);
        assert!(!summary.extraction_dir.exists());
        assert_eq!(fs::read(documents.join("thesis.docx")).unwrap(), b"chapter one");
        assert_eq!(fs::read_dir(&documents).unwrap().count(), 1);
    }

    #[test]
    fn test_existing_directory_survives_failed_run() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("notes.txt"), b"keep me").unwrap();

        let err = Deployment::new(b"not a zip", config(root.path()))
            .run(&FakeHost::default())
            .unwrap_err();

        assert_eq!(err.exit_status(), ExitStatus::BundleExtraction);
        assert!(root.path().join("notes.txt").is_file());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_new_directory_is_used_as_is() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ")]);
        let (_root, dir) = scratch();
        let mut cfg = config(&dir);
        cfg.keep_extracted = true;

        let summary = Deployment::new(&bytes, cfg).run(&FakeHost::default()).unwrap();

        assert_eq!(summary.extraction_dir, dir);
        assert!(dir.join("WaykNow_x64.exe").is_file());
    }

    #[test]
    fn test_missing_options_fails_extraction() {
        let bytes = zip_bytes(&[("WaykNow_x64.exe", b"MZ")]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();

        let err = Deployment::new(&bytes, config(&dir)).run(&host).unwrap_err();

        assert_eq!(err.exit_status(), ExitStatus::BundleExtraction);
        assert!(host.installer_calls.borrow().is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn test_corrupt_bundle() {
        let (_root, dir) = scratch();
        let err = Deployment::new(b"not a zip", config(&dir))
            .run(&FakeHost::default())
            .unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::BundleExtraction);
    }

    #[test]
    fn test_invalid_options() {
        let bytes = zip_bytes(&[("options.json", b"{{{{"), ("WaykNow_x64.exe", b"MZ")]);
        let (_root, dir) = scratch();

        let err = Deployment::new(&bytes, config(&dir))
            .run(&FakeHost::default())
            .unwrap_err();

        assert_eq!(err.exit_status(), ExitStatus::OptionsParsing);
        assert!(!dir.exists());
    }

    #[test]
    fn test_bad_alias_fails_command_line() {
        let bytes = zip_bytes(&[
            ("options.json", br#"{"config":{"qualityMode":"ultra"}}"#),
            ("WaykNow_x64.exe", b"MZ"),
        ]);
        let (_root, dir) = scratch();

        let err = Deployment::new(&bytes, config(&dir))
            .run(&FakeHost::default())
            .unwrap_err();

        assert_eq!(err.exit_status(), ExitStatus::CommandLine);
    }

    #[test]
    fn test_installer_failure_stops_run() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ"), ("init.ps1", b"")]);
        let (_root, dir) = scratch();
        let host = FakeHost {
            exit_code: 1603,
            ..Default::default()
        };

        let err = Deployment::new(&bytes, config(&dir)).run(&host).unwrap_err();

        assert!(matches!(err, CseError::InstallerFailed(1603)));
        assert_eq!(err.exit_status(), ExitStatus::InstallerFailed);
        assert!(host.powershell_calls.borrow().is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn test_installer_launch_failure() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ")]);
        let (_root, dir) = scratch();
        let host = FakeHost {
            launch_fails: true,
            ..Default::default()
        };

        let err = Deployment::new(&bytes, config(&dir)).run(&host).unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::InstallerLaunch);
    }

    #[test]
    fn test_post_install_script_with_bundled_module() {
        let bytes = zip_bytes(&[
            ("options.json", br#"{"postInstallScript":{"importWaykNowModule":true}}"#),
            ("WaykNow_x64.exe", b"MZ"),
            ("init.ps1", b"Set-WaykNowConfig"),
            ("PowerShell/Modules/WaykNow/WaykNow.psd1", b"@{}"),
        ]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();

        let summary = Deployment::new(&bytes, config(&dir)).run(&host).unwrap();

        assert!(summary.post_install_script_ran);
        let calls = host.powershell_calls.borrow();
        assert_eq!(calls.len(), 1);
        let module = dir.join("PowerShell").join("Modules").join("WaykNow");
        let script = dir.join("init.ps1");
        assert_eq!(calls[0], tools::init_script_command(Some(module.as_path()), &script));
    }

    #[test]
    fn test_post_install_script_prefers_installed_module() {
        let install_root = tempfile::tempdir().unwrap();
        let installed = install_root.path().join("PowerShell").join("Modules").join("WaykNow");
        fs::create_dir_all(&installed).unwrap();

        let bytes = zip_bytes(&[
            ("options.json", br#"{"postInstallScript":{"importWaykNowModule":true}}"#),
            ("WaykNow_x64.exe", b"MZ"),
            ("init.ps1", b""),
            ("PowerShell/Modules/WaykNow/WaykNow.psd1", b"@{}"),
        ]);
        let (_root, dir) = scratch();
        let host = FakeHost {
            install_dir: Some(install_root.path().to_path_buf()),
            ..Default::default()
        };

        Deployment::new(&bytes, config(&dir)).run(&host).unwrap();

        let calls = host.powershell_calls.borrow();
        assert_eq!(calls[0], tools::init_script_command(Some(installed.as_path()), &dir.join("init.ps1")));
    }

    #[test]
    fn test_post_install_script_without_module_import() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ"), ("init.ps1", b"")]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();

        Deployment::new(&bytes, config(&dir)).run(&host).unwrap();

        let calls = host.powershell_calls.borrow();
        assert_eq!(calls[0], tools::init_script_command(None, &dir.join("init.ps1")));
    }

    #[test]
    fn test_missing_module_fails_script() {
        let bytes = zip_bytes(&[
            ("options.json", br#"{"postInstallScript":{"importWaykNowModule":true}}"#),
            ("WaykNow_x64.exe", b"MZ"),
            ("init.ps1", b""),
        ]);
        let (_root, dir) = scratch();
        let host = FakeHost::default();

        let err = Deployment::new(&bytes, config(&dir)).run(&host).unwrap_err();

        assert_eq!(err.exit_status(), ExitStatus::PostInstallScript);
        assert!(host.powershell_calls.borrow().is_empty());
    }

    #[test]
    fn test_script_failure() {
        let bytes = zip_bytes(&[("options.json", b"{}"), ("WaykNow_x64.exe", b"MZ"), ("init.ps1", b"exit 1")]);
        let (_root, dir) = scratch();
        let host = FakeHost {
            script_fails: true,
            ..Default::default()
        };

        let err = Deployment::new(&bytes, config(&dir)).run(&host).unwrap_err();

        assert_eq!(err.exit_status(), ExitStatus::PostInstallScript);
        assert_eq!(host.installer_calls.borrow().len(), 1);
        assert!(!dir.exists());
    }
}
