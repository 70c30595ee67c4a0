// ============================================
// Wayk CSE - main.rs
// ============================================
// Entry point of the custom standalone executable.
//
// The program flow is:
// 1. Parse arguments and open the log file
// 2. Make sure no other instance is running
// 3. Load the bundle (embedded resource, or --bundle file)
// 4. Run the deployment (extract, parse, build, install, script, cleanup)
// 5. Exit with the code matching the outcome
// ============================================

use std::path::PathBuf;

use clap::Parser;
use log::{error, info, LevelFilter};
use uuid::Uuid;

use wayk_cse::bundle::Bitness;
use wayk_cse::deploy::{Deployment, DeploymentConfig, DeploymentSummary};
use wayk_cse::error::{CseError, ExitStatus};
use wayk_cse::install::QuoteEscaping;
use wayk_cse::logging;
use wayk_cse::tools::{self, InstanceGuard, SystemHost};

// ============================================
// ARGUMENTS
// ============================================

#[derive(Parser, Debug)]
#[command(
    name = "wayk_cse",
    version,
    about = "Deploys and enrolls the Wayk agent from the bundle embedded in this executable"
)]
struct Args {
    /// Bundle archive to use instead of the embedded one
    #[arg(long, value_name = "FILE", env = "WAYK_CSE_BUNDLE")]
    bundle: Option<PathBuf>,

    /// Extraction directory; ${VAR} references are expanded
    #[arg(long, value_name = "DIR", env = "WAYK_CSE_EXTRACTION_DIR")]
    extraction_dir: Option<String>,

    /// Agent bitness to deploy (x86 or x64); detected when omitted
    #[arg(long, value_name = "BITNESS")]
    bitness: Option<Bitness>,

    /// Log file (defaults to wayk_cse.log in the temp directory)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,

    /// Print the installer command line instead of running the installer
    #[arg(long)]
    dry_run: bool,

    /// Keep the extraction directory after the run
    #[arg(long)]
    keep_extracted: bool,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() {
    let args = Args::parse();

    let log_path = args.log_file.clone().unwrap_or_else(logging::default_log_path);
    if let Err(e) = logging::init(&log_path, args.log_level) {
        eprintln!("Warning: logging disabled: {e:#}");
    }
    info!("Wayk CSE v{}", env!("CARGO_PKG_VERSION"));

    let status = match run(&args) {
        Ok(summary) => {
            if args.dry_run {
                println!("{}", summary.command_line);
            } else if !summary.quiet {
                println!("Wayk agent installed");
            }
            info!(
                "Deployment finished (installer exit code: {:?}, post-install script: {})",
                summary.installer_exit_code, summary.post_install_script_ran
            );
            ExitStatus::Success
        }
        Err(e) => {
            let status = e.exit_status();
            error!("Deployment failed ({}): {e:#}", status.code());
            eprintln!("Error: {e}");
            status
        }
    };

    std::process::exit(status.process_code());
}

fn run(args: &Args) -> Result<DeploymentSummary, CseError> {
    let _guard = InstanceGuard::acquire()
        .map_err(CseError::Environment)?
        .ok_or(CseError::MultipleInstances)?;

    let bundle = match &args.bundle {
        Some(path) => {
            info!("Using bundle file {}", path.display());
            tools::load_bundle_file(path)
        }
        None => tools::load_embedded_bundle(),
    }
    .map_err(CseError::BundleUnavailable)?;

    let extraction_dir = match &args.extraction_dir {
        Some(dir) => PathBuf::from(tools::expand_env_vars(dir).map_err(CseError::Environment)?),
        None => std::env::temp_dir().join(format!("wayk-cse-{}", Uuid::new_v4())),
    };

    let config = DeploymentConfig {
        extraction_dir,
        bitness: args.bitness.unwrap_or_else(Bitness::detect),
        dry_run: args.dry_run,
        keep_extracted: args.keep_extracted,
        escaping: QuoteEscaping::default(),
    };

    Deployment::new(&bundle, config).run(&SystemHost)
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "wayk_cse",
            "--bundle",
            "bundle.zip",
            "--bitness",
            "x86",
            "--log-level",
            "debug",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(args.bundle, Some(PathBuf::from("bundle.zip")));
        assert_eq!(args.bitness, Some(Bitness::X86));
        assert_eq!(args.log_level, LevelFilter::Debug);
        assert!(args.dry_run);
        assert!(!args.keep_extracted);
    }

    #[test]
    fn test_reject_unknown_bitness() {
        assert!(Args::try_parse_from(["wayk_cse", "--bitness", "arm"]).is_err());
    }
}
