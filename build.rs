// ============================================
// Wayk CSE - build.rs
// ============================================
// Runs BEFORE the executable is compiled and embeds Windows resources:
// 1. The deployment bundle named by WAYK_CSE_BUNDLE_PATH, as RCDATA 101
// 2. The icon named by WAYK_CSE_ICON_PATH, if any
//
// Without WAYK_CSE_BUNDLE_PATH the executable is built empty and needs
// --bundle at run time.
// ============================================

const BUNDLE_RESOURCE_ID: u16 = 101;

fn main() {
    println!("cargo:rerun-if-env-changed=WAYK_CSE_BUNDLE_PATH");
    println!("cargo:rerun-if-env-changed=WAYK_CSE_ICON_PATH");

    let bundle = std::env::var("WAYK_CSE_BUNDLE_PATH").ok().filter(|p| !p.is_empty());
    let icon = std::env::var("WAYK_CSE_ICON_PATH").ok().filter(|p| !p.is_empty());

    if let Some(path) = &bundle {
        println!("cargo:rerun-if-changed={path}");
        if !std::path::Path::new(path).is_file() {
            eprintln!("============================================");
            eprintln!("ERROR: WAYK_CSE_BUNDLE_PATH does not point to a file");
            eprintln!("{path}");
            eprintln!("============================================");
            std::process::exit(1);
        }
    }

    #[cfg(target_os = "windows")]
    {
        let mut res = winres::WindowsResource::new();
        if let Some(path) = &icon {
            res.set_icon(path);
        }
        if let Some(path) = &bundle {
            // .rc string literals need escaped backslashes
            let escaped = path.replace('\\', "\\\\");
            res.append_rc_content(&format!("{BUNDLE_RESOURCE_ID} RCDATA \"{escaped}\""));
        }
        if let Err(e) = res.compile() {
            eprintln!("ERROR: Failed to embed Windows resources: {e}");
            std::process::exit(1);
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        let _ = (icon, BUNDLE_RESOURCE_ID);
    }
}
