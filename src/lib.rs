// ============================================
// Wayk CSE - lib.rs
// ============================================
// Building blocks of the custom standalone executable:
//
//   archive  - in-memory bundle archive (list / extract entries)
//   bundle   - well-known bundle assets and their extraction
//   options  - options.json parsing
//   install  - agent installer command line
//   deploy   - the deployment driver
//   tools    - OS glue (mutex, resources, registry, processes)
//   error    - run-level errors and exit codes
//   logging  - log file setup
// ============================================

pub mod archive;
pub mod bundle;
pub mod deploy;
pub mod error;
pub mod install;
pub mod logging;
pub mod options;
pub mod tools;
