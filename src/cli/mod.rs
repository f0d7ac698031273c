// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for inspecting model artifacts.
//!
//! ## Usage
//!
//! ```bash
//! model-factory detect   <PATH>                 # Print the detected format
//! model-factory validate <PATH> [--format F]    # Structural check, exit 1 if invalid
//! model-factory load     <PATH> [--id ID]       # Load, print descriptor, unload
//! model-factory config show                     # Print effective configuration
//! ```

pub mod config_cmd;
pub mod models_cmd;

use std::path::PathBuf;

use crate::formats::ModelFormat;

/// Command succeeded.
pub const EXIT_OK: i32 = 0;
/// Artifact invalid or operation failed.
pub const EXIT_FAILURE: i32 = 1;
/// Bad command line or configuration.
pub const EXIT_USAGE: i32 = 2;

/// Arguments shared by `detect`, `validate` and `load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactArgs {
    pub path: PathBuf,
    pub format: Option<ModelFormat>,
    pub id: Option<String>,
    pub json: bool,
    pub config_file: Option<PathBuf>,
}

/// Parse `<PATH> [--format F] [--id ID] [--json] [--config FILE]`.
pub fn parse_artifact_args(args: &[String]) -> Result<ArtifactArgs, String> {
    let mut path = None;
    let mut format = None;
    let mut id = None;
    let mut json = false;
    let mut config_file = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--format" | "-f" => {
                let value = iter.next().ok_or("--format requires a value")?;
                let parsed = value.parse::<ModelFormat>().map_err(|e| e.to_string())?;
                format = Some(parsed);
            }
            "--id" => id = Some(iter.next().ok_or("--id requires a value")?.clone()),
            "--config" => config_file = Some(PathBuf::from(iter.next().ok_or("--config requires a value")?)),
            flag if flag.starts_with("--") => return Err(format!("unknown option: {}", flag)),
            value if path.is_none() => path = Some(PathBuf::from(value)),
            value => return Err(format!("unexpected argument: {}", value)),
        }
    }

    Ok(ArtifactArgs {
        path: path.ok_or("missing <PATH> argument")?,
        format,
        id,
        json,
        config_file,
    })
}
