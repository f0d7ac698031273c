// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Artifact subcommands: detect, validate, load.
//!
//! Each returns a process exit code: 0 on success, 1 when the artifact is
//! invalid or the operation fails.

use std::sync::Arc;

use crate::cli::{ArtifactArgs, EXIT_FAILURE, EXIT_OK};
use crate::error::FactoryError;
use crate::factory::{LoadOptions, ModelFactory};
use crate::loaders::ValidationResult;
use crate::models::ModelDescriptor;

/// Run `detect <PATH>`.
pub fn run_detect(factory: &ModelFactory, args: &ArtifactArgs) -> i32 {
    let report = factory.sniff(&args.path);
    if args.json {
        let value = serde_json::json!({
            "path": args.path,
            "format": report.format,
            "basis": report.basis,
            "warnings": report.warnings,
            "errors": report.errors,
        });
        println!("{}", value);
    } else {
        println!("{}", report.format);
        for w in &report.warnings {
            eprintln!("warning: {}", w);
        }
        for e in &report.errors {
            eprintln!("error: {}", e);
        }
    }
    if report.format.is_known() {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

/// Run `validate <PATH> [--format F]`.
pub fn run_validate(factory: &ModelFactory, args: &ArtifactArgs) -> i32 {
    let result = factory.validate_model(&args.path, args.format);
    if args.json {
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error encoding result: {}", e);
                return EXIT_FAILURE;
            }
        }
    } else {
        print_validation(&result);
    }
    if result.valid {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

/// Run `load <PATH> [--format F] [--id ID]`: load, report, then unload.
pub async fn run_load(factory: Arc<ModelFactory>, args: &ArtifactArgs) -> i32 {
    let mut options = LoadOptions { format_hint: args.format, ..LoadOptions::default() };
    if let Some(id) = &args.id {
        options = options.with_id(id.clone());
    }

    let descriptor = match factory.load_model_async(args.path.clone(), options).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let FactoryError::Validation { errors, .. } = &e {
                for detail in errors.iter().skip(1) {
                    eprintln!("  - {}", detail);
                }
            }
            return EXIT_FAILURE;
        }
    };

    let loaded = factory.get_loaded_models();
    if args.json {
        match serde_json::to_string_pretty(&loaded) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error encoding descriptor: {}", e);
                return EXIT_FAILURE;
            }
        }
    } else {
        for id in loaded.keys() {
            println!("Loaded {}", id);
        }
        print_descriptor(&descriptor);
    }
    factory.clear_loaders();
    EXIT_OK
}

/// Print a validation result to stdout.
pub fn print_validation(result: &ValidationResult) {
    println!("{:<24} {}", "FORMAT", result.format);
    println!("{:<24} {}", "VALID", result.valid);
    println!("{:<24} {}", "ARCHITECTURE", result.architecture);
    println!("{:<24} {}", "EST. MEMORY (bytes)", result.estimated_memory_bytes);
    print_details(&result.metadata, &result.warnings, &result.errors);
}

/// Print a model descriptor to stdout.
pub fn print_descriptor(descriptor: &ModelDescriptor) {
    println!("{:<24} {}", "PATH", descriptor.path.display());
    println!("{:<24} {}", "FORMAT", descriptor.format);
    println!("{:<24} {}", "SIZE (bytes)", descriptor.size_bytes);
    println!("{:<24} {}", "ARCHITECTURE", descriptor.architecture);
    println!("{:<24} {}", "EST. MEMORY (bytes)", descriptor.estimated_memory_bytes);
    if let Some(modified) = descriptor.modified_at {
        println!("{:<24} {}", "MODIFIED", modified.to_rfc3339());
    }
    print_details(&descriptor.metadata, &descriptor.warnings, &descriptor.errors);
}

fn print_details(metadata: &std::collections::BTreeMap<String, String>, warnings: &[String], errors: &[String]) {
    if !metadata.is_empty() {
        println!("{}", "-".repeat(60));
        for (key, value) in metadata {
            println!("{:<24} {}", truncate(key, 23), value);
        }
    }
    for w in warnings {
        println!("warning: {}", w);
    }
    for e in errors {
        println!("error: {}", e);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FactoryConfig;
    use std::path::PathBuf;

    fn args(path: PathBuf) -> ArtifactArgs {
        ArtifactArgs { path, format: None, id: None, json: false, config_file: None }
    }

    #[test]
    fn test_validate_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("model.gguf");
        std::fs::write(&empty, b"").unwrap();
        let factory = ModelFactory::new(FactoryConfig::default());

        assert_eq!(run_validate(&factory, &args(empty.clone())), EXIT_FAILURE);
        assert_eq!(run_detect(&factory, &args(empty)), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_load_reports_and_unloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.dat");
        let mut bytes = b"GGUF".to_vec();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&path, bytes).unwrap();
        let factory = Arc::new(ModelFactory::new(FactoryConfig::default()));

        let mut a = args(path);
        a.json = true;
        assert_eq!(run_load(factory.clone(), &a).await, EXIT_OK);
        assert!(factory.get_loaded_models().is_empty());
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
