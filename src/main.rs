//! model-factory command-line entry point.
//!
//! ## Subcommands
//!
//! - `model-factory detect <PATH>` - Print the detected format (exit 0/1)
//! - `model-factory validate <PATH>` - Structural validation (exit 0/1)
//! - `model-factory load <PATH>` - Load, describe, then unload (exit 0/1)
//! - `model-factory config show|defaults` - Print configuration as TOML

use std::process::ExitCode;
use std::sync::Arc;

use model_factory::cli::{self, config_cmd, models_cmd, ArtifactArgs, EXIT_USAGE};
use model_factory::config::FactoryConfig;
use model_factory::telemetry::init_logging;
use model_factory::ModelFactory;

/// CLI log level when `MODEL_FACTORY_LOG_LEVEL` is unset.
const CLI_LOG_LEVEL: &str = "warn";

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "detect" | "validate" | "load" => {
            let parsed = match cli::parse_artifact_args(&args[2..]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    print_command_help(command);
                    return ExitCode::from(EXIT_USAGE as u8);
                }
            };
            let factory = match build_factory(&parsed) {
                Ok(factory) => factory,
                Err(code) => return code,
            };
            let code = match command {
                "detect" => models_cmd::run_detect(&factory, &parsed),
                "validate" => models_cmd::run_validate(&factory, &parsed),
                _ => models_cmd::run_load(factory, &parsed).await,
            };
            ExitCode::from(code as u8)
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => ExitCode::from(config_cmd::run_show() as u8),
                "defaults" => ExitCode::from(config_cmd::run_defaults() as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::from(EXIT_USAGE as u8)
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("model-factory {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::from(EXIT_USAGE as u8)
        }
    }
}

/// Load configuration, install logging and build the factory.
fn build_factory(args: &ArtifactArgs) -> Result<Arc<ModelFactory>, ExitCode> {
    let config = match &args.config_file {
        Some(path) => FactoryConfig::from_toml_file(path).map_err(|e| {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_USAGE as u8)
        })?,
        None => {
            let mut config = FactoryConfig::from_env();
            if std::env::var_os("MODEL_FACTORY_LOG_LEVEL").is_none() {
                config.log.level = CLI_LOG_LEVEL.to_string();
            }
            config
        }
    };

    if let Err(e) = init_logging(&config.log) {
        eprintln!("Error: {}", e);
        return Err(ExitCode::from(EXIT_USAGE as u8));
    }
    Ok(Arc::new(ModelFactory::new(config)))
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "model-factory - Model artifact detection, validation and loading v{}

USAGE:
    model-factory [COMMAND] [OPTIONS]

COMMANDS:
    detect       Print the format of a model artifact
    validate     Check an artifact's structure without loading weights
    load         Load an artifact, print its descriptor, then unload it
    config       Show configuration (show, defaults)
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help     Show help for command
    -V, --version  Show version information

EXAMPLES:
    model-factory detect ./llama-3-8b.Q4_K_M.gguf
    model-factory validate ./resnet50.onnx --json
    model-factory load ./mistral-7b-mlx --format mlx
    model-factory config show

ENVIRONMENT:
    MODEL_FACTORY_SNIFF_PREFIX          Bytes read when sniffing (default: 65536)
    MODEL_FACTORY_MAX_HEADER            Largest header parsed, bytes (default: 100000000)
    MODEL_FACTORY_MAX_METADATA_ENTRIES  Largest key/tensor/node count (default: 1000000)
    MODEL_FACTORY_MEMORY_LIMIT          Reject loads estimated above this many bytes
    MODEL_FACTORY_USE_MMAP              Memory-map weights on load (default: true)
    MODEL_FACTORY_LOG_FORMAT            json or pretty (default: json)
    MODEL_FACTORY_LOG_LEVEL             Log filter (default for the CLI: warn)
    MODEL_FACTORY_LOG_FILE              Write logs to this file instead of stderr

EXIT CODES:
    0  Success / Valid
    1  Failure / Invalid artifact
    2  Usage or configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "detect" => {
            eprintln!(
                "model-factory detect - Identify an artifact's format

USAGE:
    model-factory detect <PATH> [--json] [--config FILE]

DESCRIPTION:
    Reads a bounded prefix of the file (or lists the directory) and prints
    the detected format. Content signatures win over the extension; a
    disagreement is reported as a warning.

EXIT CODES:
    0  A known format was detected
    1  The format could not be determined
"
            );
        }
        "validate" => {
            eprintln!(
                "model-factory validate - Structural validation

USAGE:
    model-factory validate <PATH> [--format F] [--json] [--config FILE]

OPTIONS:
    --format F     Skip detection and validate as F
                   (gguf, safetensors, mlx, coreml, pytorch, onnx)
    --json         Output the validation result as JSON

DESCRIPTION:
    Parses headers and metadata without reading tensor payloads. Reports
    architecture, estimated memory, warnings and errors.

EXIT CODES:
    0  Artifact is valid
    1  Artifact is invalid
"
            );
        }
        "load" => {
            eprintln!(
                "model-factory load - Load an artifact

USAGE:
    model-factory load <PATH> [--format F] [--id ID] [--json] [--config FILE]

OPTIONS:
    --format F     Skip detection and load as F
    --id ID        Register under ID instead of the derived id
    --json         Output loaded models as JSON

DESCRIPTION:
    Runs detection, validation and the memory guard, materialises the model
    through the execution backend, prints its descriptor and unloads it.

EXIT CODES:
    0  Model loaded
    1  Detection, validation or loading failed
"
            );
        }
        "config" => {
            eprintln!(
                "model-factory config - Configuration

USAGE:
    model-factory config show       Effective configuration (environment applied)
    model-factory config defaults   Built-in defaults
"
            );
        }
        _ => {
            eprintln!("No detailed help for: {}", command);
            print_usage();
        }
    }
}
