//! Model format identification.
//!
//! Holds the closed set of supported formats, the signature table used to
//! recognise them, and the content sniffer that applies it.

pub mod protobuf;
pub mod signature;
mod sniffer;

pub use sniffer::{ContentSniffer, SniffReport};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of artifact formats the factory understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// llama.cpp tagged binary (magic `GGUF`).
    Gguf,
    /// JSON-prefixed tensor dump.
    SafeTensors,
    /// Directory bundle: JSON config plus weight shards.
    Mlx,
    /// Apple protobuf model (`.mlmodel`) or `.mlpackage` bundle.
    CoreMl,
    /// Zip or legacy pickle archive.
    PyTorch,
    /// Protobuf-encoded graph.
    Onnx,
    Unknown,
}

impl ModelFormat {
    /// Every concrete (loadable) format.
    pub const CONCRETE: [ModelFormat; 6] = [
        ModelFormat::Gguf,
        ModelFormat::SafeTensors,
        ModelFormat::Mlx,
        ModelFormat::CoreMl,
        ModelFormat::PyTorch,
        ModelFormat::Onnx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Gguf => "gguf",
            ModelFormat::SafeTensors => "safetensors",
            ModelFormat::Mlx => "mlx",
            ModelFormat::CoreMl => "coreml",
            ModelFormat::PyTorch => "pytorch",
            ModelFormat::Onnx => "onnx",
            ModelFormat::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != ModelFormat::Unknown
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gguf" => Ok(ModelFormat::Gguf),
            "safetensors" => Ok(ModelFormat::SafeTensors),
            "mlx" => Ok(ModelFormat::Mlx),
            "coreml" | "mlmodel" => Ok(ModelFormat::CoreMl),
            "pytorch" | "torch" => Ok(ModelFormat::PyTorch),
            "onnx" => Ok(ModelFormat::Onnx),
            other => Err(format!("unknown model format: {}", other)),
        }
    }
}

/// Best-effort structural family of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelArchitecture {
    Cnn,
    Rnn,
    Transformer,
    Hybrid,
    Feedforward,
    #[default]
    Unknown,
}

impl ModelArchitecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelArchitecture::Cnn => "cnn",
            ModelArchitecture::Rnn => "rnn",
            ModelArchitecture::Transformer => "transformer",
            ModelArchitecture::Hybrid => "hybrid",
            ModelArchitecture::Feedforward => "feedforward",
            ModelArchitecture::Unknown => "unknown",
        }
    }

    /// Map a model family name (GGUF `general.architecture`, MLX `model_type`)
    /// to an architecture. Unrecognised names stay `Unknown`.
    pub fn from_family(family: &str) -> Self {
        const TRANSFORMER_FAMILIES: &[&str] = &[
            "llama", "mistral", "mixtral", "qwen", "qwen2", "qwen3", "phi", "phi2", "phi3",
            "gemma", "gemma2", "gemma3", "gpt2", "gptj", "gpt_neox", "gptneox", "falcon",
            "bert", "nomic-bert", "t5", "bloom", "mpt", "starcoder", "starcoder2", "stablelm",
            "deepseek", "deepseek2", "command-r", "olmo", "internlm2", "baichuan", "chatglm",
        ];
        const RECURRENT_FAMILIES: &[&str] = &["rwkv", "rwkv6", "mamba", "mamba2"];

        let family = family.to_ascii_lowercase();
        if TRANSFORMER_FAMILIES.contains(&family.as_str()) {
            ModelArchitecture::Transformer
        } else if RECURRENT_FAMILIES.contains(&family.as_str()) {
            ModelArchitecture::Rnn
        } else {
            ModelArchitecture::Unknown
        }
    }
}

impl fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a detection decision rested on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionBasis {
    /// Magic bytes or a parsed header.
    Content,
    /// Directory layout.
    Structure,
    /// File extension only.
    Extension,
    /// Nothing matched.
    None,
}
