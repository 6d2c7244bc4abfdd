//! Error type shared by the engine core.
//!
//! Initialisation failures (shader compilation, reflection, device setup, config parsing)
//! surface as [`EngineError`] and are expected to stop the application. Lookups by name
//! never produce an error: they return `Option` and the caller decides.

use std::path::PathBuf;

/// Errors that can occur while building the renderer and its effects.
#[derive(Debug)]
pub enum EngineError {
    /// A file could not be read or written.
    Io(std::io::Error),
    /// A JSON document (config or shader cache entry) was malformed.
    Json(serde_json::Error),
    /// An image could not be decoded.
    Image(image::ImageError),
    /// Model geometry could not be loaded.
    Geometry(String),
    /// WGSL source failed to parse.
    ShaderParse {
        /// Shader name as registered with the compiler.
        name: String,
        /// Parser diagnostics.
        message: String,
    },
    /// WGSL source parsed but failed validation.
    ShaderValidation {
        /// Shader name as registered with the compiler.
        name: String,
        /// Validator diagnostics.
        message: String,
    },
    /// Reflection found something the binding model cannot express.
    Reflection {
        /// Shader name.
        name: String,
        /// What went wrong.
        message: String,
    },
    /// Two shaders disagree about what lives at a binding slot.
    BindingConflict {
        /// Shader that introduced the conflicting binding.
        shader: String,
        /// Name of the conflicting resource.
        resource: String,
        /// Slot that was already taken.
        slot: u32,
    },
    /// A shader with this name was already added to the effect.
    DuplicateShader(String),
    /// A pass with this name was already added to the effect.
    DuplicatePass(String),
    /// A pass referenced a shader that was never added.
    UnknownShader(String),
    /// A shader was plugged into a pass stage it was not compiled for.
    StageMismatch {
        /// Shader name.
        shader: String,
        /// The stage the pass expected.
        expected: &'static str,
    },
    /// The graphics device refused an operation.
    Device(String),
    /// A configuration file was invalid.
    Config {
        /// File that failed to load.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "IO error: {}", e),
            EngineError::Json(e) => write!(f, "JSON error: {}", e),
            EngineError::Image(e) => write!(f, "Image error: {}", e),
            EngineError::Geometry(msg) => write!(f, "Geometry error: {}", msg),
            EngineError::ShaderParse { name, message } => {
                write!(f, "Failed to parse shader '{}': {}", name, message)
            }
            EngineError::ShaderValidation { name, message } => {
                write!(f, "Shader '{}' failed validation: {}", name, message)
            }
            EngineError::Reflection { name, message } => {
                write!(f, "Reflection of shader '{}' failed: {}", name, message)
            }
            EngineError::BindingConflict {
                shader,
                resource,
                slot,
            } => write!(
                f,
                "Shader '{}' binds '{}' at slot {} which is already used by another resource",
                shader, resource, slot
            ),
            EngineError::DuplicateShader(name) => write!(f, "Shader '{}' already exists", name),
            EngineError::DuplicatePass(name) => write!(f, "Effect pass '{}' already exists", name),
            EngineError::UnknownShader(name) => write!(f, "Unknown shader '{}'", name),
            EngineError::StageMismatch { shader, expected } => {
                write!(f, "Shader '{}' is not a {} shader", shader, expected)
            }
            EngineError::Device(msg) => write!(f, "Device error: {}", msg),
            EngineError::Config { path, message } => {
                write!(f, "Invalid config '{}': {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            EngineError::Json(e) => Some(e),
            EngineError::Image(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(e)
    }
}

impl From<image::ImageError> for EngineError {
    fn from(e: image::ImageError) -> Self {
        EngineError::Image(e)
    }
}
