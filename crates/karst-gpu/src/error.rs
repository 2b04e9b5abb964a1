//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Errors surfaced by the helper layer.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// I/O error (pipeline-cache persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SPIR-V reflection failed.
    #[error("Shader reflection failed: {0}")]
    Reflection(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
