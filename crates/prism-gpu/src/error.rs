//! GPU error types.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// Broad failure classes.
///
/// None of them is recovered from; the class tells the caller what went wrong,
/// not whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device or the renderer setup cannot satisfy a requirement.
    Configuration,
    /// A Vulkan call failed at runtime.
    GpuOperation,
    /// A programming-contract violation, such as an out-of-range image index.
    InvalidState,
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// No memory type satisfies the requested property mask.
    #[error("No memory type in mask {type_bits:#x} supports {properties:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// The shader stage list does not describe a valid ray tracing pipeline.
    #[error("Invalid shader stages: {0}")]
    InvalidShaderStages(String),

    /// A shader binary could not be read.
    #[error("Failed to load shader {}: {source}", path.display())]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Shader group handles could not be read back from the pipeline.
    #[error("Failed to get ray tracing shader group handles: {0}")]
    ShaderGroupHandles(vk::Result),

    /// Swapchain image acquisition did not return `SUCCESS`.
    #[error("Failed to acquire next image: {0}")]
    AcquireImage(vk::Result),

    /// Presentation did not return `SUCCESS`.
    #[error("Failed to present: {0}")]
    Present(vk::Result),

    /// The presentation engine handed back an index outside the swapchain.
    #[error("Image index {index} out of range for {count} swapchain images")]
    ImageIndexOutOfRange { index: u32, count: u32 },

    /// A handle required for the operation is null.
    #[error("Null handle: {0}")]
    NullHandle(&'static str),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuitableDevice
            | Self::ExtensionNotSupported(_)
            | Self::NoCompatibleMemoryType { .. }
            | Self::InvalidShaderStages(_)
            | Self::ShaderLoad { .. } => ErrorKind::Configuration,
            Self::ImageIndexOutOfRange { .. } | Self::NullHandle(_) | Self::InvalidState(_) => {
                ErrorKind::InvalidState
            }
            Self::Vulkan(_)
            | Self::SurfaceCreation(_)
            | Self::SwapchainCreation(_)
            | Self::PipelineCreation(_)
            | Self::ShaderGroupHandles(_)
            | Self::AcquireImage(_)
            | Self::Present(_)
            | Self::Other(_) => ErrorKind::GpuOperation,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failures_are_configuration_errors() {
        let missing = GpuError::NoCompatibleMemoryType {
            type_bits: 0b101,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert_eq!(missing.kind(), ErrorKind::Configuration);
        assert_eq!(
            GpuError::ExtensionNotSupported("VK_KHR_ray_tracing_pipeline".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            GpuError::InvalidShaderStages("2 stages".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn runtime_failures_are_gpu_operation_errors() {
        assert_eq!(
            GpuError::AcquireImage(vk::Result::ERROR_OUT_OF_DATE_KHR).kind(),
            ErrorKind::GpuOperation
        );
        assert_eq!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST).kind(),
            ErrorKind::GpuOperation
        );
        assert_eq!(
            GpuError::PipelineCreation("boom".into()).kind(),
            ErrorKind::GpuOperation
        );
    }

    #[test]
    fn contract_violations_are_invalid_state() {
        let err = GpuError::ImageIndexOutOfRange { index: 3, count: 3 };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            err.to_string(),
            "Image index 3 out of range for 3 swapchain images"
        );
        assert_eq!(
            GpuError::NullHandle("image-acquired semaphore").kind(),
            ErrorKind::InvalidState
        );
    }
}
