//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Shader module error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// A descriptor pool has no room for the requested set.
    ///
    /// This is the growth signal of the binding pool, not a fatal error by
    /// itself.
    #[error("Descriptor pool out of memory")]
    OutOfPoolMemory,

    /// The binding pool could not grow enough within its retry ceiling.
    #[error("Binding pool exhausted after {attempts} recreation attempt(s)")]
    PoolExhausted {
        /// Number of recreations attempted before giving up.
        attempts: u32,
    },

    /// Binding writes or a bound set do not match the expected layout.
    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Renderer configuration the frame core cannot run with.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A call arrived in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A buffer access fell outside the buffer.
    #[error("Out of bounds: offset {offset} + size {size} exceeds {capacity} bytes")]
    OutOfBounds {
        /// Requested byte offset.
        offset: u64,
        /// Requested byte count.
        size: u64,
        /// Buffer size in bytes.
        capacity: u64,
    },
}

impl RhiError {
    /// Returns true for swapchain results recovered by recreation.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            RhiError::VulkanError(ash::vk::Result::ERROR_OUT_OF_DATE_KHR)
                | RhiError::VulkanError(ash::vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
