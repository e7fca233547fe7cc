//! GPU buffers.
//!
//! - [`BufferUsage`] defines how a buffer will be used (vertex, index, uniform, storage)
//! - [`GpuBuffer`] owns a host-visible buffer created through a [`GpuBackend`]
//!
//! All buffers the frame core deals with are host visible: geometry is
//! uploaded by writing straight into it, and per-image uniform duplicates are
//! rewritten every frame.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vkframe_rhi::buffer::{BufferUsage, GpuBuffer};
//! use vkframe_rhi::headless::HeadlessBackend;
//!
//! # fn example() -> Result<(), vkframe_rhi::RhiError> {
//! let backend = Arc::new(HeadlessBackend::default());
//! let vertices: [f32; 6] = [0.0, 0.5, -0.5, -0.5, 0.5, -0.5];
//! let vertex_buffer =
//!     GpuBuffer::with_data(backend, BufferUsage::Vertex, bytemuck::cast_slice(&vertices))?;
//! # let _ = vertex_buffer;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};

/// Intended use of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex buffer for vertex input.
    Vertex,
    /// Index buffer for indexed drawing.
    Index,
    /// Uniform buffer for shader constants.
    Uniform,
    /// Storage buffer for shader read/write.
    Storage,
}

impl BufferUsage {
    /// Vulkan usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }

    /// Memory location for the allocator. Every usage is host visible.
    pub fn memory_location(self) -> MemoryLocation {
        MemoryLocation::CpuToGpu
    }

    /// Name used in allocation labels and logs.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
        }
    }
}

/// Checks that `offset..offset + len` lies inside a buffer of `size` bytes.
pub fn check_range(offset: vk::DeviceSize, len: usize, size: vk::DeviceSize) -> RhiResult<()> {
    let len = len as vk::DeviceSize;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RhiError::OutOfBounds {
            offset,
            size: len,
            capacity: size,
        }),
    }
}

/// Owned host-visible buffer.
pub struct GpuBuffer<B: GpuBackend> {
    backend: Arc<B>,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: BufferUsage,
}

impl<B: GpuBackend> GpuBuffer<B> {
    /// Creates an uninitialized buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or allocation fails.
    pub fn new(backend: Arc<B>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let buffer = backend.create_buffer(usage, size)?;
        Ok(Self {
            backend,
            buffer,
            size,
            usage,
        })
    }

    /// Creates a buffer holding `data`.
    pub fn with_data(backend: Arc<B>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(backend, usage, data.len() as vk::DeviceSize)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::OutOfBounds`] if the write exceeds the buffer.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        check_range(offset, data.len(), self.size)?;
        self.backend.write_buffer(self.buffer, offset, data)
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> RhiResult<Vec<u8>> {
        check_range(offset, len, self.size)?;
        self.backend.read_buffer(self.buffer, offset, len)
    }

    /// Returns the raw buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Returns the buffer usage.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl<B: GpuBackend> Drop for GpuBuffer<B> {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.buffer);
        debug!("Destroyed {} buffer ({} bytes)", self.usage.name(), self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER)
        );
        assert!(
            BufferUsage::Index
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::INDEX_BUFFER)
        );
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert!(
            BufferUsage::Storage
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::STORAGE_BUFFER)
        );
    }

    #[test]
    fn test_every_usage_is_host_visible() {
        for usage in [
            BufferUsage::Vertex,
            BufferUsage::Index,
            BufferUsage::Uniform,
            BufferUsage::Storage,
        ] {
            assert_eq!(usage.memory_location(), MemoryLocation::CpuToGpu);
        }
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(8, 8, 16).is_ok());
        assert!(matches!(
            check_range(8, 9, 16),
            Err(RhiError::OutOfBounds { offset: 8, size: 9, capacity: 16 })
        ));
        assert!(check_range(u64::MAX, 1, 16).is_err());
    }

    #[test]
    fn test_buffer_round_trip() {
        let backend = Arc::new(HeadlessBackend::default());
        let buffer = GpuBuffer::with_data(backend, BufferUsage::Uniform, &[1, 2, 3, 4]).unwrap();
        buffer.write(2, &[9]).unwrap();
        assert_eq!(buffer.read(0, 4).unwrap(), vec![1, 2, 9, 4]);
        assert!(buffer.write(4, &[0]).is_err());
    }

    #[test]
    fn test_zero_sized_buffer_is_rejected() {
        let backend = Arc::new(HeadlessBackend::default());
        assert!(GpuBuffer::new(backend, BufferUsage::Vertex, 0).is_err());
    }
}
