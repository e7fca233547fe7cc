//! Vertex input layouts.
//!
//! A pipeline consumes one interleaved vertex buffer at binding 0. Its layout
//! is an ordered list of `(format, offset)` pairs; shader locations follow
//! list order.
//!
//! [`ColorVertex`] is a ready-made layout for simple colored geometry.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Numeric format of one vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// One 32-bit float.
    Float32,
    /// Two 32-bit floats.
    Float32x2,
    /// Three 32-bit floats.
    Float32x3,
    /// Four 32-bit floats.
    Float32x4,
    /// One 32-bit unsigned integer.
    Uint32,
    /// Four normalized unsigned bytes.
    Unorm8x4,
}

impl VertexFormat {
    /// Vulkan format for this attribute.
    #[inline]
    pub fn to_vk(self) -> vk::Format {
        match self {
            VertexFormat::Float32 => vk::Format::R32_SFLOAT,
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::Uint32 => vk::Format::R32_UINT,
            VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
        }
    }

    /// Size of the attribute in bytes.
    #[inline]
    pub const fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// One attribute: its format and byte offset inside a vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Numeric format.
    pub format: VertexFormat,
    /// Byte offset from the start of the vertex.
    pub offset: u32,
}

impl VertexAttribute {
    /// Creates an attribute.
    #[inline]
    pub const fn new(format: VertexFormat, offset: u32) -> Self {
        Self { format, offset }
    }
}

/// Interleaved vertex layout for binding 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    /// Bytes between consecutive vertices.
    pub stride: u32,
    /// Attributes in shader location order.
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Creates a layout with an explicit stride.
    pub fn new(stride: u32, attributes: Vec<VertexAttribute>) -> Self {
        Self { stride, attributes }
    }

    /// Creates a tightly packed layout from formats in order.
    pub fn packed(formats: &[VertexFormat]) -> Self {
        let mut offset = 0;
        let attributes = formats
            .iter()
            .map(|&format| {
                let attribute = VertexAttribute::new(format, offset);
                offset += format.size();
                attribute
            })
            .collect();
        Self {
            stride: offset,
            attributes,
        }
    }

    /// Whether every attribute lies inside the stride.
    pub fn is_valid(&self) -> bool {
        self.attributes
            .iter()
            .all(|a| a.offset + a.format.size() <= self.stride)
    }

    /// Get the vertex input binding description.
    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Get the vertex attribute descriptions, locations in list order.
    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .enumerate()
            .map(|(location, attribute)| vk::VertexInputAttributeDescription {
                binding: 0,
                location: location as u32,
                format: attribute.format.to_vk(),
                offset: attribute.offset,
            })
            .collect()
    }
}

/// Simple vertex format with a 2D position and RGB color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ColorVertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl ColorVertex {
    /// Creates a new colored vertex.
    #[inline]
    pub const fn new(position: Vec2, color: Vec3) -> Self {
        Self { position, color }
    }

    /// Layout matching the struct's memory layout.
    pub fn layout() -> VertexLayout {
        VertexLayout::new(
            std::mem::size_of::<Self>() as u32,
            vec![
                VertexAttribute::new(VertexFormat::Float32x2, 0),
                VertexAttribute::new(VertexFormat::Float32x3, 8),
            ],
        )
    }
}
