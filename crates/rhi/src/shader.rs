//! SPIR-V bytecode handling.
//!
//! Shaders arrive as precompiled SPIR-V blobs. This module validates a blob
//! and converts it into the `u32` words Vulkan consumes; both backends run
//! the same check so a malformed shader fails identically with or without a
//! GPU.

use std::fmt;

use ash::vk;

use crate::error::{RhiError, RhiResult};

/// Magic number at the start of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Entry point every shader module is expected to export.
pub const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Shader stage of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader stage.
    Vertex,
    /// Fragment shader stage.
    Fragment,
}

impl ShaderStage {
    /// The corresponding `vk::ShaderStageFlags` for this stage.
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Validates a SPIR-V blob and returns its words.
///
/// # Errors
///
/// Returns [`RhiError::ShaderError`] if the byte length is not a non-zero
/// multiple of 4 or the magic number is missing.
pub fn spirv_words(bytes: &[u8], stage: ShaderStage) -> RhiResult<Vec<u32>> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(RhiError::ShaderError(format!(
            "{stage} SPIR-V code must be a non-empty multiple of 4 bytes, got {} bytes",
            bytes.len()
        )));
    }

    let code: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if code[0] != SPIRV_MAGIC {
        return Err(RhiError::ShaderError(format!(
            "{stage} shader is not SPIR-V (magic {:#010x})",
            code[0]
        )));
    }

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_valid_module() {
        let bytes = module(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = spirv_words(&bytes, ShaderStage::Vertex).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_unaligned_module_is_rejected() {
        let mut bytes = module(&[SPIRV_MAGIC, 0]);
        bytes.push(0);
        assert!(matches!(
            spirv_words(&bytes, ShaderStage::Fragment),
            Err(RhiError::ShaderError(_))
        ));
    }

    #[test]
    fn test_empty_module_is_rejected() {
        assert!(spirv_words(&[], ShaderStage::Vertex).is_err());
    }

    #[test]
    fn test_wrong_magic_is_rejected() {
        let bytes = module(&[0xdead_beef, 0]);
        let err = spirv_words(&bytes, ShaderStage::Vertex).unwrap_err();
        assert!(err.to_string().contains("not SPIR-V"));
    }

    #[test]
    fn test_stage_flags() {
        assert_eq!(ShaderStage::Vertex.to_vk_stage(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderStage::Fragment.to_string(), "fragment");
    }
}
