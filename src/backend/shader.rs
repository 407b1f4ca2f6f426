// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. build.rs compiles the GLSL sources in
// shaders/ with glslc; modules are loaded from disk at runtime so a missing
// compiler only disables drawing instead of breaking the build.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::GraphicsDevice;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into aligned words, fixing endianness if needed.
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Malformed SPIR-V")?;
    if words.first() != Some(&SPIRV_MAGIC) {
        anyhow::bail!("Not a SPIR-V module (bad magic number)");
    }
    Ok(words)
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &GraphicsDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = spirv_words(code)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Read a compiled shader from disk.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).with_context(|| format!("Failed to read shader {}", path.display()))
}
