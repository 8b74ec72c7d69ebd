// SPIR-V shader module loading
//
// Shaders ship precompiled next to the executable as <base>.<stage>.spv.
// A module only lives as long as pipeline creation needs it; the
// builder destroys it right after vkCreateGraphicsPipelines returns.
use ash::{util, vk};

use std::io::Cursor;
use std::path::Path;

use crate::device::Device;
use crate::{DerechoError, Result};

/// Read an entire SPIR-V file and wrap it in a vkShaderModule.
///
/// A missing or truncated file is an init failure: there is nothing to
/// render without its pipeline, so the caller aborts startup.
pub fn load_shader<P: AsRef<Path>>(dev: &Device, path: P) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        log::error!("Could not read shader {}: {}", path.display(), e);
        DerechoError::SHADER_NOT_FOUND
    })?;

    let code = util::read_spv(&mut Cursor::new(&bytes[..])).map_err(|e| {
        log::error!("Shader {} is not valid SPIR-V: {}", path.display(), e);
        DerechoError::SHADER_NOT_FOUND
    })?;

    let info = vk::ShaderModuleCreateInfo::builder().code(&code);
    unsafe {
        dev.dev
            .create_shader_module(&info, None)
            .or(Err(DerechoError::VK_CALL_FAILED))
    }
}

/// Load the module for one stage of an effect, resolving the
/// `<base>.<ext>.spv` naming convention.
pub fn load_stage(dev: &Device, base: &str, ext: &str) -> Result<vk::ShaderModule> {
    load_shader(dev, format!("{}.{}.spv", base, ext))
}
