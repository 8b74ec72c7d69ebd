// The derecho rendering engine
//
// A multi-pass Vulkan renderer built around pooled device memory,
// parallel secondary command buffer recording and cascaded shadow maps.
//
// This layer is very low, and as a result is mostly unsafe. Nothing
// unsafe/vulkan/ash/etc should be exposed to the game layers above.
#![allow(dead_code, non_camel_case_types)]

#[macro_use]
extern crate memoffset;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

pub mod cascades;
pub mod deletion;
pub mod descriptors;
pub mod device;
pub mod display;
pub mod engine;
pub mod font;
pub mod frame;
pub mod framebuffers;
pub mod instance;
pub mod jobs;
pub mod lights;
pub mod memory;
pub mod offline;
pub mod passes;
pub mod pipelines;
pub mod shaders;
pub mod texture;

pub use engine::Engine;
pub use frame::{FrameContext, FrameInputs};
pub use jobs::{Job, PassTarget};
pub use memory::RegionKind;
pub use pipelines::RenderEffect;
pub use texture::Texture;

use thiserror::Error;

/// Number of images the swapchain rotates through. Two is double
/// buffering, and it is also the depth of every per-frame resource
/// in the engine: fences, primary command buffers, UBO slices and
/// the deferred destruction countdown.
pub const SWAPCHAIN_IMAGES_COUNT: usize = 2;

/// Cascade count for the shadow mapping pass. The shadow image is an
/// array image with one layer per cascade.
pub const SHADOWMAP_CASCADE_COUNT: usize = 4;

/// Fixed square dimension of the shadow map. The shadow framebuffers
/// never resize with the window.
pub const SHADOWMAP_IMAGE_DIM: u32 = 2048;

#[cfg(feature = "msaa")]
pub const MSAA_SAMPLE_COUNT: ash::vk::SampleCountFlags = ash::vk::SampleCountFlags::TYPE_8;
#[cfg(not(feature = "msaa"))]
pub const MSAA_SAMPLE_COUNT: ash::vk::SampleCountFlags = ash::vk::SampleCountFlags::TYPE_1;

/// The resolutions the engine will agree to run at. Resize requests
/// outside of this list are rejected.
pub const SUPPORTED_RESOLUTIONS: [(u32, u32); 5] = [
    (1200, 900),
    (1280, 720),
    (1366, 768),
    (1600, 900),
    (1920, 1080),
];

/// Errors that this crate hands back to callers.
///
/// The only variant a caller is expected to handle is OUT_OF_DATE,
/// which routes into Engine::change_resolution. Everything else is
/// fatal per our error policy: initialization failures end the
/// process and a lost device is not recovered from.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum DerechoError {
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Presentation to the surface failed")]
    PRESENT_FAILED,
    #[error("No suitable physical device was found")]
    NO_SUITABLE_DEVICE,
    #[error("Could not create a vulkan surface on this window")]
    SURFACE_CREATION_FAILED,
    #[error("Could not create the swapchain")]
    COULD_NOT_CREATE_SWAPCHAIN,
    #[error("A shader module was missing or unreadable")]
    SHADER_NOT_FOUND,
    #[error("An asset file was missing or unreadable")]
    ASSET_NOT_FOUND,
    #[error("An asset file could not be parsed")]
    ASSET_PARSE_FAILURE,
    #[error("The requested resolution is not in the supported list")]
    UNSUPPORTED_RESOLUTION,
    #[error("The device was lost while executing work")]
    DEVICE_LOST,
    #[error("A vulkan call failed")]
    VK_CALL_FAILED,
    #[error("An operation was invalid")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, DerechoError>;
