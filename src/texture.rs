// The texture store
//
// Decodes image files on the host, uploads them through the staging
// region and hands out Texture handles. Every texture's backing memory
// is sub-allocated from the DeviceImages region; the store keeps the
// image/view pairs on an autoclean list and destroys them at teardown.
// There is no runtime texture unloading.
use ash::vk;

use std::path::Path;

use crate::device::Device;
use crate::memory::{BlockRef, MemoryBlocks, OwnedBlock, RegionKind};
use crate::{DerechoError, Result};

/// A sampleable texture.
///
/// Only this type can be bound at a sampling descriptor. A texture
/// that is still mid-upload exists as a PendingTexture instead, so
/// sampling an image in the wrong layout is unrepresentable.
#[derive(Debug, Copy, Clone)]
pub struct Texture {
    pub t_image: vk::Image,
    pub t_image_view: vk::ImageView,
    /// offset of the backing range inside DeviceImages
    pub t_memory_offset: vk::DeviceSize,
}

/// An image that has been created and bound but whose contents are not
/// yet in SHADER_READ_ONLY layout. Produced by the allocation step,
/// consumed by the upload step.
pub struct PendingTexture {
    pt_image: vk::Image,
    pt_view: vk::ImageView,
    pt_block: OwnedBlock,
}

impl PendingTexture {
    /// The upload path calls this once the layout transition to
    /// SHADER_READ_ONLY has executed.
    fn into_ready(self, store: &mut TextureStore) -> Texture {
        let tex = Texture {
            t_image: self.pt_image,
            t_image_view: self.pt_view,
            t_memory_offset: self.pt_block.offset(),
        };
        store.adopt(self.pt_image, self.pt_view, self.pt_block);
        tex
    }
}

/// Host-decoded pixel data plus the format it selects.
///
/// 32 bit pixels map to RGBA8, single channel data to R8, and HDR
/// images to RGBA32F.
pub enum PixelData {
    Rgba8 { width: u32, height: u32, pixels: Vec<u8> },
    R8 { width: u32, height: u32, pixels: Vec<u8> },
    RgbaF32 { width: u32, height: u32, pixels: Vec<f32> },
}

impl PixelData {
    pub fn format(&self) -> vk::Format {
        match self {
            PixelData::Rgba8 { .. } => vk::Format::R8G8B8A8_UNORM,
            PixelData::R8 { .. } => vk::Format::R8_UNORM,
            PixelData::RgbaF32 { .. } => vk::Format::R32G32B32A32_SFLOAT,
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        let (w, h) = match self {
            PixelData::Rgba8 { width, height, .. } => (*width, *height),
            PixelData::R8 { width, height, .. } => (*width, *height),
            PixelData::RgbaF32 { width, height, .. } => (*width, *height),
        };
        vk::Extent2D {
            width: w,
            height: h,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            PixelData::Rgba8 { pixels, .. } => pixels.as_slice(),
            PixelData::R8 { pixels, .. } => pixels.as_slice(),
            PixelData::RgbaF32 { pixels, .. } => unsafe {
                std::slice::from_raw_parts(
                    pixels.as_ptr() as *const u8,
                    pixels.len() * std::mem::size_of::<f32>(),
                )
            },
        }
    }
}

/// Expand RGB bytes to RGBA with an opaque alpha.
///
/// Most gpus don't expose VK_FORMAT_R8G8B8_UNORM for sampling, so the
/// alpha channel is set to 0xFF for all pixels.
// @todo: optimize this thing! It's so ugly I want to rip my eyes only
// glancing at this :(
fn expand_rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgb.len() / 3 * 4);
    let mut trio_counter = 0;

    for byte in rgb.iter() {
        out.push(*byte);
        trio_counter += 1;

        if 3 == trio_counter {
            out.push(0xFF);
            trio_counter = 0;
        }
    }

    out
}

pub struct TextureStore {
    /// One sampler for all sampled textures
    pub ts_sampler: vk::Sampler,
    /// Lazy "to be removed at the end of program" lists.
    ts_autoclean: Vec<(vk::Image, vk::ImageView, BlockRef)>,
}

impl TextureStore {
    pub fn new(dev: &Device) -> Self {
        Self {
            ts_sampler: dev.create_texture_sampler(),
            ts_autoclean: Vec::new(),
        }
    }

    fn adopt(&mut self, image: vk::Image, view: vk::ImageView, block: OwnedBlock) {
        // ownership parks here until teardown; forget the block by
        // keeping only the raw ref
        let r = block.share();
        std::mem::forget(block);
        self.ts_autoclean.push((image, view, r));
    }

    pub fn active_texture_count(&self) -> usize {
        self.ts_autoclean.len()
    }

    /// Decode a PNG/JPEG file. Missing files are load failures that the
    /// asset layer converts into the magenta fallback; at engine
    /// startup they are fatal instead.
    pub fn decode_image<P: AsRef<Path>>(path: P) -> Result<PixelData> {
        let path = path.as_ref();
        let img = image::open(path).map_err(|e| {
            log::error!("Could not load texture {}: {}", path.display(), e);
            DerechoError::ASSET_NOT_FOUND
        })?;

        Ok(match img {
            image::DynamicImage::ImageLuma8(gray) => {
                let (width, height) = gray.dimensions();
                PixelData::R8 {
                    width,
                    height,
                    pixels: gray.into_raw(),
                }
            }
            image::DynamicImage::ImageRgb8(rgb) => {
                let (width, height) = rgb.dimensions();
                PixelData::Rgba8 {
                    width,
                    height,
                    pixels: expand_rgb_to_rgba(&rgb.into_raw()),
                }
            }
            other => {
                let rgba = other.to_rgba8();
                let (width, height) = rgba.dimensions();
                PixelData::Rgba8 {
                    width,
                    height,
                    pixels: rgba.into_raw(),
                }
            }
        })
    }

    /// Decode a Radiance HDR file into RGBA32F, alpha = 1.0.
    pub fn decode_hdr<P: AsRef<Path>>(path: P) -> Result<PixelData> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            log::error!("Could not open hdr {}: {}", path.display(), e);
            DerechoError::ASSET_NOT_FOUND
        })?;

        let decoder = image::codecs::hdr::HdrDecoder::new(std::io::BufReader::new(file))
            .or(Err(DerechoError::ASSET_PARSE_FAILURE))?;
        let meta = decoder.metadata();
        let rgb = decoder
            .read_image_hdr()
            .or(Err(DerechoError::ASSET_PARSE_FAILURE))?;

        let mut pixels = Vec::with_capacity(rgb.len() * 4);
        for texel in rgb.iter() {
            pixels.push(texel[0]);
            pixels.push(texel[1]);
            pixels.push(texel[2]);
            pixels.push(1.0);
        }

        Ok(PixelData::RgbaF32 {
            width: meta.width,
            height: meta.height,
            pixels,
        })
    }

    /// Load a 2D texture file and upload it.
    pub fn load_image<P: AsRef<Path>>(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        path: P,
    ) -> Result<Texture> {
        let pixels = Self::decode_image(path)?;
        self.load_from_pixels(dev, pool, &pixels)
    }

    /// Load an HDR environment file and upload it.
    pub fn load_hdr<P: AsRef<Path>>(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        path: P,
    ) -> Result<Texture> {
        let pixels = Self::decode_hdr(path)?;
        self.load_from_pixels(dev, pool, &pixels)
    }

    /// Like load_image, but a missing or corrupt file silently becomes
    /// a 2x2 magenta texture so a botched asset is visible on screen
    /// instead of taking the process down.
    pub fn load_image_or_fallback<P: AsRef<Path>>(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        path: P,
    ) -> Texture {
        match self.load_image(dev, pool, &path) {
            Ok(tex) => tex,
            Err(_) => {
                log::error!(
                    "Substituting fallback texture for {}",
                    path.as_ref().display()
                );
                let fallback = PixelData::Rgba8 {
                    width: 2,
                    height: 2,
                    pixels: vec![
                        0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, //
                        0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF,
                    ],
                };
                self.load_from_pixels(dev, pool, &fallback)
                    .expect("Could not upload the fallback texture")
            }
        }
    }

    /// Upload host pixels: stage, copy, transition, free the staging
    /// range as soon as the copy fence has signaled.
    pub fn load_from_pixels(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        pixels: &PixelData,
    ) -> Result<Texture> {
        let pending = Self::allocate_image(
            dev,
            pool,
            pixels.extent(),
            pixels.format(),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        let bytes = pixels.bytes();
        let staging = pool.allocate(RegionKind::HostVisibleStaging, bytes.len() as u64);
        pool.upload_slice(dev, staging.share(), bytes);

        let extent = pixels.extent();
        let image = pending.pt_image;
        let staging_buffer = pool.region(RegionKind::HostVisibleStaging).mr_buffer;
        let staging_offset = staging.offset();

        // One-shot copy on the graphics queue. execute_one_shot waits
        // on the submission fence, so by the time it returns the
        // staging range is dead and the image is sampleable.
        dev.execute_one_shot(|cbuf| unsafe {
            dev.transition_image_layout(
                cbuf,
                image,
                vk::ImageAspectFlags::COLOR,
                1,
                1,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(staging_offset)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();
            dev.dev.cmd_copy_buffer_to_image(
                cbuf,
                staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            dev.transition_image_layout(
                cbuf,
                image,
                vk::ImageAspectFlags::COLOR,
                1,
                1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        pool.release(staging);

        Ok(pending.into_ready(self))
    }

    /// Create an image + view bound into DeviceImages, contents still
    /// undefined.
    fn allocate_image(
        dev: &Device,
        pool: &mut MemoryBlocks,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<PendingTexture> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            dev.dev
                .create_image(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let block = pool.bind_image(dev, image)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .image(image);
        let view = unsafe {
            dev.dev
                .create_image_view(&view_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        Ok(PendingTexture {
            pt_image: image,
            pt_view: view,
            pt_block: block,
        })
    }

    /// Create a 6 layer cube compatible image for the offline bakes.
    /// Returns the image, its cube view and the owning block; layout
    /// transitions are the baker's business.
    pub fn allocate_cubemap(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        dim: u32,
        format: vk::Format,
        mip_levels: u32,
    ) -> Result<Texture> {
        let info = vk::ImageCreateInfo::builder()
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: dim,
                height: dim,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(6)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            dev.dev
                .create_image(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let block = pool.bind_image(dev, image)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(vk::ImageViewType::CUBE)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(mip_levels)
                    .layer_count(6)
                    .build(),
            )
            .image(image);
        let view = unsafe {
            dev.dev
                .create_image_view(&view_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let tex = Texture {
            t_image: image,
            t_image_view: view,
            t_memory_offset: block.offset(),
        };
        self.adopt(image, view, block);
        Ok(tex)
    }

    /// A sampleable 2D image the offline bakes render into (the BRDF
    /// lookup table). Contents undefined until the bake pass writes it.
    pub fn allocate_render_target_2d(
        &mut self,
        dev: &Device,
        pool: &mut MemoryBlocks,
        dim: u32,
        format: vk::Format,
    ) -> Result<Texture> {
        let pending = Self::allocate_image(
            dev,
            pool,
            vk::Extent2D {
                width: dim,
                height: dim,
            },
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )?;

        let tex = Texture {
            t_image: pending.pt_image,
            t_image_view: pending.pt_view,
            t_memory_offset: pending.pt_block.offset(),
        };
        self.adopt(pending.pt_image, pending.pt_view, pending.pt_block);
        Ok(tex)
    }

    /// Explicit destructor. Frees every adopted image/view; the memory
    /// ranges die with the DeviceImages region itself.
    pub unsafe fn destroy(&mut self, dev: &Device) {
        for (image, view, _block) in self.ts_autoclean.drain(..) {
            dev.dev.destroy_image_view(view, None);
            dev.dev.destroy_image(image, None);
        }
        dev.dev.destroy_sampler(self.ts_sampler, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_expansion_appends_opaque_alpha() {
        let rgb = [1u8, 2, 3, 4, 5, 6];
        let rgba = expand_rgb_to_rgba(&rgb);
        assert_eq!(rgba, vec![1, 2, 3, 0xFF, 4, 5, 6, 0xFF]);
    }

    #[test]
    fn format_selection_follows_pixel_layout() {
        let rgba = PixelData::Rgba8 {
            width: 1,
            height: 1,
            pixels: vec![0; 4],
        };
        let gray = PixelData::R8 {
            width: 1,
            height: 1,
            pixels: vec![0],
        };
        let hdr = PixelData::RgbaF32 {
            width: 1,
            height: 1,
            pixels: vec![0.0; 4],
        };

        assert_eq!(rgba.format(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(gray.format(), vk::Format::R8_UNORM);
        assert_eq!(hdr.format(), vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn hdr_bytes_are_four_floats_per_texel() {
        let hdr = PixelData::RgbaF32 {
            width: 2,
            height: 1,
            pixels: vec![0.5; 8],
        };
        assert_eq!(hdr.bytes().len(), 8 * 4);
    }
}
