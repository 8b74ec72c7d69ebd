// Pooled device memory
//
// Every image, vertex/index buffer and UBO in the engine is sub-allocated
// out of one of five fixed device memory regions created at startup. The
// region is a single vkAllocateMemory allocation; offsets handed out by
// the sub-allocators below are bound with vkBindBufferMemory /
// vkBindImageMemory. Nothing in here ever grows: running a region dry is
// a sizing bug and aborts.
use ash::vk;

use crate::device::Device;
use crate::{DerechoError, Result, SWAPCHAIN_IMAGES_COUNT};

/// Upper bound of free blocks the free-list allocator will track.
pub const MAX_FREE_BLOCKS_TRACKED: usize = 128;

/// The closed set of memory regions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// Static vertex/index data, written once through the staging region.
    DeviceLocal,
    /// Transfer source for texture and geometry uploads.
    HostVisibleStaging,
    /// Backing store for all sampled/attachment images.
    DeviceImages,
    /// Dynamic vertex/index data rewritten every frame (GUI, debug UI).
    HostCoherentMisc,
    /// Uniform buffer slices, one disjoint range per frame slot.
    HostCoherentUbo,
}

impl RegionKind {
    /// Region capacities, in bytes. These mirror the generous startup
    /// sizing the error policy depends on.
    pub fn capacity(&self) -> vk::DeviceSize {
        match self {
            RegionKind::DeviceLocal => 5 * 1024 * 1024,
            // must hold a whole decoded HDR environment map during the
            // copy, the largest single upload the engine performs
            RegionKind::HostVisibleStaging => 64 * 1024 * 1024,
            RegionKind::DeviceImages => 500 * 1024 * 1024,
            RegionKind::HostCoherentMisc => 1024 * 1024,
            RegionKind::HostCoherentUbo => 1024 * 1024,
        }
    }
}

/// A non-owning reference to a sub-allocated range of a region.
///
/// This is the handle shape every other subsystem traffics in: trivially
/// copyable, but destruction stays with exactly one owner. A BlockRef
/// held by a renderer is a shared observer for the duration of a frame;
/// the deferred destruction queue guarantees the range outlives any
/// recorded command buffer that mentions it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub region: RegionKind,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// The owning side of a BlockRef.
///
/// Exactly one of these exists per live allocation in a free-list
/// region. It must be handed back through MemoryBlocks::release; simply
/// dropping one leaks the range and complains in the log.
#[derive(Debug)]
pub struct OwnedBlock {
    ob_block: BlockRef,
    ob_released: bool,
}

impl OwnedBlock {
    pub fn share(&self) -> BlockRef {
        self.ob_block
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.ob_block.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.ob_block.size
    }
}

impl Drop for OwnedBlock {
    fn drop(&mut self) {
        if !self.ob_released {
            log::error!(
                "Leaked gpu memory block {:?}: OwnedBlock dropped without release",
                self.ob_block
            );
        }
    }
}

/// One free range inside a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct FreeBlock {
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

/// A free-list allocator for regions with mid-life frees.
///
/// The list is kept sorted by offset, which makes allocation "lowest
/// offset that fits" by construction and lets a free coalesce with both
/// neighbours in a single pass. Since the managed memory is remote this
/// is the closest thing to a real free list we can do: the nodes only
/// describe the memory, they do not live in it.
pub struct FreeListAllocator {
    fl_nodes: Vec<FreeBlock>,
    fl_capacity: vk::DeviceSize,
}

impl FreeListAllocator {
    pub fn new(capacity: vk::DeviceSize) -> Self {
        let mut nodes = Vec::with_capacity(MAX_FREE_BLOCKS_TRACKED);
        nodes.push(FreeBlock {
            offset: 0,
            size: capacity,
        });

        Self {
            fl_nodes: nodes,
            fl_capacity: capacity,
        }
    }

    /// Allocate `size` bytes, returning the offset of the lowest free
    /// block that fits. The caller is responsible for having rounded
    /// `size` up to the region alignment.
    pub fn allocate(&mut self, size: vk::DeviceSize) -> Result<vk::DeviceSize> {
        assert!(size > 0);

        for i in 0..self.fl_nodes.len() {
            let node = &mut self.fl_nodes[i];

            if node.size > size {
                // shrink the block in place
                let result = node.offset;
                node.offset += size;
                node.size -= size;
                return Ok(result);
            } else if node.size == size {
                // exact fit, the node disappears
                let result = node.offset;
                self.fl_nodes.remove(i);
                return Ok(result);
            }
        }

        // Reaching this point means it's impossible to perform the
        // allocation. The region has to be sized up at compile time.
        Err(DerechoError::INVALID)
    }

    /// Return a range to the free list.
    ///
    /// This is a sorted container insertion. If the freed range touches
    /// the block before it, the block after it, or both, the ranges are
    /// merged so the list never holds two adjacent free blocks.
    pub fn free(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        assert!(size > 0);
        assert!(offset + size <= self.fl_capacity);

        // index of the first node past the freed range
        let pos = self
            .fl_nodes
            .iter()
            .position(|n| n.offset > offset)
            .unwrap_or(self.fl_nodes.len());

        // catch double frees and overlapping frees
        if pos > 0 {
            let left = &self.fl_nodes[pos - 1];
            assert!(left.offset + left.size <= offset, "overlapping free");
        }
        if pos < self.fl_nodes.len() {
            assert!(offset + size <= self.fl_nodes[pos].offset, "overlapping free");
        }

        let merges_left =
            pos > 0 && self.fl_nodes[pos - 1].offset + self.fl_nodes[pos - 1].size == offset;
        let merges_right = pos < self.fl_nodes.len() && offset + size == self.fl_nodes[pos].offset;

        match (merges_left, merges_right) {
            (true, true) => {
                let right_size = self.fl_nodes[pos].size;
                self.fl_nodes[pos - 1].size += size + right_size;
                self.fl_nodes.remove(pos);
            }
            (true, false) => {
                self.fl_nodes[pos - 1].size += size;
            }
            (false, true) => {
                let right = &mut self.fl_nodes[pos];
                right.offset = offset;
                right.size += size;
            }
            (false, false) => {
                assert!(self.fl_nodes.len() < MAX_FREE_BLOCKS_TRACKED);
                self.fl_nodes.insert(pos, FreeBlock { offset, size });
            }
        }
    }

    /// Sum of all free bytes in the region.
    pub fn free_bytes(&self) -> vk::DeviceSize {
        self.fl_nodes.iter().map(|n| n.size).sum()
    }

    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.fl_capacity - self.free_bytes()
    }

    /// True when the whole region is one free block again.
    pub fn is_empty(&self) -> bool {
        self.fl_nodes.len() == 1
            && self.fl_nodes[0].offset == 0
            && self.fl_nodes[0].size == self.fl_capacity
    }
}

/// A linear bump allocator for append-only regions.
///
/// Used for staging memory and the static geometry region, both of which
/// only ever free by resetting the whole thing.
pub struct BumpAllocator {
    ba_capacity: vk::DeviceSize,
    ba_used: vk::DeviceSize,
    ba_last_allocation: vk::DeviceSize,
}

impl BumpAllocator {
    pub fn new(capacity: vk::DeviceSize) -> Self {
        Self {
            ba_capacity: capacity,
            ba_used: 0,
            ba_last_allocation: 0,
        }
    }

    pub fn allocate(&mut self, size: vk::DeviceSize) -> Result<vk::DeviceSize> {
        if self.ba_used + size > self.ba_capacity {
            return Err(DerechoError::INVALID);
        }

        let offset = self.ba_used;
        self.ba_used += size;
        self.ba_last_allocation = size;
        Ok(offset)
    }

    /// Undo the most recent allocation. Handy for staging uploads that
    /// are retired as soon as their copy fence signals.
    pub fn pop(&mut self) {
        self.ba_used -= self.ba_last_allocation;
        self.ba_last_allocation = 0;
    }

    pub fn reset(&mut self) {
        self.ba_used = 0;
        self.ba_last_allocation = 0;
    }

    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.ba_used
    }
}

enum SubAllocator {
    Linear(BumpAllocator),
    FreeList(FreeListAllocator),
}

/// One of the five device memory regions.
pub struct MemoryRegion {
    mr_kind: RegionKind,
    /// the single vkDeviceMemory allocation backing this region
    pub mr_memory: vk::DeviceMemory,
    /// region wide buffer, bound at offset 0. DeviceImages has none,
    /// images are bound into the memory directly.
    pub mr_buffer: vk::Buffer,
    mr_alignment: vk::DeviceSize,
    mr_allocator: SubAllocator,
}

impl MemoryRegion {
    fn round_up(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        round_up_to(size, self.mr_alignment)
    }

    pub fn alignment(&self) -> vk::DeviceSize {
        self.mr_alignment
    }

    pub fn kind(&self) -> RegionKind {
        self.mr_kind
    }
}

pub fn round_up_to(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    assert!(alignment > 0);
    match size % alignment {
        0 => size,
        rem => size + (alignment - rem),
    }
}

/// The five fixed regions plus the allocation front end.
///
/// All allocation and free calls happen on the main thread, either at
/// startup or during the serial host-upload step of the frame loop.
/// Workers never touch this.
pub struct MemoryBlocks {
    mb_device_local: MemoryRegion,
    mb_staging: MemoryRegion,
    mb_device_images: MemoryRegion,
    mb_host_coherent: MemoryRegion,
    mb_host_coherent_ubo: MemoryRegion,
}

impl MemoryBlocks {
    /// Create the five regions.
    ///
    /// Each buffer-backed region creates its buffer first so the
    /// driver's alignment/memory-type requirements can be queried from
    /// the real object. The image region probes with a throwaway 2x2
    /// optimal-tiling image instead, and maxes the answer with
    /// bufferImageGranularity so image/buffer aliasing rules hold.
    pub fn new(dev: &Device) -> Result<Self> {
        let device_local = Self::create_buffer_region(
            dev,
            RegionKind::DeviceLocal,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            1,
        )?;
        let staging = Self::create_buffer_region(
            dev,
            RegionKind::HostVisibleStaging,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            1,
        )?;
        let host_coherent = Self::create_buffer_region(
            dev,
            RegionKind::HostCoherentMisc,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            1,
        )?;
        // UBO offsets additionally have to respect the device's minimum
        // uniform buffer offset alignment, since descriptor writes and
        // dynamic offsets point into the middle of this buffer.
        let ubo_align = dev.limits().min_uniform_buffer_offset_alignment.max(1);
        let host_coherent_ubo = Self::create_buffer_region(
            dev,
            RegionKind::HostCoherentUbo,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ubo_align,
        )?;
        let device_images = Self::create_image_region(dev)?;

        Ok(Self {
            mb_device_local: device_local,
            mb_staging: staging,
            mb_device_images: device_images,
            mb_host_coherent: host_coherent,
            mb_host_coherent_ubo: host_coherent_ubo,
        })
    }

    fn create_buffer_region(
        dev: &Device,
        kind: RegionKind,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
        extra_alignment: vk::DeviceSize,
    ) -> Result<MemoryRegion> {
        let capacity = kind.capacity();

        let info = vk::BufferCreateInfo::builder()
            .size(capacity)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let buffer = unsafe {
            dev.dev
                .create_buffer(&info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let reqs = unsafe { dev.dev.get_buffer_memory_requirements(buffer) };
        let alignment = reqs.alignment.max(extra_alignment);
        let memory = dev.allocate_memory(&reqs, props)?;

        unsafe {
            dev.dev
                .bind_buffer_memory(buffer, memory, 0)
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }

        let allocator = match kind {
            RegionKind::HostCoherentMisc => {
                SubAllocator::FreeList(FreeListAllocator::new(capacity))
            }
            _ => SubAllocator::Linear(BumpAllocator::new(capacity)),
        };

        Ok(MemoryRegion {
            mr_kind: kind,
            mr_memory: memory,
            mr_buffer: buffer,
            mr_alignment: alignment,
            mr_allocator: allocator,
        })
    }

    fn create_image_region(dev: &Device) -> Result<MemoryRegion> {
        let capacity = RegionKind::DeviceImages.capacity();

        // probe image to learn what the driver wants from sampled images
        let probe_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: 2,
                height: 2,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let probe = unsafe {
            dev.dev
                .create_image(&probe_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };
        let reqs = unsafe { dev.dev.get_image_memory_requirements(probe) };
        unsafe { dev.dev.destroy_image(probe, None) };

        let alignment = reqs
            .alignment
            .max(dev.limits().buffer_image_granularity)
            .max(1);

        let full_reqs = vk::MemoryRequirements {
            size: capacity,
            alignment: alignment,
            memory_type_bits: reqs.memory_type_bits,
        };
        let memory = dev.allocate_memory(&full_reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        Ok(MemoryRegion {
            mr_kind: RegionKind::DeviceImages,
            mr_memory: memory,
            mr_buffer: vk::Buffer::null(),
            mr_alignment: alignment,
            mr_allocator: SubAllocator::FreeList(FreeListAllocator::new(capacity)),
        })
    }

    pub fn region(&self, kind: RegionKind) -> &MemoryRegion {
        match kind {
            RegionKind::DeviceLocal => &self.mb_device_local,
            RegionKind::HostVisibleStaging => &self.mb_staging,
            RegionKind::DeviceImages => &self.mb_device_images,
            RegionKind::HostCoherentMisc => &self.mb_host_coherent,
            RegionKind::HostCoherentUbo => &self.mb_host_coherent_ubo,
        }
    }

    fn region_mut(&mut self, kind: RegionKind) -> &mut MemoryRegion {
        match kind {
            RegionKind::DeviceLocal => &mut self.mb_device_local,
            RegionKind::HostVisibleStaging => &mut self.mb_staging,
            RegionKind::DeviceImages => &mut self.mb_device_images,
            RegionKind::HostCoherentMisc => &mut self.mb_host_coherent,
            RegionKind::HostCoherentUbo => &mut self.mb_host_coherent_ubo,
        }
    }

    /// Sub-allocate `size` bytes from `kind`. The size is rounded up to
    /// the region alignment before the allocator runs, so every offset
    /// handed out is a multiple of that alignment.
    ///
    /// Exhausting a region is a fatal sizing bug, not a runtime
    /// condition, and takes the process down.
    pub fn allocate(&mut self, kind: RegionKind, size: vk::DeviceSize) -> OwnedBlock {
        let region = self.region_mut(kind);
        let rounded = region.round_up(size);

        let res = match &mut region.mr_allocator {
            SubAllocator::Linear(bump) => bump.allocate(rounded),
            SubAllocator::FreeList(list) => list.allocate(rounded),
        };

        let offset = match res {
            Ok(off) => off,
            Err(_) => {
                // Not recoverable: regions are sized generously at
                // startup and never grow.
                log::error!("Memory region {:?} exhausted allocating {} bytes", kind, rounded);
                std::process::abort();
            }
        };

        OwnedBlock {
            ob_block: BlockRef {
                region: kind,
                offset: offset,
                size: rounded,
            },
            ob_released: false,
        }
    }

    /// Allocate `count` equally sized slots in one call. Used for the
    /// per-frame-slot UBO ranges, which must be disjoint between slots.
    pub fn allocate_ranged(
        &mut self,
        kind: RegionKind,
        count: usize,
        size: vk::DeviceSize,
    ) -> Vec<OwnedBlock> {
        (0..count).map(|_| self.allocate(kind, size)).collect()
    }

    /// Hand a block back to its region's free list.
    pub fn release(&mut self, mut block: OwnedBlock) {
        block.ob_released = true;
        let b = block.ob_block;

        match &mut self.region_mut(b.region).mr_allocator {
            SubAllocator::FreeList(list) => list.free(b.offset, b.size),
            SubAllocator::Linear(bump) => {
                // Linear regions only support freeing the most recent
                // allocation (the staging pattern) or a full reset.
                bump.pop();
            }
        }
    }

    /// Free a range by raw reference. Only the deferred destruction
    /// queue uses this: it holds BlockRefs because its entries must be
    /// trivially copyable, and by the time a ref reaches countdown
    /// zero its owner has already been forgotten.
    pub fn release_ref(&mut self, block: BlockRef) {
        match &mut self.region_mut(block.region).mr_allocator {
            SubAllocator::FreeList(list) => list.free(block.offset, block.size),
            SubAllocator::Linear(bump) => bump.pop(),
        }
    }

    /// Drop everything allocated from the staging region. Called after
    /// an upload fence signals; nothing in this region outlives the
    /// copies sourced from it.
    pub fn reset_staging(&mut self) {
        match &mut self.mb_staging.mr_allocator {
            SubAllocator::Linear(bump) => bump.reset(),
            SubAllocator::FreeList(_) => unreachable!(),
        }
    }

    /// Bytes currently allocated out of a region. The startup/teardown
    /// accounting tests lean on this.
    pub fn used_bytes(&self, kind: RegionKind) -> vk::DeviceSize {
        match &self.region(kind).mr_allocator {
            SubAllocator::Linear(bump) => bump.used_bytes(),
            SubAllocator::FreeList(list) => list.used_bytes(),
        }
    }

    /// Bind an image into the DeviceImages region, returning the owning
    /// block. The image's own alignment requirement never exceeds the
    /// region alignment chosen at startup; this is checked rather than
    /// assumed.
    pub fn bind_image(&mut self, dev: &Device, image: vk::Image) -> Result<OwnedBlock> {
        let reqs = unsafe { dev.dev.get_image_memory_requirements(image) };
        let region_align = self.mb_device_images.mr_alignment;
        assert!(
            region_align % reqs.alignment == 0,
            "image alignment {} exceeds region alignment {}",
            reqs.alignment,
            region_align
        );

        let block = self.allocate(RegionKind::DeviceImages, reqs.size);
        unsafe {
            dev.dev
                .bind_image_memory(image, self.mb_device_images.mr_memory, block.offset())
                .or(Err(DerechoError::VK_CALL_FAILED))?;
        }

        Ok(block)
    }

    /// Map a sub-range of a host visible region and copy `data` into it.
    pub fn upload_slice<T: Copy>(&self, dev: &Device, block: BlockRef, data: &[T]) {
        let region = self.region(block.region);
        let bytes = std::mem::size_of_val(data) as vk::DeviceSize;
        assert!(bytes <= block.size);

        if data.is_empty() {
            return;
        }

        unsafe {
            let ptr = dev
                .dev
                .map_memory(
                    region.mr_memory,
                    block.offset,
                    bytes,
                    vk::MemoryMapFlags::empty(),
                )
                .expect("Could not map region memory");

            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);

            dev.dev.unmap_memory(region.mr_memory);
        }
    }

    /// Explicit destructor. The caller guarantees the device is idle.
    pub unsafe fn destroy(&mut self, dev: &Device) {
        for kind in [
            RegionKind::DeviceLocal,
            RegionKind::HostVisibleStaging,
            RegionKind::DeviceImages,
            RegionKind::HostCoherentMisc,
            RegionKind::HostCoherentUbo,
        ]
        .iter()
        {
            let region = self.region_mut(*kind);
            if region.mr_buffer != vk::Buffer::null() {
                dev.dev.destroy_buffer(region.mr_buffer, None);
                region.mr_buffer = vk::Buffer::null();
            }
            dev.dev.free_memory(region.mr_memory, None);
            region.mr_memory = vk::DeviceMemory::null();
        }
    }
}

/// Per-frame-slot UBO layout helper: given the total slice size needed
/// by one slot, produce SWAPCHAIN_IMAGES_COUNT disjoint aligned ranges.
pub fn slot_ranges(
    pool: &mut MemoryBlocks,
    size: vk::DeviceSize,
) -> [BlockRef; SWAPCHAIN_IMAGES_COUNT] {
    let mut blocks = pool.allocate_ranged(RegionKind::HostCoherentUbo, SWAPCHAIN_IMAGES_COUNT, size);
    // The engine keeps these for the life of the process, so forget the
    // owners and keep the raw refs.
    let mut out = [BlockRef {
        region: RegionKind::HostCoherentUbo,
        offset: 0,
        size: 0,
    }; SWAPCHAIN_IMAGES_COUNT];
    for (i, mut b) in blocks.drain(..).enumerate() {
        b.ob_released = true;
        out[i] = b.ob_block;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sorted_disjoint(list: &FreeListAllocator) {
        for w in list.fl_nodes.windows(2) {
            let (a, b) = (w[0], w[1]);
            assert!(a.offset < b.offset, "free list not sorted");
            assert!(
                a.offset + a.size < b.offset,
                "adjacent free blocks were not coalesced"
            );
        }
    }

    #[test]
    fn freelist_lowest_offset_fit() {
        let mut fl = FreeListAllocator::new(1024);
        let a = fl.allocate(128).unwrap();
        let b = fl.allocate(256).unwrap();
        let c = fl.allocate(64).unwrap();
        assert_eq!((a, b, c), (0, 128, 384));

        // Free the middle block, then ask for exactly its size back.
        // Best-fit-lowest-offset hands out the hole again.
        fl.free(b, 256);
        assert_sorted_disjoint(&fl);
        let b2 = fl.allocate(256).unwrap();
        assert_eq!(b2, b);
    }

    #[test]
    fn freelist_coalesces_both_sides_in_one_pass() {
        let mut fl = FreeListAllocator::new(1024);
        let a = fl.allocate(100).unwrap();
        let b = fl.allocate(100).unwrap();
        let c = fl.allocate(100).unwrap();
        let _d = fl.allocate(100).unwrap();

        fl.free(a, 100);
        fl.free(c, 100);
        assert_sorted_disjoint(&fl);
        assert_eq!(fl.fl_nodes.len(), 3);

        // freeing b touches both neighbours; they must merge into one
        fl.free(b, 100);
        assert_sorted_disjoint(&fl);
        assert_eq!(fl.fl_nodes[0], FreeBlock { offset: 0, size: 300 });
    }

    #[test]
    fn freelist_round_trip_restores_single_block() {
        let mut fl = FreeListAllocator::new(4096);
        let mut offsets = Vec::new();
        for _ in 0..16 {
            offsets.push(fl.allocate(256).unwrap());
        }
        assert_eq!(fl.free_bytes(), 0);

        // free in reverse order of allocation
        for off in offsets.iter().rev() {
            fl.free(*off, 256);
            assert_sorted_disjoint(&fl);
        }
        assert!(fl.is_empty());
    }

    #[test]
    fn freelist_exhaustion_is_an_error() {
        let mut fl = FreeListAllocator::new(512);
        fl.allocate(512).unwrap();
        assert!(fl.allocate(1).is_err());
    }

    #[test]
    fn freelist_interleaved_sequence_stays_well_formed() {
        let mut fl = FreeListAllocator::new(8192);
        let mut live: Vec<(u64, u64)> = Vec::new();

        // deterministic pseudo-random alloc/free interleaving
        let mut x: u64 = 7;
        for step in 0..200 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let do_alloc = live.len() < 4 || (x >> 33) % 3 != 0;
            if do_alloc {
                let size = 64 * (1 + (x >> 17) % 8);
                if let Ok(off) = fl.allocate(size) {
                    live.push((off, size));
                }
            } else {
                let idx = ((x >> 7) as usize) % live.len();
                let (off, size) = live.swap_remove(idx);
                fl.free(off, size);
            }
            assert_sorted_disjoint(&fl);
            let used: u64 = live.iter().map(|(_, s)| s).sum();
            assert_eq!(fl.used_bytes(), used, "accounting diverged at step {}", step);
        }

        for (off, size) in live.drain(..) {
            fl.free(off, size);
        }
        assert!(fl.is_empty());
    }

    #[test]
    fn bump_allocate_and_pop() {
        let mut bump = BumpAllocator::new(1000);
        let a = bump.allocate(100).unwrap();
        let b = bump.allocate(200).unwrap();
        assert_eq!((a, b), (0, 100));

        bump.pop();
        let b2 = bump.allocate(50).unwrap();
        assert_eq!(b2, 100);

        bump.reset();
        assert_eq!(bump.used_bytes(), 0);
        assert!(bump.allocate(1001).is_err());
    }

    #[test]
    fn rounding_respects_alignment() {
        assert_eq!(round_up_to(1, 256), 256);
        assert_eq!(round_up_to(256, 256), 256);
        assert_eq!(round_up_to(257, 256), 512);

        // every offset handed out by an aligned-size-only allocator is
        // itself aligned, since it is a sum of aligned sizes
        let align = 256;
        let mut fl = FreeListAllocator::new(1 << 20);
        let mut offs = Vec::new();
        for size in [1u64, 100, 255, 256, 300, 1000].iter() {
            let rounded = round_up_to(*size, align);
            offs.push(fl.allocate(rounded).unwrap());
        }
        for off in offs {
            assert_eq!(off % align, 0);
        }
    }
}
