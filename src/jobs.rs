// Parallel command buffer recording
//
// A small fixed pool of worker threads records secondary command
// buffers while the main thread handles the serial per-frame uploads.
// Jobs never suspend, never spawn sub-jobs, and share no mutable state
// with each other: their only inputs are the read-only FrameContext and
// their own worker's command pool.
//
// Completed buffers land on a lock-free result stack tagged with their
// target pass and an intra-pass ordering key. Workers finish in
// whatever order they like; the main thread stable-sorts the stack
// before concatenation so blending and depth semantics stay
// deterministic.
use ash::vk;

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::device::Device;
use crate::frame::FrameContext;
use crate::{Result, SHADOWMAP_CASCADE_COUNT, SWAPCHAIN_IMAGES_COUNT};

/// Upper bound of secondary command buffers a single frame can produce.
const MAX_FRAME_COMMANDS: usize = 256;

/// Which render pass instance a secondary command buffer targets.
///
/// The shadow pass runs once per cascade, so each cascade counts as its
/// own instance for ordering purposes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PassTarget {
    Shadowmap(u32),
    Skybox,
    ColorDepth,
    Gui,
}

impl PassTarget {
    /// Total order of pass instances within a frame.
    pub fn rank(&self) -> u32 {
        match self {
            PassTarget::Shadowmap(cascade) => {
                assert!((*cascade as usize) < SHADOWMAP_CASCADE_COUNT);
                *cascade
            }
            PassTarget::Skybox => SHADOWMAP_CASCADE_COUNT as u32,
            PassTarget::ColorDepth => SHADOWMAP_CASCADE_COUNT as u32 + 1,
            PassTarget::Gui => SHADOWMAP_CASCADE_COUNT as u32 + 2,
        }
    }
}

/// A recording job. The closure records one secondary command buffer
/// against the (pass, subpass, framebuffer) its target implies.
pub struct Job {
    pub j_target: PassTarget,
    /// Execution position within the pass; lower runs first.
    pub j_order: i32,
    pub j_record: Box<dyn Fn(&FrameContext, &mut SecondaryRecorder) -> Result<vk::CommandBuffer> + Send + Sync>,
}

/// A finished secondary command buffer plus its sort key.
#[derive(Debug, Copy, Clone)]
pub struct TaggedCbuf {
    pub tc_rank: u32,
    pub tc_order: i32,
    pub tc_cbuf: vk::CommandBuffer,
}

/// Sort completed commands into submission order: pass instances in
/// declared order, ordering key ascending within a pass. The sort is
/// stable so jobs with equal keys keep their enqueue order.
pub fn sort_for_submission(cmds: &mut Vec<TaggedCbuf>) {
    cmds.sort_by_key(|c| (c.tc_rank, c.tc_order));
}

/// Fixed capacity lock-free stack.
///
/// Each worker is a producer reserving a slot with one atomic add; the
/// main thread is the only consumer and only drains after the job
/// barrier, which is what publishes the slot writes to it.
pub struct AtomicStack<T: Copy> {
    as_count: AtomicUsize,
    as_slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Copy + Send> Send for AtomicStack<T> {}
unsafe impl<T: Copy + Send> Sync for AtomicStack<T> {}

impl<T: Copy> AtomicStack<T> {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            as_count: AtomicUsize::new(0),
            as_slots: slots.into_boxed_slice(),
        }
    }

    pub fn push(&self, value: T) {
        let idx = self.as_count.fetch_add(1, Ordering::AcqRel);
        assert!(idx < self.as_slots.len(), "result stack overflow");
        unsafe {
            *self.as_slots[idx].get() = MaybeUninit::new(value);
        }
    }

    pub fn len(&self) -> usize {
        self.as_count.load(Ordering::Acquire)
    }

    /// Copy out everything pushed so far and reset the stack.
    ///
    /// Only valid while no producer is running; the job system calls
    /// this strictly after wait_for_finish.
    pub fn take_all(&self) -> Vec<T> {
        let count = self.as_count.swap(0, Ordering::AcqRel);
        (0..count)
            .map(|i| unsafe { (*self.as_slots[i].get()).assume_init() })
            .collect()
    }
}

/// Per-worker secondary command buffer state.
///
/// One command pool per (worker, frame slot); buffers are allocated on
/// demand, recycled by index after the pool reset at frame start, and
/// never shared between workers.
pub struct SecondaryRecorder {
    sr_dev: Arc<Device>,
    sr_thread_id: usize,
    sr_pools: [vk::CommandPool; SWAPCHAIN_IMAGES_COUNT],
    sr_cbufs: [Vec<vk::CommandBuffer>; SWAPCHAIN_IMAGES_COUNT],
    sr_used: [usize; SWAPCHAIN_IMAGES_COUNT],
}

impl SecondaryRecorder {
    fn new(dev: Arc<Device>, thread_id: usize, queue_family: u32) -> Self {
        let mut pools = [vk::CommandPool::null(); SWAPCHAIN_IMAGES_COUNT];
        for p in pools.iter_mut() {
            *p = dev.create_command_pool(queue_family);
        }

        Self {
            sr_dev: dev,
            sr_thread_id: thread_id,
            sr_pools: pools,
            sr_cbufs: Default::default(),
            sr_used: [0; SWAPCHAIN_IMAGES_COUNT],
        }
    }

    pub fn thread_id(&self) -> usize {
        self.sr_thread_id
    }

    /// Grab a reset secondary command buffer for this frame slot.
    fn acquire(&mut self, image: usize) -> vk::CommandBuffer {
        if self.sr_used[image] == self.sr_cbufs[image].len() {
            let new = self
                .sr_dev
                .create_secondary_command_buffers(self.sr_pools[image], 1)[0];
            self.sr_cbufs[image].push(new);
        }

        let cbuf = self.sr_cbufs[image][self.sr_used[image]];
        self.sr_used[image] += 1;
        cbuf
    }

    /// Begin a secondary command buffer bound to the render pass
    /// instance `target` resolves to in this frame.
    pub fn begin(&mut self, ctx: &FrameContext, target: PassTarget) -> vk::CommandBuffer {
        let cbuf = self.acquire(ctx.fc_image_index as usize);
        let (pass, framebuffer) = ctx.pass_binding(target);

        let inheritance = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(pass)
            .subpass(0)
            .framebuffer(framebuffer)
            .build();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            )
            .inheritance_info(&inheritance);

        unsafe {
            self.sr_dev
                .dev
                .begin_command_buffer(cbuf, &begin_info)
                .expect("Could not begin secondary command buffer");
        }

        cbuf
    }

    pub fn end(&self, cbuf: vk::CommandBuffer) {
        unsafe {
            self.sr_dev
                .dev
                .end_command_buffer(cbuf)
                .expect("Could not end secondary command buffer");
        }
    }

    pub fn dev(&self) -> &Device {
        &self.sr_dev
    }

    /// Reset this worker's pool for one frame slot. Called from the
    /// main thread while the workers are idle and after the slot's
    /// fence has been waited.
    fn reset(&mut self, image: usize) {
        unsafe {
            self.sr_dev
                .dev
                .reset_command_pool(
                    self.sr_pools[image],
                    vk::CommandPoolResetFlags::empty(),
                )
                .expect("Could not reset worker command pool");
        }
        self.sr_used[image] = 0;
    }

    unsafe fn destroy(&mut self) {
        for pool in self.sr_pools.iter() {
            self.sr_dev.dev.destroy_command_pool(*pool, None);
        }
    }
}

struct JobQueue {
    jq_jobs: VecDeque<Job>,
    jq_ctx: Option<Arc<FrameContext>>,
    jq_active: usize,
    jq_shutdown: bool,
}

struct JobShared {
    js_queue: Mutex<JobQueue>,
    js_work_cv: Condvar,
    js_done_cv: Condvar,
    js_results: AtomicStack<TaggedCbuf>,
}

/// The worker thread pool.
///
/// hardware_concurrency - 1 workers (at least one), plus the main
/// thread which owns the graphics queue and all primary command buffer
/// assembly. Workers only ever touch their own recorder and the shared
/// queue/result structures.
pub struct JobSystem {
    js_shared: Arc<JobShared>,
    js_recorders: Vec<Arc<Mutex<SecondaryRecorder>>>,
    js_threads: Vec<thread::JoinHandle<()>>,
}

impl JobSystem {
    pub fn new(dev: Arc<Device>, queue_family: u32) -> Self {
        let worker_count = thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1);
        log::info!("Job system starting {} workers", worker_count);

        let shared = Arc::new(JobShared {
            js_queue: Mutex::new(JobQueue {
                jq_jobs: VecDeque::new(),
                jq_ctx: None,
                jq_active: 0,
                jq_shutdown: false,
            }),
            js_work_cv: Condvar::new(),
            js_done_cv: Condvar::new(),
            js_results: AtomicStack::new(MAX_FRAME_COMMANDS),
        });

        let mut recorders = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let recorder = Arc::new(Mutex::new(SecondaryRecorder::new(
                dev.clone(),
                id,
                queue_family,
            )));
            recorders.push(recorder.clone());

            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("derecho-worker-{}", id))
                .spawn(move || {
                    Self::worker_main(shared, recorder);
                })
                .expect("Could not spawn worker thread");
            threads.push(handle);
        }

        Self {
            js_shared: shared,
            js_recorders: recorders,
            js_threads: threads,
        }
    }

    fn worker_main(shared: Arc<JobShared>, recorder: Arc<Mutex<SecondaryRecorder>>) {
        loop {
            // pull one job, or sleep until there is one
            let (job, ctx) = {
                let mut queue = shared.js_queue.lock().unwrap();
                loop {
                    if queue.jq_shutdown {
                        return;
                    }
                    if let Some(job) = queue.jq_jobs.pop_front() {
                        queue.jq_active += 1;
                        let ctx = queue.jq_ctx.clone().expect("jobs queued without a context");
                        break (job, ctx);
                    }
                    queue = shared.js_work_cv.wait(queue).unwrap();
                }
            };

            {
                let mut rec = recorder.lock().unwrap();
                match (job.j_record)(&ctx, &mut rec) {
                    Ok(cbuf) => shared.js_results.push(TaggedCbuf {
                        tc_rank: job.j_target.rank(),
                        tc_order: job.j_order,
                        tc_cbuf: cbuf,
                    }),
                    Err(e) => log::error!("Render job failed to record: {:?}", e),
                }
            }

            let mut queue = shared.js_queue.lock().unwrap();
            queue.jq_active -= 1;
            if queue.jq_jobs.is_empty() && queue.jq_active == 0 {
                shared.js_done_cv.notify_all();
            }
        }
    }

    /// Reset every worker's command pool for `image`. Main thread only,
    /// once per frame, before any job is dispatched.
    pub fn reset_command_buffers(&self, image: usize) {
        for recorder in self.js_recorders.iter() {
            recorder.lock().unwrap().reset(image);
        }
    }

    /// Push this frame's jobs and wake all workers.
    pub fn start(&self, jobs: Vec<Job>, ctx: Arc<FrameContext>) {
        let mut queue = self.js_shared.js_queue.lock().unwrap();
        queue.jq_ctx = Some(ctx);
        queue.jq_jobs.extend(jobs);
        self.js_shared.js_work_cv.notify_all();
    }

    /// Block the main thread until the queue is empty and every worker
    /// has gone idle.
    pub fn wait_for_finish(&self) {
        let mut queue = self.js_shared.js_queue.lock().unwrap();
        while !(queue.jq_jobs.is_empty() && queue.jq_active == 0) {
            queue = self.js_shared.js_done_cv.wait(queue).unwrap();
        }
        queue.jq_ctx = None;
    }

    /// Collect the frame's completed commands in submission order.
    /// Valid only after wait_for_finish.
    pub fn sorted_results(&self) -> Vec<TaggedCbuf> {
        let mut cmds = self.js_shared.js_results.take_all();
        sort_for_submission(&mut cmds);
        cmds
    }

    /// Tear down the worker pool and its Vulkan state. The caller
    /// guarantees the device is idle.
    pub unsafe fn destroy(&mut self) {
        {
            let mut queue = self.js_shared.js_queue.lock().unwrap();
            queue.jq_shutdown = true;
        }
        self.js_shared.js_work_cv.notify_all();
        for handle in self.js_threads.drain(..) {
            let _ = handle.join();
        }

        for recorder in self.js_recorders.iter() {
            recorder.lock().unwrap().destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn tag(rank: u32, order: i32, raw: u64) -> TaggedCbuf {
        TaggedCbuf {
            tc_rank: rank,
            tc_order: order,
            tc_cbuf: vk::CommandBuffer::from_raw(raw),
        }
    }

    #[test]
    fn submission_order_is_pass_major_then_key() {
        // completion order is adversarial: gui first, shadows last
        let mut cmds = vec![
            tag(PassTarget::Gui.rank(), 2, 10),
            tag(PassTarget::Gui.rank(), 0, 11),
            tag(PassTarget::ColorDepth.rank(), 5, 12),
            tag(PassTarget::Skybox.rank(), 0, 13),
            tag(PassTarget::ColorDepth.rank(), -3, 14),
            tag(PassTarget::Shadowmap(1).rank(), 0, 15),
            tag(PassTarget::Shadowmap(0).rank(), 7, 16),
        ];

        sort_for_submission(&mut cmds);

        let raw: Vec<u64> = cmds.iter().map(|c| c.tc_cbuf.as_raw()).collect();
        assert_eq!(raw, vec![16, 15, 13, 14, 12, 11, 10]);
    }

    #[test]
    fn equal_keys_keep_enqueue_order() {
        let mut cmds = vec![
            tag(PassTarget::Gui.rank(), 1, 1),
            tag(PassTarget::Gui.rank(), 1, 2),
            tag(PassTarget::Gui.rank(), 1, 3),
        ];
        sort_for_submission(&mut cmds);
        let raw: Vec<u64> = cmds.iter().map(|c| c.tc_cbuf.as_raw()).collect();
        assert_eq!(raw, vec![1, 2, 3]);
    }

    #[test]
    fn pass_ranks_follow_declared_pass_order() {
        assert!(PassTarget::Shadowmap(0).rank() < PassTarget::Shadowmap(3).rank());
        assert!(PassTarget::Shadowmap(3).rank() < PassTarget::Skybox.rank());
        assert!(PassTarget::Skybox.rank() < PassTarget::ColorDepth.rank());
        assert!(PassTarget::ColorDepth.rank() < PassTarget::Gui.rank());
    }

    #[test]
    fn atomic_stack_collects_concurrent_pushes() {
        let stack = Arc::new(AtomicStack::<usize>::new(1024));

        let mut handles = Vec::new();
        for t in 0..4 {
            let stack = stack.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    stack.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut all = stack.take_all();
        assert_eq!(all.len(), 400);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400, "pushes were lost or duplicated");
        assert_eq!(stack.len(), 0);
    }
}
