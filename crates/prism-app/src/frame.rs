//! Per-frame execution.
//!
//! One frame is in flight at a time. Each call to [`FrameExecutor::run_frame`]
//! walks the phases in order:
//!
//! `Idle → ImageAcquired → DescriptorUpdated → Recorded → Submitted → Presented → Idle`
//!
//! The GPU work behind each phase lives in a [`FrameBackend`], so the
//! sequencing can be exercised without a device.

use ash::vk;
use prism_gpu::{GpuError, Result};
use prism_rt::SbtRegions;
use tracing::trace;

/// Where a frame currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    ImageAcquired,
    DescriptorUpdated,
    Recorded,
    Submitted,
    Presented,
}

/// State carried from one frame to the next.
#[derive(Debug)]
pub struct FrameState {
    phase: FramePhase,
    image_index: Option<u32>,
    image_acquired: vk::Semaphore,
    /// One per swapchain image, picked by the acquired index.
    render_complete: Vec<vk::Semaphore>,
    command_buffer: vk::CommandBuffer,
    frames_presented: u64,
}

impl FrameState {
    pub fn new(
        image_acquired: vk::Semaphore,
        render_complete: Vec<vk::Semaphore>,
        command_buffer: vk::CommandBuffer,
    ) -> Self {
        Self {
            phase: FramePhase::Idle,
            image_index: None,
            image_acquired,
            render_complete,
            command_buffer,
            frames_presented: 0,
        }
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Image acquired by the frame in progress.
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    fn validate(&self) -> Result<()> {
        if self.image_acquired == vk::Semaphore::null() {
            return Err(GpuError::NullHandle("image-acquired semaphore"));
        }
        if self.render_complete.is_empty()
            || self.render_complete.contains(&vk::Semaphore::null())
        {
            return Err(GpuError::NullHandle("render-complete semaphore"));
        }
        if self.command_buffer == vk::CommandBuffer::null() {
            return Err(GpuError::NullHandle("frame command buffer"));
        }
        Ok(())
    }

    /// Render-complete semaphore for `image_index`.
    fn render_complete_for(&self, image_index: u32) -> Result<vk::Semaphore> {
        self.render_complete
            .get(image_index as usize)
            .copied()
            .ok_or(GpuError::ImageIndexOutOfRange {
                index: image_index,
                count: self.render_complete.len() as u32,
            })
    }

    fn advance(&mut self, phase: FramePhase) {
        trace!("frame {}: {:?} -> {:?}", self.frames_presented, self.phase, phase);
        self.phase = phase;
    }
}

/// GPU operations behind each frame phase.
pub trait FrameBackend {
    /// Number of swapchain images.
    fn image_count(&self) -> u32;

    /// Acquire the next image, signalling `signal` when it is ready.
    fn acquire(&mut self, signal: vk::Semaphore) -> Result<u32>;

    /// Point the output image binding at the image.
    fn bind_output(&mut self, image_index: u32) -> Result<()>;

    /// Record the frame's commands into `cmd`.
    fn record(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()>;

    /// Submit `cmd` and wait for the queue to go idle.
    fn submit(&mut self, cmd: vk::CommandBuffer, wait: vk::Semaphore, signal: vk::Semaphore)
        -> Result<()>;

    /// Present the image once `wait` signals.
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()>;
}

/// Drives a [`FrameBackend`] through one frame.
pub struct FrameExecutor;

impl FrameExecutor {
    /// Acquire, bind, record, submit and present one frame.
    ///
    /// Returns the presented image index. On error the state keeps the last
    /// phase that completed, and later calls are rejected. An acquired index
    /// outside the swapchain counts as acquired, so the frame stops in
    /// `ImageAcquired`.
    pub fn run_frame<B: FrameBackend + ?Sized>(
        state: &mut FrameState,
        backend: &mut B,
    ) -> Result<u32> {
        if state.phase != FramePhase::Idle {
            return Err(GpuError::InvalidState(format!(
                "previous frame stopped at {:?}",
                state.phase
            )));
        }
        state.validate()?;

        let image_count = backend.image_count();
        let index = backend.acquire(state.image_acquired)?;
        state.image_index = Some(index);
        state.advance(FramePhase::ImageAcquired);

        if index >= image_count {
            return Err(GpuError::ImageIndexOutOfRange {
                index,
                count: image_count,
            });
        }
        let render_complete = state.render_complete_for(index)?;

        backend.bind_output(index)?;
        state.advance(FramePhase::DescriptorUpdated);

        backend.record(state.command_buffer, index)?;
        state.advance(FramePhase::Recorded);

        backend.submit(state.command_buffer, state.image_acquired, render_complete)?;
        state.advance(FramePhase::Submitted);

        backend.present(index, render_complete)?;
        state.advance(FramePhase::Presented);

        state.frames_presented += 1;
        state.image_index = None;
        state.advance(FramePhase::Idle);

        Ok(index)
    }
}

/// Everything a dispatch needs that stays fixed for the lifetime of the renderer.
#[derive(Debug, Clone, Copy)]
pub struct DispatchBindings {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub tlas: vk::AccelerationStructureKHR,
    pub tlas_address: vk::DeviceAddress,
    pub sbt: SbtRegions,
    pub extent: vk::Extent2D,
}

/// Per-image handles rendered to in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

/// What one frame records: the fixed bindings plus the acquired image's target.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecording<'a> {
    pub bindings: &'a DispatchBindings,
    pub target: SwapchainTarget,
    pub image_index: u32,
}

impl<'a> FrameRecording<'a> {
    /// Select the target for `image_index`.
    pub fn new(
        bindings: &'a DispatchBindings,
        targets: &[SwapchainTarget],
        image_index: u32,
    ) -> Result<Self> {
        let target = targets
            .get(image_index as usize)
            .copied()
            .ok_or(GpuError::ImageIndexOutOfRange {
                index: image_index,
                count: targets.len() as u32,
            })?;
        Ok(Self {
            bindings,
            target,
            image_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use prism_gpu::{ErrorKind, RayTracingProperties};
    use prism_rt::SbtLayout;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Acquire,
        Bind(u32),
        Record(u32),
        Submit(vk::Semaphore),
        Present(u32, vk::Semaphore),
    }

    /// Backend that hands out scripted image indices and logs every call.
    struct MockBackend {
        image_count: u32,
        next_indices: Vec<u32>,
        calls: Vec<Call>,
        bindings: DispatchBindings,
        targets: Vec<SwapchainTarget>,
        recorded: Vec<(DispatchBindings, SwapchainTarget)>,
        bound_views: Vec<vk::ImageView>,
        fail_acquire: Option<vk::Result>,
        fail_present: Option<vk::Result>,
    }

    impl MockBackend {
        fn new(image_count: u32, next_indices: Vec<u32>) -> Self {
            let targets = (0..image_count)
                .map(|i| SwapchainTarget {
                    image: vk::Image::from_raw(0x100 + u64::from(i)),
                    view: vk::ImageView::from_raw(0x200 + u64::from(i)),
                    framebuffer: vk::Framebuffer::from_raw(0x300 + u64::from(i)),
                })
                .collect();
            Self {
                image_count,
                next_indices,
                calls: Vec::new(),
                bindings: bindings(),
                targets,
                recorded: Vec::new(),
                bound_views: Vec::new(),
                fail_acquire: None,
                fail_present: None,
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn image_count(&self) -> u32 {
            self.image_count
        }

        fn acquire(&mut self, signal: vk::Semaphore) -> Result<u32> {
            assert_ne!(signal, vk::Semaphore::null());
            self.calls.push(Call::Acquire);
            if let Some(e) = self.fail_acquire {
                return Err(GpuError::AcquireImage(e));
            }
            Ok(self.next_indices.remove(0))
        }

        fn bind_output(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::Bind(image_index));
            let recording = FrameRecording::new(&self.bindings, &self.targets, image_index)?;
            self.bound_views.push(recording.target.view);
            Ok(())
        }

        fn record(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
            assert_eq!(cmd, command_buffer());
            self.calls.push(Call::Record(image_index));
            let recording = FrameRecording::new(&self.bindings, &self.targets, image_index)?;
            self.recorded.push((*recording.bindings, recording.target));
            Ok(())
        }

        fn submit(
            &mut self,
            cmd: vk::CommandBuffer,
            wait: vk::Semaphore,
            signal: vk::Semaphore,
        ) -> Result<()> {
            assert_eq!(cmd, command_buffer());
            assert_eq!(wait, image_acquired());
            self.calls.push(Call::Submit(signal));
            Ok(())
        }

        fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()> {
            self.calls.push(Call::Present(image_index, wait));
            match self.fail_present {
                Some(e) => Err(GpuError::Present(e)),
                None => Ok(()),
            }
        }
    }

    fn image_acquired() -> vk::Semaphore {
        vk::Semaphore::from_raw(0x10)
    }

    /// Render-complete semaphore of swapchain image `index`.
    fn render_complete(index: u32) -> vk::Semaphore {
        vk::Semaphore::from_raw(0x30 + u64::from(index))
    }

    fn render_complete_set(count: u32) -> Vec<vk::Semaphore> {
        (0..count).map(render_complete).collect()
    }

    fn command_buffer() -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(0x12)
    }

    /// Bindings over an SBT laid out the way the device reports, one miss and one hit.
    fn bindings() -> DispatchBindings {
        let props = RayTracingProperties {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
            max_recursion_depth: 1,
        };
        DispatchBindings {
            pipeline: vk::Pipeline::from_raw(0x20),
            pipeline_layout: vk::PipelineLayout::from_raw(0x21),
            descriptor_set: vk::DescriptorSet::from_raw(0x22),
            tlas: vk::AccelerationStructureKHR::from_raw(0x23),
            tlas_address: 0xA000,
            sbt: SbtLayout::new(&props, 1, 1).regions(0xB000),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
        }
    }

    fn state() -> FrameState {
        FrameState::new(image_acquired(), render_complete_set(3), command_buffer())
    }

    #[test]
    fn frame_runs_phases_in_order() {
        let mut state = state();
        let mut backend = MockBackend::new(3, vec![1]);

        let index = FrameExecutor::run_frame(&mut state, &mut backend).unwrap();

        assert_eq!(index, 1);
        assert_eq!(
            backend.calls,
            vec![
                Call::Acquire,
                Call::Bind(1),
                Call::Record(1),
                Call::Submit(render_complete(1)),
                Call::Present(1, render_complete(1))
            ]
        );
        assert_eq!(state.phase(), FramePhase::Idle);
        assert_eq!(state.image_index(), None);
        assert_eq!(state.frames_presented(), 1);
        assert_eq!(backend.bound_views, vec![vk::ImageView::from_raw(0x201)]);
    }

    #[test]
    fn repeated_frames_differ_only_in_target() {
        let mut state = state();
        let mut backend = MockBackend::new(3, vec![0, 1, 2, 0, 1]);

        for _ in 0..5 {
            FrameExecutor::run_frame(&mut state, &mut backend).unwrap();
        }

        assert_eq!(state.frames_presented(), 5);
        assert_eq!(backend.calls.len(), 25);
        for (chunk, index) in backend.calls.chunks(5).zip([0, 1, 2, 0, 1]) {
            assert_eq!(
                chunk,
                [
                    Call::Acquire,
                    Call::Bind(index),
                    Call::Record(index),
                    Call::Submit(render_complete(index)),
                    Call::Present(index, render_complete(index))
                ]
            );
        }

        // Every frame traces the same regions: raygen sized to one base-aligned
        // stride, then miss and hit at their 64-byte region offsets.
        for (recorded, _) in &backend.recorded {
            let sbt = recorded.sbt;
            assert_eq!(
                (sbt.raygen.device_address, sbt.raygen.stride, sbt.raygen.size),
                (0xB000, 64, 64)
            );
            assert_eq!(
                (sbt.miss.device_address, sbt.miss.stride, sbt.miss.size),
                (0xB040, 32, 64)
            );
            assert_eq!(
                (sbt.hit.device_address, sbt.hit.stride, sbt.hit.size),
                (0xB080, 32, 64)
            );
            assert_eq!(sbt.callable.size, 0);
            assert_eq!((recorded.extent.width, recorded.extent.height), (800, 600));
        }

        let views: Vec<_> = backend.recorded.iter().map(|(_, target)| target.view).collect();
        assert_eq!(
            views,
            [0x200, 0x201, 0x202, 0x200, 0x201].map(vk::ImageView::from_raw)
        );
    }

    #[test]
    fn out_of_range_index_is_rejected_before_recording() {
        let mut state = state();
        let mut backend = MockBackend::new(3, vec![3]);

        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();

        assert!(matches!(
            err,
            GpuError::ImageIndexOutOfRange { index: 3, count: 3 }
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(backend.calls, vec![Call::Acquire]);
        assert!(backend.recorded.is_empty());
        assert_eq!(state.phase(), FramePhase::ImageAcquired);
        assert_eq!(state.image_index(), Some(3));
        assert_eq!(state.frames_presented(), 0);
    }

    #[test]
    fn frame_after_out_of_range_index_is_refused() {
        let mut state = state();
        let mut backend = MockBackend::new(3, vec![7, 0]);

        assert!(FrameExecutor::run_frame(&mut state, &mut backend).is_err());
        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();

        assert!(matches!(err, GpuError::InvalidState(_)));
        assert_eq!(backend.calls, vec![Call::Acquire]);
        assert_eq!(backend.next_indices, vec![0]);
        assert_eq!(state.image_index(), Some(7));
    }

    #[test]
    fn index_without_its_own_semaphore_is_rejected() {
        // The swapchain reports more images than the frame has semaphores for.
        let mut state = FrameState::new(image_acquired(), render_complete_set(2), command_buffer());
        let mut backend = MockBackend::new(3, vec![2]);

        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();

        assert!(matches!(
            err,
            GpuError::ImageIndexOutOfRange { index: 2, count: 2 }
        ));
        assert_eq!(backend.calls, vec![Call::Acquire]);
        assert_eq!(state.phase(), FramePhase::ImageAcquired);
    }

    #[test]
    fn null_sync_handles_are_rejected() {
        let mut backend = MockBackend::new(3, vec![0]);

        let mut state =
            FrameState::new(vk::Semaphore::null(), render_complete_set(3), command_buffer());
        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();
        assert!(matches!(err, GpuError::NullHandle(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let mut state =
            FrameState::new(image_acquired(), render_complete_set(3), vk::CommandBuffer::null());
        assert!(FrameExecutor::run_frame(&mut state, &mut backend).is_err());

        let mut state = FrameState::new(image_acquired(), Vec::new(), command_buffer());
        assert!(FrameExecutor::run_frame(&mut state, &mut backend).is_err());

        let mut semaphores = render_complete_set(3);
        semaphores[1] = vk::Semaphore::null();
        let mut state = FrameState::new(image_acquired(), semaphores, command_buffer());
        assert!(FrameExecutor::run_frame(&mut state, &mut backend).is_err());

        assert!(backend.calls.is_empty());
    }

    #[test]
    fn acquire_failure_stops_the_frame() {
        let mut state = state();
        let mut backend = MockBackend::new(3, vec![0]);
        backend.fail_acquire = Some(vk::Result::SUBOPTIMAL_KHR);

        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();

        assert!(matches!(err, GpuError::AcquireImage(_)));
        assert_eq!(err.kind(), ErrorKind::GpuOperation);
        assert_eq!(backend.calls, vec![Call::Acquire]);
        assert_eq!(state.phase(), FramePhase::Idle);
        assert_eq!(state.frames_presented(), 0);
    }

    #[test]
    fn present_failure_leaves_frame_submitted() {
        let mut state = state();
        let mut backend = MockBackend::new(2, vec![0, 1]);
        backend.fail_present = Some(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();
        assert!(matches!(err, GpuError::Present(_)));
        assert_eq!(state.phase(), FramePhase::Submitted);
        assert_eq!(state.image_index(), Some(0));
        assert_eq!(state.frames_presented(), 0);

        // The stuck frame blocks any further work.
        let calls_before = backend.calls.len();
        let err = FrameExecutor::run_frame(&mut state, &mut backend).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(backend.calls.len(), calls_before);
    }

    #[test]
    fn recording_selects_target_by_index() {
        let bindings = bindings();
        let targets = [
            SwapchainTarget {
                image: vk::Image::from_raw(1),
                view: vk::ImageView::from_raw(2),
                framebuffer: vk::Framebuffer::from_raw(3),
            },
            SwapchainTarget {
                image: vk::Image::from_raw(4),
                view: vk::ImageView::from_raw(5),
                framebuffer: vk::Framebuffer::from_raw(6),
            },
        ];

        let recording = FrameRecording::new(&bindings, &targets, 1).unwrap();
        assert_eq!(recording.target, targets[1]);
        assert_eq!(recording.image_index, 1);

        assert!(matches!(
            FrameRecording::new(&bindings, &targets, 2),
            Err(GpuError::ImageIndexOutOfRange { index: 2, count: 2 })
        ));
    }
}
