use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ash::vk;
use color_eyre::Result;

use crate::renderer::contexts::device_ctx::queue::QueueRole;
use crate::renderer::contexts::resource_ctx::binding_state::{BindingState, MAX_DESCRIPTOR_SETS, ResourceBinding};
use crate::renderer::contexts::resource_ctx::descriptor_set_cache::FlushedSet;
use crate::renderer::contexts::resource_ctx::program_layout::ProgramLayout;
use crate::renderer::error::{HalResultExt, RenderError};
use crate::renderer::hal::RenderHal;
use crate::renderer::internals::per_thread::WorkerToken;

/// A command buffer being recorded for one queue role in one frame.
pub struct CommandBuffer {
    raw: vk::CommandBuffer,
    role: QueueRole,
    thread_index: usize,
    frame_serial: u64,
    is_recording: bool,
    swapchain_stages: vk::PipelineStageFlags2,

    bindings: BindingState,
    program: Option<Arc<ProgramLayout>>,
    dirty_sets: u32,
    flushed: [Option<FlushedSet>; MAX_DESCRIPTOR_SETS],

    outstanding: Arc<AtomicUsize>,
    hal: Arc<dyn RenderHal>,
}

impl CommandBuffer {
    pub(crate) fn new(
        raw: vk::CommandBuffer,
        role: QueueRole,
        thread_index: usize,
        frame_serial: u64,
        outstanding: Arc<AtomicUsize>,
        hal: Arc<dyn RenderHal>,
    ) -> Self {
        Self {
            raw,
            role,
            thread_index,
            frame_serial,
            is_recording: true,
            swapchain_stages: vk::PipelineStageFlags2::NONE,
            bindings: BindingState::default(),
            program: None,
            dirty_sets: 0,
            flushed: Default::default(),
            outstanding,
            hal,
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn frame_serial(&self) -> u64 {
        self.frame_serial
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn end_recording(&mut self) -> Result<()> {
        if !self.is_recording {
            return Err(RenderError::NotRecording.into());
        }

        self.hal
            .end_command_buffer(self.raw)
            .hal_context("vkEndCommandBuffer")?;

        self.is_recording = false;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        Ok(())
    }

    /// Marks that this buffer renders to the presentation surface in the given stages.
    ///
    /// Its batch will wait on the surface acquire semaphore.
    pub fn touch_swapchain(&mut self, stages: vk::PipelineStageFlags2) {
        self.swapchain_stages |= stages;
    }

    pub fn swapchain_stages(&self) -> vk::PipelineStageFlags2 {
        self.swapchain_stages
    }

    /// Binds a program layout. Every set it uses must be flushed again.
    pub fn set_program_layout(&mut self, program: Arc<ProgramLayout>) {
        let unchanged = self
            .program
            .as_ref()
            .is_some_and(|current| current.hash() == program.hash());
        if !unchanged {
            self.dirty_sets = program.active_sets();
            self.flushed = Default::default();
            self.program = Some(program);
        }
    }

    pub fn program_layout(&self) -> Option<&Arc<ProgramLayout>> {
        self.program.as_ref()
    }

    /// The resource slot for `(set, binding, array_index)`. Marks the set dirty.
    pub fn binding_slot(&mut self, set: u32, binding: u32, array_index: u32) -> Result<&mut ResourceBinding> {
        if !self.is_recording {
            return Err(RenderError::NotRecording.into());
        }
        let slot = self.bindings.slot_mut(set, binding, array_index)?;
        self.dirty_sets |= 1 << set;
        Ok(slot)
    }

    pub fn bindings(&self) -> &BindingState {
        &self.bindings
    }

    /// Bit `i` is set when set `i` changed since it was last flushed.
    pub fn dirty_sets(&self) -> u32 {
        self.dirty_sets
    }

    /// Returns a descriptor set for the current bindings of `set`.
    ///
    /// A set that has not changed since the last flush returns the same result without hashing.
    /// Only a buffer still recording in frame `current_serial`, flushed with the token it was
    /// requested with, may reach the worker's cache.
    pub(crate) fn flush_binding_table(
        &mut self,
        token: &mut WorkerToken,
        current_serial: u64,
        set: u32,
    ) -> Result<FlushedSet> {
        if self.frame_serial != current_serial {
            return Err(RenderError::StaleCommandBuffer {
                recorded: self.frame_serial,
                current: current_serial,
            }
            .into());
        }
        if !self.is_recording {
            return Err(RenderError::NotRecording.into());
        }
        if token.index() != self.thread_index {
            return Err(RenderError::WorkerMismatch {
                recorded: self.thread_index,
                flushed: token.index(),
            }
            .into());
        }

        let program = self.program.as_ref().ok_or(RenderError::UnknownDescriptorSet { set })?;
        let allocator = program.set_allocator(set)?;
        let index = set as usize;

        if self.dirty_sets & (1 << set) == 0 {
            if let Some(flushed) = &self.flushed[index] {
                return Ok(flushed.clone());
            }
        }

        let flushed = allocator.flush(token, self.frame_serial, self.bindings.set(set)?, set)?;
        self.flushed[index] = Some(flushed.clone());
        self.dirty_sets &= !(1 << set);
        Ok(flushed)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.is_recording {
            log::warn!("Dropping command buffer for {:?} while still recording", self.role);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
