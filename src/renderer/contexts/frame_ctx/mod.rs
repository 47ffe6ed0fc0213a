pub mod frame;

use color_eyre::Result;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::RenderDeviceContext;
use crate::renderer::contexts::frame_ctx::frame::Frame;
use crate::renderer::internals::per_thread::OwnerId;

/// Responsibilities:
/// - Manage per-frame command pools and pending submissions
/// - Track which work each frame is waiting on
/// - Hold released objects back until their frame retires
pub struct RenderFrameContext {
    frames: Vec<Frame>,
    current: usize,
    serial: u64,
}

impl RenderFrameContext {
    pub fn new(dev_ctx: &RenderDeviceContext, owner: OwnerId, config: &RenderConfig) -> Result<Self> {
        let frames = (0..config.frames_in_flight)
            .map(|_| Frame::new(&dev_ctx.hal, owner, config.worker_threads, &dev_ctx.queues))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            frames,
            current: 0,
            serial: 1,
        })
    }

    pub fn current(&self) -> &Frame {
        &self.frames[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Frame {
        &mut self.frames[self.current]
    }

    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    /// Index of the current frame in the ring.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Increases by one every frame. Command buffers remember the serial they were recorded in.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Moves to the next frame in the ring. The caller retires it before use.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
        self.serial += 1;
    }

    /// Starts a new serial without moving in the ring.
    pub fn bump_serial(&mut self) {
        self.serial += 1;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
