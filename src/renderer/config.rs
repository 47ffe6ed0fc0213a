use crate::renderer::error::RenderError;

/// Contains configuration options for the renderer like the number of frames in flight,
/// worker threads, and descriptor cache sizing
#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// Number of frame contexts in the ring (F).
    pub frames_in_flight: usize,
    /// Number of worker threads that record command buffers.
    pub worker_threads: usize,
    /// Generations a descriptor set survives without being touched (R).
    pub descriptor_ring_depth: usize,
    /// Descriptor sets allocated per hardware pool growth (K).
    pub descriptor_pool_size: u32,
    /// Upper bound on signal semaphores requested from one submission.
    pub max_signal_semaphores: usize,
    /// Use timeline semaphores when the device supports them.
    pub prefer_timeline_semaphores: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            worker_threads: 1,
            descriptor_ring_depth: 8,
            descriptor_pool_size: 16,
            max_signal_semaphores: 4,
            prefer_timeline_semaphores: true,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.frames_in_flight == 0 {
            return Err(RenderError::InvalidConfig("frames_in_flight must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(RenderError::InvalidConfig("worker_threads must be at least 1"));
        }
        if self.descriptor_pool_size == 0 {
            return Err(RenderError::InvalidConfig("descriptor_pool_size must be at least 1"));
        }
        // An evicted set is rewritten immediately, so it must have left every in-flight frame.
        if self.descriptor_ring_depth < self.frames_in_flight {
            return Err(RenderError::InvalidConfig(
                "descriptor_ring_depth must not be smaller than frames_in_flight",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RenderConfig::default().validate().is_ok());
    }

    #[test]
    fn ring_shallower_than_frame_ring_is_rejected() {
        let config = RenderConfig {
            frames_in_flight: 3,
            descriptor_ring_depth: 2,
            ..RenderConfig::default()
        };
        assert!(matches!(config.validate(), Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = RenderConfig {
            worker_threads: 0,
            ..RenderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
