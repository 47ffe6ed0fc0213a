use std::hash::Hash;
use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::renderer::error::RenderError;

/// Logical queue a command buffer is recorded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Primary,
    AsyncCompute,
    AsyncTransfer,
}

impl QueueRole {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Primary, Self::AsyncCompute, Self::AsyncTransfer];

    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::AsyncCompute => 1,
            Self::AsyncTransfer => 2,
        }
    }
}

/// A physical hardware queue. Aliased roles share the same `Queue`.
pub struct Queue {
    pub family: QueueFamily,
    pub handle: vk::Queue,
    submit_lock: Mutex<()>,
}

impl Queue {
    pub fn new(
        family: QueueFamily,
        handle: vk::Queue,
    ) -> Self {
        Self {
            family,
            handle,
            submit_lock: Mutex::new(()),
        }
    }

    /// Serializes `vkQueueSubmit` calls between roles mapped onto this queue.
    pub fn lock_submit(&self) -> MutexGuard<'_, ()> {
        self.submit_lock.lock()
    }
}

#[derive(Clone, Debug)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        properties: vk::QueueFamilyProperties,
        supports_present: bool
    ) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    /// A family with the given flags and a single queue.
    pub fn with_flags(index: u32, queue_flags: vk::QueueFlags, supports_present: bool) -> Self {
        Self::new(
            index,
            vk::QueueFamilyProperties {
                queue_flags,
                queue_count: 1,
                ..Default::default()
            },
            supports_present,
        )
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_transfer(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
    }
}

impl PartialEq for QueueFamily {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QueueFamily {}

impl Hash for QueueFamily {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

/// Which physical queue serves each role.
#[derive(Clone)]
pub struct QueueMapping {
    queues: [Arc<Queue>; QueueRole::COUNT],
}

impl QueueMapping {
    pub fn new(primary: Arc<Queue>, async_compute: Arc<Queue>, async_transfer: Arc<Queue>) -> Self {
        Self {
            queues: [primary, async_compute, async_transfer],
        }
    }

    /// Every role on the same queue.
    pub fn single(queue: Arc<Queue>) -> Self {
        Self::new(queue.clone(), queue.clone(), queue)
    }

    pub fn queue(&self, role: QueueRole) -> &Arc<Queue> {
        &self.queues[role.index()]
    }

    /// Checks that every role sits on a family able to run its work.
    ///
    /// Graphics and compute families accept transfer commands without advertising it.
    pub fn validate(&self) -> Result<(), RenderError> {
        for role in QueueRole::ALL {
            let family = &self.queue(role).family;
            let capable = match role {
                QueueRole::Primary => family.supports_graphics(),
                QueueRole::AsyncCompute => family.supports_compute(),
                QueueRole::AsyncTransfer => {
                    family.supports_transfer() || family.supports_graphics() || family.supports_compute()
                }
            };
            if !capable {
                return Err(RenderError::UnsupportedQueueRole {
                    role,
                    family: family.index,
                });
            }
        }
        Ok(())
    }

    /// Whether both roles submit to the same physical queue.
    pub fn aliases(&self, a: QueueRole, b: QueueRole) -> bool {
        Arc::ptr_eq(self.queue(a), self.queue(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(family: u32) -> Arc<Queue> {
        Arc::new(Queue::new(
            QueueFamily::with_flags(family, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
            vk::Queue::null(),
        ))
    }

    #[test]
    fn single_mapping_aliases_every_role() {
        let mapping = QueueMapping::single(queue(0));
        assert!(mapping.aliases(QueueRole::Primary, QueueRole::AsyncTransfer));
        assert!(mapping.aliases(QueueRole::AsyncCompute, QueueRole::AsyncTransfer));
    }

    #[test]
    fn distinct_queues_do_not_alias() {
        let mapping = QueueMapping::new(queue(0), queue(1), queue(1));
        assert!(!mapping.aliases(QueueRole::Primary, QueueRole::AsyncCompute));
        assert!(!mapping.aliases(QueueRole::AsyncCompute, QueueRole::AsyncTransfer));
        assert!(mapping.queue(QueueRole::AsyncTransfer).family.supports_compute());
    }

    #[test]
    fn roles_need_capable_families() {
        let transfer_only = Arc::new(Queue::new(
            QueueFamily::with_flags(2, vk::QueueFlags::TRANSFER, false),
            vk::Queue::null(),
        ));
        assert!(QueueMapping::new(queue(0), queue(1), transfer_only.clone()).validate().is_ok());
        assert_eq!(
            QueueMapping::new(queue(0), transfer_only.clone(), transfer_only.clone()).validate(),
            Err(RenderError::UnsupportedQueueRole {
                role: QueueRole::AsyncCompute,
                family: 2,
            })
        );
        assert_eq!(
            QueueMapping::single(transfer_only).validate(),
            Err(RenderError::UnsupportedQueueRole {
                role: QueueRole::Primary,
                family: 2,
            })
        );

        // A graphics family takes transfer work even without the transfer flag.
        let graphics = Arc::new(Queue::new(
            QueueFamily::with_flags(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
            vk::Queue::null(),
        ));
        assert!(!graphics.family.supports_transfer());
        assert!(QueueMapping::single(graphics).validate().is_ok());
    }

    #[test]
    fn role_indices_are_dense() {
        for (i, role) in QueueRole::ALL.iter().enumerate() {
            assert_eq!(role.index(), i);
        }
    }
}
