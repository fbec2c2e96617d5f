use std::sync::{Mutex, MutexGuard};

use api::{error::DeviceError, types::QueueType};
use ash::vk;

use crate::device_error;

/// A device queue paired with the timeline semaphore that orders its submits.
pub(crate) struct VkQueue {
    pub ty: QueueType,
    pub family: u32,
    pub timeline: vk::Semaphore,
    state: Mutex<QueueState>,
}

pub(crate) struct QueueState {
    pub raw: vk::Queue,
    /// Value signalled by the most recent submit.
    pub last_value: u64,
}

impl VkQueue {
    pub unsafe fn new(
        device: &ash::Device,
        ty: QueueType,
        family: u32,
    ) -> Result<Self, DeviceError> {
        let raw = device.get_device_queue(family, 0);
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0)
            .build();
        let create_info = vk::SemaphoreCreateInfo::builder()
            .push_next(&mut type_info)
            .build();
        let timeline = device
            .create_semaphore(&create_info, None)
            .map_err(device_error)?;

        Ok(Self {
            ty,
            family,
            timeline,
            state: Mutex::new(QueueState { raw, last_value: 0 }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[inline(always)]
    pub unsafe fn current_value(&self, device: &ash::Device) -> Result<u64, DeviceError> {
        device
            .get_semaphore_counter_value(self.timeline)
            .map_err(device_error)
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.timeline, None);
    }
}
