use std::{
    ffi::{CStr, CString},
    os::raw::c_char,
    time::Duration,
};

use api::{
    error::DeviceError,
    types::{PipelineStage, QueryKind, QueryReadback, QueueType},
    Backend, SubmitBatch,
};
use ash::vk;
use log::{info, warn};
use thiserror::Error;

mod command_buffer;
mod queue;

pub use command_buffer::{VkCommandBuffer, VkQueryPool, VkSemaphore, VkToken};
use queue::VkQueue;

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

#[derive(Debug, Error)]
pub enum VulkanCreateError {
    #[error("unable to load the vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("no device supports vulkan 1.2 with a graphics queue")]
    NoDevice,
    #[error("an error has occured: {0}")]
    Other(#[from] vk::Result),
}

pub struct VulkanCreateInfo {
    pub app_name: String,
    /// Enables the Khronos validation layer when it is installed.
    pub validation: bool,
    /// Index into the enumerated physical devices. The first suitable device is used
    /// when `None`.
    pub device_index: Option<usize>,
}

impl Default for VulkanCreateInfo {
    fn default() -> Self {
        Self {
            app_name: String::from("gpu-pipe"),
            validation: cfg!(debug_assertions),
            device_index: None,
        }
    }
}

pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queues: Vec<VkQueue>,
    queue_types: Vec<QueueType>,
    timestamp_period: f32,
}

impl VulkanBackend {
    pub fn new(create_info: VulkanCreateInfo) -> Result<Self, VulkanCreateError> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(create_info.app_name).unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .engine_name(&app_name)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let mut layers: Vec<*const c_char> = Vec::default();
        if create_info.validation {
            let available = entry.enumerate_instance_layer_properties()?;
            let wanted = unsafe { CStr::from_bytes_with_nul_unchecked(VALIDATION_LAYER) };
            if available
                .iter()
                .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) } == wanted)
            {
                layers.push(wanted.as_ptr());
            } else {
                warn!("validation requested but the validation layer is not installed");
            }
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_layer_names(&layers)
                    .build(),
                None,
            )?
        };

        let device_index = create_info.device_index;
        match unsafe { Self::create_device(entry, instance.clone(), device_index) } {
            Ok(backend) => Ok(backend),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    unsafe fn create_device(
        entry: ash::Entry,
        instance: ash::Instance,
        device_index: Option<usize>,
    ) -> Result<Self, VulkanCreateError> {
        let physical_devices = instance.enumerate_physical_devices()?;
        let candidates = physical_devices
            .iter()
            .enumerate()
            .filter(|(i, _)| device_index.map_or(true, |wanted| wanted == *i))
            .map(|(_, pdevice)| *pdevice);

        let mut selected = None;
        for pdevice in candidates {
            let properties = instance.get_physical_device_properties(pdevice);
            if properties.api_version < vk::API_VERSION_1_2 {
                continue;
            }
            let families = instance.get_physical_device_queue_family_properties(pdevice);
            if let Some(layout) = QueueLayout::find(&families) {
                selected = Some((pdevice, properties, layout));
                break;
            }
        }
        let (pdevice, properties, layout) = selected.ok_or(VulkanCreateError::NoDevice)?;

        let name = CStr::from_ptr(properties.device_name.as_ptr());
        info!("using vulkan device {name:?}");

        let priorities = [1.0];
        let queue_infos = layout
            .families()
            .map(|(_, family)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect::<Vec<_>>();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .build();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features12)
            .build();
        let device = instance.create_device(pdevice, &device_info, None)?;

        let mut queues = Vec::default();
        for (ty, family) in layout.families() {
            match VkQueue::new(&device, ty, family) {
                Ok(queue) => queues.push(queue),
                Err(err) => {
                    for queue in &queues {
                        queue.destroy(&device);
                    }
                    device.destroy_device(None);
                    return Err(VulkanCreateError::Other(match err {
                        DeviceError::OutOfMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                        _ => vk::Result::ERROR_INITIALIZATION_FAILED,
                    }));
                }
            }
        }

        Ok(Self {
            _entry: entry,
            instance,
            device,
            queue_types: queues.iter().map(|queue| queue.ty).collect(),
            queues,
            timestamp_period: properties.limits.timestamp_period,
        })
    }

    #[inline(always)]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn queue(&self, ty: QueueType) -> Result<&VkQueue, DeviceError> {
        self.queues
            .iter()
            .find(|queue| queue.ty == ty)
            .ok_or_else(|| DeviceError::Other(format!("no {ty:?} queue on this device")))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {err}");
            }
            for queue in &self.queues {
                queue.destroy(&self.device);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Backend for VulkanBackend {
    type CommandBuffer = VkCommandBuffer;
    type QueryPool = VkQueryPool;
    type Semaphore = VkSemaphore;
    type Token = VkToken;

    fn queue_types(&self) -> &[QueueType] {
        &self.queue_types
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    unsafe fn create_command_buffer(
        &self,
        queue: QueueType,
    ) -> Result<Self::CommandBuffer, DeviceError> {
        let family = self.queue(queue)?.family;
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .build();
        let pool = self
            .device
            .create_command_pool(&pool_info, None)
            .map_err(device_error)?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1)
            .build();
        match self.device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => Ok(VkCommandBuffer {
                pool,
                buffer: buffers[0],
            }),
            Err(err) => {
                self.device.destroy_command_pool(pool, None);
                Err(device_error(err))
            }
        }
    }

    unsafe fn begin_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();
        self.device
            .begin_command_buffer(cb.buffer, &begin_info)
            .map_err(device_error)
    }

    unsafe fn end_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError> {
        self.device
            .end_command_buffer(cb.buffer)
            .map_err(device_error)
    }

    unsafe fn reset_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError> {
        self.device
            .reset_command_pool(cb.pool, vk::CommandPoolResetFlags::empty())
            .map_err(device_error)
    }

    unsafe fn destroy_command_buffer(&self, cb: Self::CommandBuffer) {
        // Destroying the pool frees the buffer.
        self.device.destroy_command_pool(cb.pool, None);
    }

    unsafe fn create_semaphore(&self) -> Result<Self::Semaphore, DeviceError> {
        let raw = self
            .device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            .map_err(device_error)?;
        Ok(VkSemaphore { raw })
    }

    unsafe fn destroy_semaphore(&self, semaphore: &mut Self::Semaphore) {
        self.device.destroy_semaphore(semaphore.raw, None);
    }

    unsafe fn create_query_pool(
        &self,
        kind: QueryKind,
        count: u32,
    ) -> Result<Self::QueryPool, DeviceError> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(match kind {
                QueryKind::Occlusion => vk::QueryType::OCCLUSION,
                QueryKind::Timestamp => vk::QueryType::TIMESTAMP,
            })
            .query_count(count)
            .build();
        let raw = self
            .device
            .create_query_pool(&create_info, None)
            .map_err(device_error)?;
        Ok(VkQueryPool { raw })
    }

    unsafe fn destroy_query_pool(&self, pool: Self::QueryPool) {
        self.device.destroy_query_pool(pool.raw, None);
    }

    unsafe fn cmd_reset_query_pool(
        &self,
        cb: &mut Self::CommandBuffer,
        pool: &Self::QueryPool,
        first: u32,
        count: u32,
    ) {
        self.device
            .cmd_reset_query_pool(cb.buffer, pool.raw, first, count);
    }

    unsafe fn cmd_begin_query(&self, cb: &mut Self::CommandBuffer, pool: &Self::QueryPool, index: u32) {
        self.device
            .cmd_begin_query(cb.buffer, pool.raw, index, vk::QueryControlFlags::empty());
    }

    unsafe fn cmd_end_query(&self, cb: &mut Self::CommandBuffer, pool: &Self::QueryPool, index: u32) {
        self.device.cmd_end_query(cb.buffer, pool.raw, index);
    }

    unsafe fn cmd_write_timestamp(
        &self,
        cb: &mut Self::CommandBuffer,
        pool: &Self::QueryPool,
        index: u32,
        stage: PipelineStage,
    ) {
        self.device
            .cmd_write_timestamp(cb.buffer, timestamp_stage(stage), pool.raw, index);
    }

    unsafe fn read_query_results(
        &self,
        pool: &Self::QueryPool,
        first: u32,
        out: &mut [QueryReadback],
    ) -> Result<(), DeviceError> {
        // Each slot reads back as its value followed by an availability word.
        let mut data = vec![[0u64; 2]; out.len()];
        let result = self.device.get_query_pool_results(
            pool.raw,
            first,
            out.len() as u32,
            &mut data,
            vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY,
        );
        match result {
            Ok(()) | Err(vk::Result::NOT_READY) => {}
            Err(err) => return Err(device_error(err)),
        }

        for (readback, [value, available]) in out.iter_mut().zip(data) {
            *readback = QueryReadback {
                value,
                available: available != 0,
            };
        }
        Ok(())
    }

    unsafe fn submit(
        &self,
        queue: QueueType,
        batches: &[SubmitBatch<'_, Self>],
    ) -> Result<Self::Token, DeviceError> {
        let queue = self.queue(queue)?;
        let last = match batches.len().checked_sub(1) {
            Some(last) => last,
            None => return Err(DeviceError::Other(String::from("empty submit"))),
        };

        let waits = batches
            .iter()
            .map(|batch| batch.waits.iter().map(|(s, _)| s.raw).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let stages = batches
            .iter()
            .map(|batch| {
                batch
                    .waits
                    .iter()
                    .map(|(_, stage)| stage_flags(*stage))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let command_buffers = batches
            .iter()
            .map(|batch| {
                batch
                    .command_buffers
                    .iter()
                    .map(|cb| cb.buffer)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let mut signals = batches
            .iter()
            .map(|batch| batch.signals.iter().map(|s| s.raw).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let mut state = queue.lock();
        let value = state.last_value + 1;

        // Only the final batch advances the timeline. Binary semaphores ignore their
        // entries in the value arrays.
        signals[last].push(queue.timeline);
        let wait_values = vec![0u64; waits[last].len()];
        let mut signal_values = vec![0u64; signals[last].len()];
        signal_values[signals[last].len() - 1] = value;
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values)
            .build();

        let mut submits = Vec::with_capacity(batches.len());
        for i in 0..batches.len() {
            let mut submit = vk::SubmitInfo::builder()
                .wait_semaphores(&waits[i])
                .wait_dst_stage_mask(&stages[i])
                .command_buffers(&command_buffers[i])
                .signal_semaphores(&signals[i]);
            if i == last {
                submit = submit.push_next(&mut timeline_info);
            }
            submits.push(submit.build());
        }

        self.device
            .queue_submit(state.raw, &submits, vk::Fence::null())
            .map_err(device_error)?;
        state.last_value = value;
        Ok(VkToken { value })
    }

    fn poll(&self, queue: QueueType, token: &Self::Token) -> Result<bool, DeviceError> {
        let queue = self.queue(queue)?;
        let current = unsafe { queue.current_value(&self.device)? };
        Ok(current >= token.value)
    }

    fn wait_for_any(
        &self,
        tokens: &[(QueueType, &Self::Token)],
        timeout: Duration,
    ) -> Result<bool, DeviceError> {
        let mut semaphores = Vec::with_capacity(tokens.len());
        let mut values = Vec::with_capacity(tokens.len());
        for (ty, token) in tokens {
            semaphores.push(self.queue(*ty)?.timeline);
            values.push(token.value);
        }
        if semaphores.is_empty() {
            return Ok(false);
        }

        let wait_info = vk::SemaphoreWaitInfo::builder()
            .flags(vk::SemaphoreWaitFlags::ANY)
            .semaphores(&semaphores)
            .values(&values)
            .build();
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_semaphores(&wait_info, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(device_error(err)),
        }
    }
}

pub(crate) fn device_error(err: vk::Result) -> DeviceError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => DeviceError::Lost(err.to_string()),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DeviceError::OutOfMemory
        }
        _ => DeviceError::Other(err.to_string()),
    }
}

/// Queue families backing each exposed queue type. Compute and transfer are only
/// exposed when the device has dedicated families for them.
struct QueueLayout {
    main: u32,
    compute: Option<u32>,
    transfer: Option<u32>,
}

impl QueueLayout {
    fn find(families: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            families
                .iter()
                .position(|family| {
                    family.queue_count > 0
                        && family.queue_flags.contains(required)
                        && !family.queue_flags.intersects(excluded)
                })
                .map(|idx| idx as u32)
        };

        Some(Self {
            main: find(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                vk::QueueFlags::empty(),
            )?,
            compute: find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS),
            transfer: find(
                vk::QueueFlags::TRANSFER,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ),
        })
    }

    fn families(&self) -> impl Iterator<Item = (QueueType, u32)> {
        [
            (QueueType::Main, Some(self.main)),
            (QueueType::Compute, self.compute),
            (QueueType::Transfer, self.transfer),
        ]
        .into_iter()
        .filter_map(|(ty, family)| family.map(|family| (ty, family)))
    }
}

fn stage_flags(stage: PipelineStage) -> vk::PipelineStageFlags {
    const MAPPING: [(PipelineStage, vk::PipelineStageFlags); 12] = [
        (PipelineStage::TOP_OF_PIPE, vk::PipelineStageFlags::TOP_OF_PIPE),
        (PipelineStage::DRAW_INDIRECT, vk::PipelineStageFlags::DRAW_INDIRECT),
        (PipelineStage::VERTEX_INPUT, vk::PipelineStageFlags::VERTEX_INPUT),
        (PipelineStage::VERTEX_SHADER, vk::PipelineStageFlags::VERTEX_SHADER),
        (PipelineStage::FRAGMENT_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        (
            PipelineStage::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        (
            PipelineStage::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        (
            PipelineStage::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (PipelineStage::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER),
        (PipelineStage::TRANSFER, vk::PipelineStageFlags::TRANSFER),
        (PipelineStage::BOTTOM_OF_PIPE, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        (PipelineStage::ALL_COMMANDS, vk::PipelineStageFlags::ALL_COMMANDS),
    ];

    let mut flags = vk::PipelineStageFlags::empty();
    for (ours, theirs) in MAPPING {
        if stage.contains(ours) {
            flags |= theirs;
        }
    }
    if flags.is_empty() {
        vk::PipelineStageFlags::ALL_COMMANDS
    } else {
        flags
    }
}

/// Timestamp writes take exactly one stage. The latest requested stage wins.
fn timestamp_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    let flags = stage_flags(stage);
    if flags.contains(vk::PipelineStageFlags::ALL_COMMANDS) {
        return vk::PipelineStageFlags::ALL_COMMANDS;
    }
    // Stage bits are ordered through the pipeline, so the highest set bit is latest.
    let raw = flags.as_raw();
    vk::PipelineStageFlags::from_raw(1 << (31 - raw.leading_zeros()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_mapping_combines_bits() {
        let flags = stage_flags(PipelineStage::VERTEX_SHADER | PipelineStage::TRANSFER);
        assert_eq!(
            flags,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            stage_flags(PipelineStage::empty()),
            vk::PipelineStageFlags::ALL_COMMANDS
        );
    }

    #[test]
    fn timestamps_use_the_latest_stage() {
        assert_eq!(
            timestamp_stage(PipelineStage::TOP_OF_PIPE | PipelineStage::FRAGMENT_SHADER),
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert_eq!(
            timestamp_stage(PipelineStage::BOTTOM_OF_PIPE),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        );
    }

    #[test]
    fn queue_layout_prefers_dedicated_families() {
        let family = |flags| vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        };
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let layout = QueueLayout::find(&families).unwrap();
        assert_eq!(
            layout.families().collect::<Vec<_>>(),
            vec![
                (QueueType::Main, 0),
                (QueueType::Compute, 1),
                (QueueType::Transfer, 2)
            ]
        );

        let layout = QueueLayout::find(&families[..1]).unwrap();
        assert_eq!(layout.families().count(), 1);
    }
}
