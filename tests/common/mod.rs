//! Shared helpers for lifecycle integration tests.

use std::sync::Arc;

use rhi_resources::{
    DeviceConfig, DummyBackend, HeapType, ManualFence, ResourceDevice, ResourceFlags,
    ResourceLocation, ResourceState,
};

/// A device over the dummy backend with a CPU-driven fence, so tests can
/// play the role of the GPU timeline.
pub struct TestContext {
    pub device: Arc<ResourceDevice>,
    pub backend: Arc<DummyBackend>,
    pub fence: Arc<ManualFence>,
}

impl TestContext {
    pub fn new(async_deletion: bool) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(DummyBackend::new());
        let fence = Arc::new(ManualFence::new());
        let device = ResourceDevice::new(
            backend.clone(),
            fence.clone(),
            0,
            DeviceConfig { async_deletion },
        );
        Self {
            device,
            backend,
            fence,
        }
    }

    /// Create a buffer and wrap it in a stand-alone location.
    pub fn standalone_buffer(&self, size: u64, name: &str) -> ResourceLocation {
        let resource = self
            .device
            .create_buffer(
                size,
                ResourceFlags::empty(),
                HeapType::Default,
                ResourceState::COMMON,
                name,
            )
            .expect("buffer creation");
        let mut location = ResourceLocation::new(self.device.clone());
        location.set_resource(resource);
        location
    }

    /// Pretend a frame's worth of GPU work was submitted.
    pub fn submit_frame(&self) -> u64 {
        self.fence.advance_target()
    }

    /// Pretend the GPU caught up with everything submitted so far.
    pub fn complete_all_gpu_work(&self) {
        self.fence.signal_to_target();
    }

    /// Run deletion ticks until the queue is empty, joining any background
    /// batch along the way. Only valid once the gating fence has signaled.
    pub fn drain_deletion_queue(&self) {
        self.device.release_resources(false);
        // An async tick hands entries to a worker; the shutdown join below
        // is what guarantees the frees landed.
        self.device.release_resources(true);
    }
}
