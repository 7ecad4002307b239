use crate::device::Device;
use ash::vk;

type Deleter = Box<dyn FnOnce(&dyn Device)>;

/// GPU objects that may still be referenced by in-flight work, each guarded
/// by the fence of the last submission that could use it.
#[derive(Default)]
pub struct DeletionQueue {
    pending: Vec<(vk::Fence, Deleter)>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fence: vk::Fence, deleter: impl FnOnce(&dyn Device) + 'static) {
        self.pending.push((fence, Box::new(deleter)));
    }

    /// Runs the deleters whose fence has signaled. A fence that cannot be
    /// queried is treated as still pending.
    pub fn flush(&mut self, device: &dyn Device) -> usize {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(fence, _)| {
                *fence == vk::Fence::null() || device.fence_signaled(*fence).unwrap_or(false)
            });
        self.pending = pending;

        let count = ready.len();
        for (_, deleter) in ready {
            deleter(device);
        }
        if count > 0 {
            log::debug!("Deletion queue released {count} objects");
        }
        count
    }

    /// Runs every deleter. Only valid once the device is idle.
    pub fn flush_all(&mut self, device: &dyn Device) {
        for (_, deleter) in self.pending.drain(..) {
            deleter(device);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
