//! Synchronization primitives.
//!
//! Free functions wrap the fence and semaphore calls; [`RingFences`] gates
//! reuse of the per-frame ring by waiting on the fence of a slot before the
//! CPU writes into it again.

use crate::error::Result;
use crate::frame::FRAMES_IN_FLIGHT;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns)? };
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Check the fence state without blocking.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn fence_is_signaled(device: &ash::Device, fence: vk::Fence) -> Result<bool> {
    let signaled = unsafe { device.get_fence_status(fence)? };
    Ok(signaled)
}

/// One fence per frame slot, created signaled so the first pass through the
/// ring never blocks.
pub struct RingFences {
    fences: [vk::Fence; FRAMES_IN_FLIGHT],
}

impl RingFences {
    /// Create the per-slot fences.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let mut fences = [vk::Fence::null(); FRAMES_IN_FLIGHT];
        for fence in &mut fences {
            *fence = unsafe { create_fence(device, true)? };
        }
        Ok(Self { fences })
    }

    /// Fence guarding the given slot.
    #[must_use]
    pub fn slot(&self, index: usize) -> vk::Fence {
        self.fences[index % FRAMES_IN_FLIGHT]
    }

    /// Block until the slot's previous submission has retired. Call before
    /// writing new frame data into the slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_slot(&self, device: &ash::Device, index: usize) -> Result<()> {
        unsafe { wait_for_fence(device, self.slot(index), u64::MAX) }
    }

    /// Reset the slot's fence ahead of the next submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset_slot(&self, device: &ash::Device, index: usize) -> Result<()> {
        unsafe { reset_fence(device, self.slot(index)) }
    }

    /// Destroy all fences.
    ///
    /// # Safety
    /// The device must be valid and no fence may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for &fence in &self.fences {
            unsafe { device.destroy_fence(fence, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn slot_index_wraps_around_the_ring() {
        let fences = std::array::from_fn(|i| vk::Fence::from_raw(i as u64 + 1));
        let ring = RingFences { fences };
        assert_eq!(ring.slot(0), ring.slot(FRAMES_IN_FLIGHT));
        assert_eq!(ring.slot(1), ring.slot(FRAMES_IN_FLIGHT + 1));
        assert_ne!(ring.slot(0), ring.slot(1));
    }
}
