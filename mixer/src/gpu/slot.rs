//! Lifetime tracking for the GPU images of one source
//!
//! An image may still be sampled by work the GPU has not finished. The
//! slot keeps superseded images alive until the fence armed after their
//! last draw has signalled. Fences signal in submission order, so a newer
//! fence also covers everything retired under an older one.

use super::GpuBackend;
use std::time::Duration;

pub struct ImageSlot<B: GpuBackend> {
    current: Option<B::Image>,
    /// Superseded images waiting for `fence`
    retired: Vec<B::Image>,
    fence: Option<B::Fence>,
}

impl<B: GpuBackend> ImageSlot<B> {
    pub fn new() -> Self {
        Self {
            current: None,
            retired: Vec::new(),
            fence: None,
        }
    }

    /// Start a render cycle: wait (bounded) for the outstanding fence and,
    /// once it has signalled, free it and every image retired under it.
    ///
    /// Returns `false` if the fence is still pending after `timeout`; the
    /// retired images then stay alive until a later cycle.
    pub fn begin_cycle(&mut self, backend: &mut B, timeout: Duration) -> bool {
        let Some(fence) = self.fence.take() else {
            self.destroy_retired(backend);
            return true;
        };

        if !backend.wait_fence(&fence, timeout) {
            log::warn!(
                "GPU fence still pending after {:?}, deferring {} image(s)",
                timeout,
                self.retired.len()
            );
            self.fence = Some(fence);
            return false;
        }

        backend.destroy_fence(fence);
        self.destroy_retired(backend);
        true
    }

    /// Make `image` current, superseding the previous one
    pub fn present(&mut self, backend: &mut B, image: B::Image) {
        if let Some(previous) = self.current.replace(image) {
            if self.fence.is_some() {
                self.retired.push(previous);
            } else {
                backend.destroy_image(previous);
            }
        }
    }

    /// Record the fence submitted after the current image was drawn
    pub fn arm_fence(&mut self, backend: &mut B, fence: B::Fence) {
        if let Some(old) = self.fence.replace(fence) {
            backend.destroy_fence(old);
        }
    }

    pub fn current(&self) -> Option<&B::Image> {
        self.current.as_ref()
    }

    /// Give up the current image (source closing)
    pub fn release(&mut self, backend: &mut B) {
        if let Some(image) = self.current.take() {
            self.retired.push(image);
        }
        if self.fence.is_none() {
            self.destroy_retired(backend);
        }
    }

    /// Free everything, waiting at most `timeout` for the GPU.
    ///
    /// Used at shutdown, where nothing will be drawn again.
    pub fn shutdown(&mut self, backend: &mut B, timeout: Duration) {
        self.release(backend);
        if let Some(fence) = self.fence.take() {
            if !backend.wait_fence(&fence, timeout) {
                log::warn!("GPU fence still pending at shutdown, freeing images anyway");
            }
            backend.destroy_fence(fence);
        }
        self.destroy_retired(backend);
    }

    /// Whether any image or fence is still held
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.retired.is_empty() && self.fence.is_none()
    }

    pub fn has_pending_fence(&self) -> bool {
        self.fence.is_some()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn destroy_retired(&mut self, backend: &mut B) {
        for image in self.retired.drain(..) {
            backend.destroy_image(image);
        }
    }
}

impl<B: GpuBackend> Default for ImageSlot<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use crate::media::DecodedFrame;
    use std::collections::HashSet;

    /// Backend whose fences signal only when told to
    #[derive(Default)]
    struct ManualBackend {
        next_id: u32,
        live_images: HashSet<u32>,
        signalled: HashSet<u32>,
        destroyed_images: Vec<u32>,
        destroyed_fences: Vec<u32>,
    }

    impl ManualBackend {
        fn image(&mut self) -> u32 {
            self.next_id += 1;
            self.live_images.insert(self.next_id);
            self.next_id
        }
    }

    impl GpuBackend for ManualBackend {
        type Image = u32;
        type Fence = u32;

        fn import(&mut self, _frame: &DecodedFrame) -> Result<u32, ImportError> {
            Ok(self.image())
        }

        fn destroy_image(&mut self, image: u32) {
            assert!(self.live_images.remove(&image), "image {} freed twice", image);
            self.destroyed_images.push(image);
        }

        fn create_fence(&mut self) -> u32 {
            self.next_id += 1;
            self.next_id
        }

        fn wait_fence(&mut self, fence: &u32, _timeout: Duration) -> bool {
            self.signalled.contains(fence)
        }

        fn destroy_fence(&mut self, fence: u32) {
            self.destroyed_fences.push(fence);
        }
    }

    #[test]
    fn test_present_without_fence_destroys_previous() {
        let mut backend = ManualBackend::default();
        let mut slot = ImageSlot::new();

        let a = backend.image();
        let b = backend.image();
        slot.present(&mut backend, a);
        slot.present(&mut backend, b);

        assert_eq!(backend.destroyed_images, vec![a]);
        assert_eq!(slot.current(), Some(&b));
    }

    #[test]
    fn test_image_outlives_its_fence() {
        let mut backend = ManualBackend::default();
        let mut slot = ImageSlot::new();

        let a = backend.image();
        slot.present(&mut backend, a);
        let fence = backend.create_fence();
        slot.arm_fence(&mut backend, fence);

        // Superseded while the draw that used it is in flight
        let b = backend.image();
        slot.present(&mut backend, b);
        assert!(backend.destroyed_images.is_empty());
        assert_eq!(slot.retired_count(), 1);

        // Fence not yet signalled: still alive
        assert!(!slot.begin_cycle(&mut backend, Duration::from_millis(1)));
        assert!(backend.destroyed_images.is_empty());

        backend.signalled.insert(fence);
        assert!(slot.begin_cycle(&mut backend, Duration::from_millis(1)));
        assert_eq!(backend.destroyed_images, vec![a]);
        assert_eq!(backend.destroyed_fences, vec![fence]);
        assert!(!slot.has_pending_fence());
    }

    #[test]
    fn test_newer_fence_replaces_older() {
        let mut backend = ManualBackend::default();
        let mut slot = ImageSlot::new();

        let a = backend.image();
        slot.present(&mut backend, a);
        let f1 = backend.create_fence();
        slot.arm_fence(&mut backend, f1);
        let f2 = backend.create_fence();
        slot.arm_fence(&mut backend, f2);

        assert_eq!(backend.destroyed_fences, vec![f1]);
        let b = backend.image();
        slot.present(&mut backend, b);

        backend.signalled.insert(f2);
        slot.begin_cycle(&mut backend, Duration::ZERO);
        assert_eq!(backend.destroyed_images, vec![a]);
    }

    #[test]
    fn test_release_respects_fence() {
        let mut backend = ManualBackend::default();
        let mut slot = ImageSlot::new();

        let a = backend.image();
        slot.present(&mut backend, a);
        let fence = backend.create_fence();
        slot.arm_fence(&mut backend, fence);

        slot.release(&mut backend);
        assert!(slot.current().is_none());
        assert!(backend.destroyed_images.is_empty());
        assert!(!slot.is_empty());

        backend.signalled.insert(fence);
        slot.begin_cycle(&mut backend, Duration::ZERO);
        assert_eq!(backend.destroyed_images, vec![a]);
        assert!(slot.is_empty());

        // Releasing again is a no-op
        slot.release(&mut backend);
        assert_eq!(backend.destroyed_images.len(), 1);
    }

    #[test]
    fn test_shutdown_frees_everything() {
        let mut backend = ManualBackend::default();
        let mut slot = ImageSlot::new();

        let a = backend.image();
        slot.present(&mut backend, a);
        let fence = backend.create_fence();
        slot.arm_fence(&mut backend, fence);

        slot.shutdown(&mut backend, Duration::from_millis(1));
        assert!(slot.is_empty());
        assert!(backend.live_images.is_empty());
    }
}
