use tessera_graphics::{self as gpu, CommandDevice as _, MemoryManager as _};

/// Temporary resources that have to outlive the submission using them.
#[derive(Default)]
pub struct FrameResources {
    pub buffers: Vec<gpu::Buffer>,
}

#[derive(Default)]
struct ImageSlot {
    resources: FrameResources,
    sync_point: Option<gpu::SyncPoint>,
}

/// Utility object that cycles through the frame images, and
/// cleans up the temporary resources of an image once the
/// device is done with its previous use.
pub struct FramePacer {
    frame_index: usize,
    images: Vec<ImageSlot>,
    command_encoder: gpu::CommandEncoder,
}

impl FramePacer {
    pub fn new(device: &dyn gpu::Device, image_count: usize) -> Self {
        assert_ne!(image_count, 0);
        let command_encoder = device.create_command_encoder(gpu::CommandEncoderDesc { name: "main" });
        Self {
            frame_index: 0,
            images: (0..image_count).map(|_| ImageSlot::default()).collect(),
            command_encoder,
        }
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Image that the next (or current) frame renders into.
    pub fn image_index(&self) -> usize {
        self.frame_index % self.images.len()
    }

    #[profiling::function]
    fn retire(&mut self, device: &dyn gpu::Device, image_index: usize) {
        let slot = &mut self.images[image_index];
        if let Some(sp) = slot.sync_point.take() {
            if !device.wait_for(&sp, !0) {
                log::warn!("Timed out waiting for image {}", image_index);
            }
        }
        for buffer in slot.resources.buffers.drain(..) {
            device.release_buffer(buffer);
        }
    }

    pub fn last_sync_point(&self) -> Option<&gpu::SyncPoint> {
        let previous = (self.frame_index + self.images.len() - 1) % self.images.len();
        self.images[previous].sync_point.as_ref()
    }

    /// Wait for the previous use of the current image and start recording.
    pub fn begin_frame(
        &mut self,
        device: &dyn gpu::Device,
    ) -> (usize, &mut gpu::CommandEncoder, &mut FrameResources) {
        let image_index = self.image_index();
        self.retire(device, image_index);
        self.command_encoder.start();
        (
            image_index,
            &mut self.command_encoder,
            &mut self.images[image_index].resources,
        )
    }

    /// Resources of the current image, for work submitted outside of the
    /// frame encoder.
    pub fn resources(&mut self) -> &mut FrameResources {
        let image_index = self.image_index();
        &mut self.images[image_index].resources
    }

    pub fn end_frame(&mut self, device: &dyn gpu::Device) -> Result<gpu::SyncPoint, gpu::DeviceError> {
        let image_index = self.image_index();
        self.command_encoder.finish();
        let sync_point = device.submit(&mut self.command_encoder)?;
        self.images[image_index].sync_point = Some(sync_point.clone());
        self.frame_index += 1;
        Ok(sync_point)
    }

    pub fn destroy(&mut self, device: &dyn gpu::Device) {
        for image_index in 0..self.images.len() {
            self.retire(device, image_index);
        }
        let _ = self.command_encoder.take_commands();
    }
}

#[cfg(test)]
mod tests {
    use tessera_graphics::{self as gpu, MemoryManager as _};

    #[test]
    fn buffers_live_until_the_image_comes_back() {
        let context = gpu::capture::Context::new();
        let mut pacer = super::FramePacer::new(&context, 2);
        let staging = context
            .get_buffer(gpu::BufferDesc {
                name: "staging",
                size: 16,
                usage: gpu::BufferUsage::TRANSFER_SRC,
                memory: gpu::Memory::Upload,
            })
            .unwrap();

        let (image_index, _, resources) = pacer.begin_frame(&context);
        assert_eq!(image_index, 0);
        resources.buffers.push(staging);
        pacer.end_frame(&context).unwrap();

        let (image_index, _, _) = pacer.begin_frame(&context);
        assert_eq!(image_index, 1);
        pacer.end_frame(&context).unwrap();
        assert_eq!(context.buffer_count(), 1);

        let (image_index, _, _) = pacer.begin_frame(&context);
        assert_eq!(image_index, 0);
        assert_eq!(context.buffer_count(), 0);
        pacer.end_frame(&context).unwrap();
        assert_eq!(pacer.frame_index(), 3);
        assert_eq!(context.submission_count(), 3);
    }
}
