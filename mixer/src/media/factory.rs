//! Production source factory

use super::{FrameProducer, ProceduralProducer, SourceDescriptor, SourceFactory, SourceKind};
use crate::config::{CaptureConfig, ProceduralConfig};
use crate::error::SourceError;

/// Builds producers for every source kind.
///
/// File and capture sources go through GStreamer and need the `video`
/// feature; procedural sources are always available.
#[derive(Debug, Clone, Default)]
pub struct GstSourceFactory {
    capture: CaptureConfig,
    procedural: ProceduralConfig,
    allow_dmabuf: bool,
}

impl GstSourceFactory {
    pub fn new(capture: CaptureConfig, procedural: ProceduralConfig, allow_dmabuf: bool) -> Self {
        Self {
            capture,
            procedural,
            allow_dmabuf,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.capture.clone(),
            config.procedural.clone(),
            config.advanced.allow_dmabuf,
        )
    }

    #[cfg(feature = "video")]
    fn create_video(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<Box<dyn FrameProducer>, SourceError> {
        let producer = super::VideoProducer::open(
            std::path::Path::new(&descriptor.location),
            descriptor.backwards,
            descriptor.audio,
            self.allow_dmabuf,
        )?;
        Ok(Box::new(producer))
    }

    #[cfg(not(feature = "video"))]
    fn create_video(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<Box<dyn FrameProducer>, SourceError> {
        let _ = self.allow_dmabuf;
        Err(SourceError::CodecInit(format!(
            "video support not compiled in, cannot open {}",
            descriptor.location
        )))
    }

    #[cfg(feature = "video")]
    fn create_capture(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<Box<dyn FrameProducer>, SourceError> {
        let producer =
            super::CaptureProducer::open(&descriptor.location, &self.capture, self.allow_dmabuf)?;
        Ok(Box::new(producer))
    }

    #[cfg(not(feature = "video"))]
    fn create_capture(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<Box<dyn FrameProducer>, SourceError> {
        Err(SourceError::Capture(format!(
            "capture support not compiled in, cannot open {} ({}x{} {})",
            descriptor.location, self.capture.width, self.capture.height, self.capture.format
        )))
    }
}

impl SourceFactory for GstSourceFactory {
    fn create(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameProducer>, SourceError> {
        match descriptor.kind {
            SourceKind::Video => self.create_video(descriptor),
            SourceKind::Capture => self.create_capture(descriptor),
            SourceKind::Procedural => {
                let producer = ProceduralProducer::from_id(
                    &descriptor.location,
                    self.procedural.width,
                    self.procedural.height,
                    self.procedural.fps,
                )?;
                Ok(Box::new(producer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procedural_always_available() {
        let factory = GstSourceFactory::default();
        let desc = SourceDescriptor::new(SourceKind::Procedural, "gradient");
        assert!(factory.create(&desc).is_ok());

        let desc = SourceDescriptor::new(SourceKind::Procedural, "does-not-exist");
        assert!(matches!(
            factory.create(&desc),
            Err(SourceError::NotFound(_))
        ));
    }

    #[cfg(feature = "video")]
    #[test]
    fn test_missing_file_is_not_found() {
        let factory = GstSourceFactory::default();
        let desc = SourceDescriptor::new(SourceKind::Video, "/nonexistent/clip.mp4");
        assert!(matches!(
            factory.create(&desc),
            Err(SourceError::NotFound(_))
        ));
    }
}
