//! Media file playback through GStreamer

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::pipeline;
use super::{FrameProducer, Produced};
use crate::error::SourceError;

const PREROLL_TIMEOUT: Duration = Duration::from_secs(5);
const PULL_TIMEOUT: gst::ClockTime = gst::ClockTime::from_mseconds(100);

/// Where a stream exposed by `decodebin` is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamRoute {
    Video,
    Audio,
    Ignore,
}

fn route_stream(media_type: &str, audio: bool) -> StreamRoute {
    if media_type.starts_with("video/") {
        StreamRoute::Video
    } else if audio && media_type.starts_with("audio/") {
        StreamRoute::Audio
    } else {
        StreamRoute::Ignore
    }
}

/// Build `queue ! audioconvert ! audioresample ! autoaudiosink` behind a
/// freshly exposed audio pad
fn attach_audio(bin: &gst::Pipeline, pad: &gst::Pad) -> Result<(), SourceError> {
    let chain = ["queue", "audioconvert", "audioresample", "autoaudiosink"]
        .into_iter()
        .map(pipeline::make_element)
        .collect::<Result<Vec<_>, _>>()?;

    bin.add_many(&chain)
        .map_err(|e| SourceError::Pipeline(format!("failed to add audio branch: {}", e)))?;
    gst::Element::link_many(&chain)
        .map_err(|e| SourceError::Pipeline(format!("failed to link audio branch: {}", e)))?;
    for element in &chain {
        element
            .sync_state_with_parent()
            .map_err(|e| SourceError::Pipeline(format!("audio branch state: {}", e)))?;
    }

    let sink_pad = chain[0]
        .static_pad("sink")
        .ok_or_else(|| SourceError::Pipeline("audio queue has no sink pad".to_string()))?;
    pad.link(&sink_pad)
        .map_err(|e| SourceError::Pipeline(format!("failed to link audio pad: {:?}", e)))?;
    Ok(())
}

/// Decodes a media file with `decodebin`, hardware decoders included.
///
/// Decoded video passes `videoconvert` on its way to the appsink. Frames
/// already in an importable format, DMA-BUF ones included, pass through
/// untouched; anything else (I420 from software decoders) is converted.
pub struct VideoProducer {
    pipeline: gst::Pipeline,
    sink: gst_app::AppSink,
    location: String,
    backwards: bool,
    allow_dmabuf: bool,
    duration: Option<gst::ClockTime>,
}

impl VideoProducer {
    /// Assemble the pipeline without prerolling it. Fails if the file is
    /// missing or GStreamer lacks a core element.
    pub fn open(
        path: &Path,
        backwards: bool,
        audio: bool,
        allow_dmabuf: bool,
    ) -> Result<Self, SourceError> {
        let location = path.display().to_string();
        if !path.is_file() {
            return Err(SourceError::NotFound(location));
        }
        pipeline::initialize_gstreamer()?;

        let bin = gst::Pipeline::new();
        let src = pipeline::make_element("filesrc")?;
        src.set_property("location", path.to_string_lossy().as_ref());
        let decodebin = pipeline::make_element("decodebin")?;
        let queue = pipeline::make_element("queue")?;
        let convert = pipeline::make_element("videoconvert")?;
        let sink = gst_app::AppSink::builder().build();
        pipeline::configure_app_sink(&sink, &pipeline::sink_caps(allow_dmabuf), 2)?;

        bin.add_many([&src, &decodebin, &queue, &convert, sink.upcast_ref()])
            .map_err(|e| SourceError::Pipeline(format!("failed to add elements: {}", e)))?;
        src.link(&decodebin)
            .map_err(|e| SourceError::Pipeline(format!("failed to link source: {}", e)))?;
        gst::Element::link_many([&queue, &convert, sink.upcast_ref()])
            .map_err(|e| SourceError::Pipeline(format!("failed to link video branch: {}", e)))?;

        let bin_weak = bin.downgrade();
        let queue_weak = queue.downgrade();
        let audio_linked = Arc::new(AtomicBool::new(false));
        let label = location.clone();
        decodebin.connect_pad_added(move |_, pad| {
            let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
            let Some(structure) = caps.structure(0) else {
                return;
            };
            let media_type = structure.name().as_str();

            match route_stream(media_type, audio) {
                StreamRoute::Video => {
                    let Some(sink_pad) = queue_weak.upgrade().and_then(|q| q.static_pad("sink"))
                    else {
                        return;
                    };
                    if sink_pad.is_linked() {
                        log::debug!("[{}] ignoring extra video stream", label);
                    } else if let Err(e) = pad.link(&sink_pad) {
                        log::warn!("[{}] failed to link video pad: {:?}", label, e);
                    }
                }
                StreamRoute::Audio => {
                    if audio_linked.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    let Some(bin) = bin_weak.upgrade() else {
                        return;
                    };
                    match attach_audio(&bin, pad) {
                        Ok(()) => log::debug!("[{}] playing audio ({})", label, media_type),
                        Err(e) => log::warn!("[{}] audio disabled: {}", label, e),
                    }
                }
                StreamRoute::Ignore => log::debug!("[{}] ignoring {} stream", label, media_type),
            }
        });

        Ok(Self {
            pipeline: bin,
            sink,
            location,
            backwards,
            allow_dmabuf,
            duration: None,
        })
    }

    /// Seek to the beginning of playback in the configured direction
    fn seek_to_start(&self) -> Result<(), SourceError> {
        let result = match (self.backwards, self.duration) {
            (true, Some(duration)) => self.pipeline.seek(
                -1.0,
                gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE,
                gst::SeekType::Set,
                gst::ClockTime::ZERO,
                gst::SeekType::Set,
                duration,
            ),
            _ => self.pipeline.seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::ZERO,
            ),
        };
        result.map_err(|e| SourceError::Pipeline(format!("{}: seek failed: {}", self.location, e)))
    }
}

impl FrameProducer for VideoProducer {
    /// Preroll, which finds the video stream and a decoder for it, then
    /// start playing
    fn start(&mut self) -> Result<(), SourceError> {
        pipeline::change_state(&self.pipeline, gst::State::Paused, PREROLL_TIMEOUT, &self.location)?;

        self.duration = self.pipeline.query_duration::<gst::ClockTime>();
        if self.backwards && self.duration.is_none() {
            return Err(SourceError::NoPlayableStream(format!(
                "{}: reverse playback needs a known duration",
                self.location
            )));
        }
        log::info!(
            "Prerolled {} (duration {:?}, {})",
            self.location,
            self.duration.map(|d| d.nseconds() as f64 / 1_000_000_000.0),
            if self.backwards { "reverse" } else { "forward" }
        );

        if self.backwards {
            self.seek_to_start()?;
        }
        pipeline::change_state(
            &self.pipeline,
            gst::State::Playing,
            PREROLL_TIMEOUT,
            &self.location,
        )
    }

    fn next_frame(&mut self) -> Result<Produced, SourceError> {
        if let Some(e) = pipeline::pending_error(&self.pipeline, &self.location) {
            return Err(e);
        }

        match self.sink.try_pull_sample(PULL_TIMEOUT) {
            Some(sample) => {
                pipeline::frame_from_sample(&sample, self.allow_dmabuf).map(Produced::Frame)
            }
            None if self.sink.is_eos() => Ok(Produced::EndOfStream),
            None => Ok(Produced::Pending),
        }
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        log::debug!("{}: looping", self.location);
        self.seek_to_start()
    }

    fn flush(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Ready) {
            log::warn!("{}: failed to stop pipeline: {}", self.location, e);
        }
    }
}

impl Drop for VideoProducer {
    fn drop(&mut self) {
        pipeline::shutdown_pipeline(&self.pipeline, &self.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Write a short raw I420 clip without an audio track, or `None` when
    /// the muxer plugins are not installed
    fn silent_i420_clip(dir: &Path) -> Option<std::path::PathBuf> {
        initialize_plugins()?;
        let path = dir.join("silent.mkv");
        let description = format!(
            "videotestsrc num-buffers=4 ! video/x-raw,format=I420,width=64,height=48,framerate=25/1 \
             ! matroskamux ! filesink location={}",
            path.display()
        );
        let writer = gst::parse::launch(&description).ok()?;
        writer.set_state(gst::State::Playing).ok()?;
        let bus = writer.bus()?;
        let done = bus.timed_pop_filtered(
            gst::ClockTime::from_seconds(5),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );
        let _ = writer.set_state(gst::State::Null);
        matches!(done.as_ref().map(|m| m.view()), Some(gst::MessageView::Eos(_))).then_some(path)
    }

    fn initialize_plugins() -> Option<()> {
        pipeline::initialize_gstreamer().ok()?;
        ["videotestsrc", "matroskamux", "matroskademux", "videoconvert", "decodebin"]
            .iter()
            .all(|f| gst::ElementFactory::find(f).is_some())
            .then_some(())
    }

    #[test]
    fn test_stream_routing() {
        assert_eq!(route_stream("video/x-raw", false), StreamRoute::Video);
        assert_eq!(route_stream("audio/x-raw", true), StreamRoute::Audio);
        assert_eq!(route_stream("audio/x-raw", false), StreamRoute::Ignore);
        assert_eq!(route_stream("text/x-raw", true), StreamRoute::Ignore);
    }

    #[test]
    fn test_missing_file() {
        let result = VideoProducer::open(Path::new("/nonexistent/clip.mp4"), false, false, true);
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }

    #[test]
    fn test_open_does_not_preroll() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"definitely not a video container").unwrap();

        // Assembling is cheap and succeeds; the bad container shows up
        // when the decode thread starts the producer
        let mut producer = VideoProducer::open(file.path(), false, true, true).unwrap();
        let (_, state, _) = producer.pipeline.state(gst::ClockTime::ZERO);
        assert_eq!(state, gst::State::Null);

        let result = producer.start();
        assert!(result.is_err());
        assert!(!matches!(result, Err(SourceError::NotFound(_))));
    }

    #[test]
    fn test_i420_clip_without_audio_plays() {
        let dir = tempfile::tempdir().unwrap();
        let Some(clip) = silent_i420_clip(dir.path()) else {
            return;
        };

        let begun = Instant::now();
        let mut producer = VideoProducer::open(&clip, false, true, true).unwrap();
        producer.start().unwrap();
        assert!(begun.elapsed() < PREROLL_TIMEOUT, "preroll waited for audio");

        let frame = loop {
            match producer.next_frame().unwrap() {
                Produced::Frame(frame) => break frame,
                Produced::Pending => assert!(begun.elapsed() < Duration::from_secs(10)),
                Produced::EndOfStream => panic!("ended before the first frame"),
            }
        };
        assert_eq!(frame.dimensions(), Some((64, 48)));
        assert!(!frame.planes[0].is_dmabuf());
    }
}
