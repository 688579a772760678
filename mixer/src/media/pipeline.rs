//! GStreamer plumbing shared by file and capture producers

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_allocators::DmaBufMemory;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use std::os::fd::BorrowedFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::{DecodedFrame, HostBytes, PixelFormat, PlaneDescriptor, PlaneMemory};
use crate::error::SourceError;

/// Raw formats the importer understands
const SINK_FORMATS: &str = "{ NV12, RGBA, BGRA, RGBx, BGRx, UYVY }";

/// Appsink caps for decoded video. DMA-BUF memory is preferred when
/// allowed; system memory in the same formats is the alternative.
pub fn sink_caps(allow_dmabuf: bool) -> String {
    let system = format!("video/x-raw, format=(string){}", SINK_FORMATS);
    if allow_dmabuf {
        format!(
            "video/x-raw(memory:DMABuf), format=(string){}; {}",
            SINK_FORMATS, system
        )
    } else {
        system
    }
}

/// Initialize GStreamer once per process
pub fn initialize_gstreamer() -> Result<(), SourceError> {
    static INITIALIZED: OnceLock<Result<(), String>> = OnceLock::new();

    INITIALIZED
        .get_or_init(|| match gst::init() {
            Ok(()) => {
                log::info!("GStreamer initialized ({})", gst::version_string());
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        })
        .clone()
        .map_err(|e| SourceError::CodecInit(format!("GStreamer initialization failed: {}", e)))
}

/// Create an element, reporting a missing plugin as a codec problem
pub fn make_element(factory: &str) -> Result<gst::Element, SourceError> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| SourceError::CodecInit(format!("missing element {}: {}", factory, e)))
}

/// Parse a launch line into a pipeline with a `sink` appsink
pub fn build_pipeline(description: &str) -> Result<(gst::Pipeline, gst_app::AppSink), SourceError> {
    log::debug!("GStreamer pipeline: {}", description);

    let pipeline = gst::parse::launch(description)
        .map_err(|e| SourceError::Pipeline(format!("failed to create pipeline: {}", e)))?
        .dynamic_cast::<gst::Pipeline>()
        .map_err(|_| SourceError::Pipeline("not a gst::Pipeline".to_string()))?;

    let sink = pipeline
        .by_name("sink")
        .ok_or_else(|| SourceError::Pipeline("pipeline has no appsink".to_string()))?
        .dynamic_cast::<gst_app::AppSink>()
        .map_err(|_| SourceError::Pipeline("sink is not an AppSink".to_string()))?;

    Ok((pipeline, sink))
}

/// Pull-mode appsink: the decode thread paces itself through the frame
/// queue, so the sink must neither sync to the clock nor drop.
pub fn configure_app_sink(sink: &gst_app::AppSink, caps: &str, max_buffers: u32) -> Result<(), SourceError> {
    let caps = caps
        .parse::<gst::Caps>()
        .map_err(|e| SourceError::Pipeline(format!("invalid caps {}: {}", caps, e)))?;
    sink.set_caps(Some(&caps));
    sink.set_property("emit-signals", false);
    sink.set_property("sync", false);
    sink.set_max_buffers(max_buffers);
    sink.set_drop(false);
    Ok(())
}

/// Map a bus error onto the source error taxonomy
pub fn classify_error(err: &gst::message::Error, location: &str) -> SourceError {
    let error = err.error();
    let detail = format!(
        "{}: {} ({})",
        location,
        error,
        err.debug().map(|d| d.to_string()).unwrap_or_default()
    );

    if error.matches(gst::ResourceError::NotFound) || error.matches(gst::ResourceError::OpenRead) {
        SourceError::NotFound(detail)
    } else if error.matches(gst::StreamError::CodecNotFound)
        || error.matches(gst::StreamError::Decode)
        || error.matches(gst::CoreError::MissingPlugin)
    {
        SourceError::CodecInit(detail)
    } else if error.matches(gst::StreamError::TypeNotFound)
        || error.matches(gst::StreamError::WrongType)
        || error.matches(gst::StreamError::Demux)
        || error.matches(gst::StreamError::Format)
    {
        SourceError::NoPlayableStream(detail)
    } else {
        SourceError::Pipeline(detail)
    }
}

/// Move the pipeline to `state` and block until it settles, turning the
/// first bus error into a `SourceError`
pub fn change_state(
    pipeline: &gst::Pipeline,
    state: gst::State,
    timeout: Duration,
    location: &str,
) -> Result<(), SourceError> {
    let change = pipeline.set_state(state);

    let bus = pipeline
        .bus()
        .ok_or_else(|| SourceError::Pipeline("pipeline has no bus".to_string()))?;
    let deadline = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);

    if let Ok(gst::StateChangeSuccess::Success | gst::StateChangeSuccess::NoPreroll) = change {
        // Synchronous transitions may still have posted an error
        if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error])
            && let gst::MessageView::Error(err) = msg.view()
        {
            return Err(classify_error(err, location));
        }
        return Ok(());
    }

    let msg = bus.timed_pop_filtered(
        deadline,
        &[
            gst::MessageType::Error,
            gst::MessageType::AsyncDone,
            gst::MessageType::Eos,
        ],
    );
    match msg.as_ref().map(|m| m.view()) {
        Some(gst::MessageView::AsyncDone(_)) => Ok(()),
        Some(gst::MessageView::Error(err)) => Err(classify_error(err, location)),
        Some(gst::MessageView::Eos(_)) => Err(SourceError::NoPlayableStream(format!(
            "{}: stream ended before the first frame",
            location
        ))),
        _ if change.is_err() => Err(SourceError::Pipeline(format!(
            "{}: state change to {:?} failed",
            location, state
        ))),
        _ => Err(SourceError::Pipeline(format!(
            "{}: timed out waiting for {:?}",
            location, state
        ))),
    }
}

/// First runtime error waiting on the bus, if any
pub fn pending_error(pipeline: &gst::Pipeline, location: &str) -> Option<SourceError> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(classify_error(err, location)),
        _ => None,
    }
}

/// Stop a pipeline and drain its bus
pub fn shutdown_pipeline(pipeline: &gst::Pipeline, label: &str) {
    match pipeline.set_state(gst::State::Null) {
        Ok(_) => {
            let (result, current, pending) = pipeline.state(Some(gst::ClockTime::from_seconds(2)));
            if let Err(e) = result {
                log::warn!("[{}] failed to reach Null state: {:?}", label, e);
            } else {
                log::debug!(
                    "[{}] pipeline final state: current={:?}, pending={:?}",
                    label,
                    current,
                    pending
                );
            }
        }
        Err(e) => log::warn!("[{}] failed to set pipeline state to Null: {}", label, e),
    }

    if let Some(bus) = pipeline.bus() {
        let mut drained = 0;
        while bus.pop().is_some() {
            drained += 1;
        }
        if drained > 0 {
            log::debug!("[{}] drained {} pending bus messages", label, drained);
        }
    }
}

/// Planes a raw video format splits into: format and size of each
pub fn plane_formats(
    format: gst_video::VideoFormat,
    width: u32,
    height: u32,
) -> Result<Vec<(PixelFormat, u32, u32)>, SourceError> {
    use gst_video::VideoFormat;

    let planes = match format {
        VideoFormat::Nv12 => vec![
            (PixelFormat::R8, width, height),
            (PixelFormat::Rg8, width.div_ceil(2), height.div_ceil(2)),
        ],
        VideoFormat::Rgba | VideoFormat::Rgbx => vec![(PixelFormat::Rgba8, width, height)],
        VideoFormat::Bgra | VideoFormat::Bgrx => vec![(PixelFormat::Bgra8, width, height)],
        VideoFormat::Uyvy => vec![(PixelFormat::Uyvy, width, height)],
        other => {
            return Err(SourceError::Decode(format!(
                "unsupported raw format {:?}",
                other
            )));
        }
    };
    Ok(planes)
}

/// Stream running time of a sample in seconds, falling back to its pts
fn running_time(sample: &gst::Sample, buffer: &gst::BufferRef) -> f64 {
    let Some(pts) = buffer.pts() else {
        return 0.0;
    };
    let running = sample
        .segment()
        .and_then(|segment| segment.downcast_ref::<gst::ClockTime>())
        .and_then(|segment| segment.to_running_time(pts));
    running.unwrap_or(pts).nseconds() as f64 / 1_000_000_000.0
}

/// Find the memory block holding byte `offset` of the buffer and the
/// offset inside that block's backing storage
fn locate_memory(buffer: &gst::BufferRef, offset: usize) -> Option<(&gst::MemoryRef, usize)> {
    let mut start = 0;
    for memory in buffer.iter_memories() {
        let size = memory.size();
        if offset < start + size {
            return Some((memory, memory.offset() + offset - start));
        }
        start += size;
    }
    None
}

fn is_dmabuf(buffer: &gst::BufferRef) -> bool {
    buffer.n_memory() > 0
        && buffer
            .iter_memories()
            .all(|m| m.downcast_memory_ref::<DmaBufMemory>().is_some())
}

/// Describe a sample's planes without copying pixels.
///
/// DMA-BUF planes carry a duplicated descriptor; host planes borrow a
/// read mapping of the buffer. Either way the sample's buffer rides along
/// as keepalive until the frame and any image made from it are dropped.
pub fn frame_from_sample(sample: &gst::Sample, allow_dmabuf: bool) -> Result<DecodedFrame, SourceError> {
    let caps = sample
        .caps()
        .ok_or_else(|| SourceError::Decode("sample has no caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| SourceError::Decode(format!("unreadable caps: {}", e)))?;
    let buffer = sample
        .buffer_owned()
        .ok_or_else(|| SourceError::Decode("sample has no buffer".to_string()))?;

    let formats = plane_formats(info.format(), info.width(), info.height())?;
    let (offsets, strides): (Vec<usize>, Vec<i32>) = match buffer.meta::<gst_video::VideoMeta>() {
        Some(meta) => (meta.offset().to_vec(), meta.stride().to_vec()),
        None => (info.offset().to_vec(), info.stride().to_vec()),
    };
    if offsets.len() < formats.len() || strides.len() < formats.len() {
        return Err(SourceError::Decode(format!(
            "{} planes described, {} expected",
            offsets.len().min(strides.len()),
            formats.len()
        )));
    }

    let timestamp = running_time(sample, &buffer);
    let dmabuf = is_dmabuf(&buffer);
    if dmabuf && !allow_dmabuf {
        return Err(SourceError::Decode(
            "decoder produced DMA-BUF memory but DMA-BUF import is disabled".to_string(),
        ));
    }

    let host = if dmabuf {
        None
    } else {
        let mapped = buffer
            .clone()
            .into_mapped_buffer_readable()
            .map_err(|_| SourceError::Decode("failed to map buffer".to_string()))?;
        Some(HostBytes::new(mapped))
    };

    let mut planes = Vec::with_capacity(formats.len());
    for (i, &(format, width, height)) in formats.iter().enumerate() {
        let pitch = u32::try_from(strides[i])
            .map_err(|_| SourceError::Decode(format!("negative stride on plane {}", i)))?;

        let (memory, offset) = match &host {
            Some(data) => (PlaneMemory::Host(data.clone()), offsets[i]),
            None => {
                let (memory, offset) = locate_memory(&buffer, offsets[i]).ok_or_else(|| {
                    SourceError::Decode(format!("plane {} lies outside the buffer", i))
                })?;
                let fd = memory
                    .downcast_memory_ref::<DmaBufMemory>()
                    .map(|m| m.fd())
                    .ok_or_else(|| SourceError::Decode("plane is not a DMA-BUF".to_string()))?;
                // SAFETY: the descriptor belongs to `buffer`, which is alive
                // for the duration of this borrow
                let owned = unsafe { BorrowedFd::borrow_raw(fd) }
                    .try_clone_to_owned()
                    .map_err(|e| SourceError::Decode(format!("failed to dup DMA-BUF fd: {}", e)))?;
                (PlaneMemory::DmaBuf(Arc::new(owned)), offset)
            }
        };

        planes.push(PlaneDescriptor {
            memory,
            offset,
            pitch,
            width,
            height,
            format,
        });
    }

    Ok(DecodedFrame::new(planes, timestamp).with_keepalive(Arc::new(buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_formats() {
        let nv12 = plane_formats(gst_video::VideoFormat::Nv12, 1921, 1081).unwrap();
        assert_eq!(nv12[0], (PixelFormat::R8, 1921, 1081));
        assert_eq!(nv12[1], (PixelFormat::Rg8, 961, 541));

        let bgrx = plane_formats(gst_video::VideoFormat::Bgrx, 64, 32).unwrap();
        assert_eq!(bgrx, vec![(PixelFormat::Bgra8, 64, 32)]);

        assert!(matches!(
            plane_formats(gst_video::VideoFormat::I420, 64, 32),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn test_host_sample_to_frame() {
        initialize_gstreamer().unwrap();

        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, 4, 2)
            .build()
            .unwrap();
        let caps = info.to_caps().unwrap();
        let mut buffer = gst::Buffer::with_size(info.size()).unwrap();
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gst::ClockTime::from_mseconds(40));
        let sample = gst::Sample::builder().buffer(&buffer).caps(&caps).build();

        let frame = frame_from_sample(&sample, true).unwrap();
        assert_eq!(frame.planes.len(), 1);
        assert_eq!(frame.planes[0].format, PixelFormat::Rgba8);
        assert_eq!(frame.planes[0].pitch, 16);
        assert!(!frame.planes[0].is_dmabuf());
        assert!((frame.timestamp - 0.04).abs() < 1e-9);
        assert!(frame.keepalive.is_some());

        // The plane reads the decoder's memory in place
        let PlaneMemory::Host(bytes) = &frame.planes[0].memory else {
            panic!("expected host memory");
        };
        let map = buffer.map_readable().unwrap();
        assert_eq!(bytes.as_ptr(), map.as_slice().as_ptr());
        assert_eq!(bytes.len(), info.size());
    }

    #[test]
    fn test_sink_caps_prefer_dmabuf() {
        initialize_gstreamer().unwrap();

        let caps: gst::Caps = sink_caps(true).parse().unwrap();
        assert_eq!(caps.size(), 2);
        assert!(caps.features(0).unwrap().contains("memory:DMABuf"));
        assert!(!caps.features(1).unwrap().contains("memory:DMABuf"));

        let caps: gst::Caps = sink_caps(false).parse().unwrap();
        assert_eq!(caps.size(), 1);
        assert!(!caps.features(0).unwrap().contains("memory:DMABuf"));

        // Decoders that only emit I420 go through the converter
        let i420: gst::Caps = "video/x-raw, format=(string)I420".parse().unwrap();
        assert!(!i420.can_intersect(&caps));
    }
}
