//! Decoder-side interface of a media source

use super::{DecodedFrame, SourceDescriptor};
use crate::error::SourceError;

/// Outcome of one decode step
#[derive(Debug)]
pub enum Produced {
    /// A picture with a timestamp in the producer's own timebase (seconds)
    Frame(DecodedFrame),
    /// Nothing ready yet; call again
    Pending,
    EndOfStream,
}

/// Produces decoded pictures on a source's decode thread.
///
/// Timestamps are rebased by the decode loop, so producers may report any
/// monotonic clock (stream running time, frame counter).
pub trait FrameProducer: Send {
    /// Begin decoding. Called once on the decode thread before the first
    /// `next_frame`, so this is where blocking work goes: prerolling,
    /// waiting for a live signal, checking the negotiated format. An error
    /// ends the play attempt and becomes the source's status.
    fn start(&mut self) -> Result<(), SourceError>;

    /// Decode the next picture. May block briefly waiting for the codec.
    fn next_frame(&mut self) -> Result<Produced, SourceError>;

    /// Seek back to the start for another loop iteration
    fn restart(&mut self) -> Result<(), SourceError>;

    /// Stop producing and discard in-flight codec output
    fn flush(&mut self) {}
}

/// Builds producers for descriptors. Runs on the render thread, so it only
/// does what cannot block: resolve the location and assemble the decoder.
/// A failure here maps onto a failed `open`.
pub trait SourceFactory {
    fn create(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameProducer>, SourceError>;
}
