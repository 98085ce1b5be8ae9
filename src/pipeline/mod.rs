pub mod processing;
pub mod slot;

pub use processing::{FrameProcessingLoop, FramePublisher, FrameSink};
pub use slot::FrameSlot;
