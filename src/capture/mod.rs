pub mod decoder;
pub mod exchange;
pub mod frame;
pub mod source;
pub mod v4l2;
pub mod worker;

pub use exchange::{exchange, FramePublisher, FrameReader, FrameView, StereoReader, StereoView};
pub use frame::{Eye, FrameFormat, PixelFormat, StereoIds};
pub use source::{FrameSource, TestPattern};
pub use v4l2::V4l2Source;
pub use worker::{CaptureReport, CaptureWorker};
