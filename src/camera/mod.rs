mod capture;
mod registry;
pub mod snapshot;
mod stream;

pub use capture::{CaptureBackend, CaptureError, Frame, FrameSource};
pub use registry::{Camera, CameraRegistry, Location, Priority};
pub use stream::{redact, OpenCvCapture};
