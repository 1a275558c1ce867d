use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("cannot open source: {0}")]
    SourceUnavailable(String),
    #[error("unsupported frame layout: {0}")]
    UnsupportedFrame(String),
    #[error("end of stream")]
    Exhausted,
}

/// A decoded BGR24 frame, row-major and tightly packed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.pixels.is_empty()
    }
}

/// An open capture handle. Dropping it releases the underlying source.
pub trait FrameSource: Send {
    /// `Ok(None)` means the source is temporarily unavailable.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;
}

pub trait CaptureBackend: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>, CaptureError>;
}
