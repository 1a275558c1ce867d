use opencv::core::{Mat, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use super::capture::{CaptureBackend, CaptureError, Frame, FrameSource};

/// Capture backend over `cv::VideoCapture`. Accepts RTSP/HTTP URLs, file
/// paths, or a numeric device index such as `"0"`.
#[derive(Debug, Default)]
pub struct OpenCvCapture;

impl CaptureBackend for OpenCvCapture {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        let capture = match source.trim().parse::<i32>() {
            Ok(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
            Err(_) => VideoCapture::from_file(source, videoio::CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(CaptureError::SourceUnavailable(source.to_string()));
        }

        tracing::debug!(source = %redact(source), "capture opened");

        Ok(Box::new(OpenCvSource {
            capture,
            frame: Mat::default(),
        }))
    }
}

struct OpenCvSource {
    capture: VideoCapture,
    frame: Mat,
}

impl OpenCvSource {
    fn at_end_of_file(&self) -> Result<bool, CaptureError> {
        let total = self.capture.get(videoio::CAP_PROP_FRAME_COUNT)?;
        let position = self.capture.get(videoio::CAP_PROP_POS_FRAMES)?;
        // Live streams report zero or negative frame counts
        Ok(total > 0.0 && position >= total)
    }
}

impl FrameSource for OpenCvSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.capture.is_opened()? {
            return Err(CaptureError::Exhausted);
        }

        if !self.capture.read(&mut self.frame)? || self.frame.empty() {
            if self.at_end_of_file()? {
                return Err(CaptureError::Exhausted);
            }
            return Ok(None);
        }

        to_frame(&self.frame).map(Some)
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!(error = %e, "failed to release capture");
        }
    }
}

fn to_frame(mat: &Mat) -> Result<Frame, CaptureError> {
    let bgr = match mat.channels() {
        3 => mat.try_clone()?,
        1 => convert(mat, imgproc::COLOR_GRAY2BGR)?,
        4 => convert(mat, imgproc::COLOR_BGRA2BGR)?,
        n => return Err(CaptureError::UnsupportedFrame(format!("{n} channels"))),
    };

    if bgr.typ() != CV_8UC3 {
        return Err(CaptureError::UnsupportedFrame(format!(
            "mat type {}",
            bgr.typ()
        )));
    }

    Ok(Frame {
        width: bgr.cols() as u32,
        height: bgr.rows() as u32,
        pixels: bgr.data_bytes()?.to_vec(),
    })
}

fn convert(mat: &Mat, code: i32) -> Result<Mat, CaptureError> {
    let mut out = Mat::default();
    imgproc::cvt_color_def(mat, &mut out, code)?;
    Ok(out)
}

/// Strips credentials from a stream URL before it reaches the logs.
pub fn redact(source: &str) -> String {
    match (source.find("://"), source.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &source[..scheme_end], &source[at + 1..])
        }
        _ => source.to_string(),
    }
}
