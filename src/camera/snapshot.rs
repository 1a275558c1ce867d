use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use thiserror::Error;

use super::capture::Frame;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty frame")]
    EmptyFrame,
    #[error("encoder rejected frame")]
    Rejected,
}

pub fn encode_jpeg(frame: &Frame, quality: i32) -> Result<Vec<u8>, SnapshotError> {
    if frame.is_empty() {
        return Err(SnapshotError::EmptyFrame);
    }

    let flat = Mat::from_slice(&frame.pixels)?;
    let image = flat.reshape(3, frame.height as i32)?;

    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality.clamp(0, 100)]);
    if !imgcodecs::imencode(".jpg", &image, &mut buf, &params)? {
        return Err(SnapshotError::Rejected);
    }
    Ok(buf.to_vec())
}

pub fn snapshot_path(dir: &Path, camera_id: &str, taken_at: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "{}_{}.jpg",
        camera_id,
        taken_at.format("%Y%m%d_%H%M%S")
    ))
}

pub fn save(
    dir: &Path,
    camera_id: &str,
    taken_at: DateTime<Utc>,
    jpeg: &[u8],
) -> Result<PathBuf, SnapshotError> {
    std::fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, camera_id, taken_at);
    std::fs::write(&path, jpeg)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_path_format() {
        let at = Utc.with_ymd_and_hms(2025, 7, 10, 6, 49, 37).unwrap();
        let path = snapshot_path(Path::new("/tmp/shots"), "CCTV-001", at);
        assert_eq!(path, PathBuf::from("/tmp/shots/CCTV-001_20250710_064937.jpg"));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let frame = Frame {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        };
        assert!(matches!(
            encode_jpeg(&frame, 90),
            Err(SnapshotError::EmptyFrame)
        ));
    }
}
