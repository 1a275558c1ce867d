use std::sync::{Mutex, PoisonError};

use ndarray::{Array3, Array4, ArrayView3, Ix3};
use opencv::core::{Mat, Scalar, Size, BORDER_CONSTANT};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use thiserror::Error;

use crate::camera::Frame;
use crate::config::ModelConfig;

const INPUT_SIZE: usize = 640;
const NMS_IOU_THRESHOLD: f32 = 0.45;
const LETTERBOX_FILL: f64 = 114.0;

#[rustfmt::skip]
const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("model error: {0}")]
    Model(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One labeled candidate; `bbox` is `[x1, y1, x2, y2]` in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

pub trait Detector: Send + Sync {
    fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}

/// YOLOv8 ONNX export (`[1, 4 + classes, boxes]` output) run through
/// onnxruntime. The session is shared by every worker.
pub struct OnnxDetector {
    session: Mutex<Session>,
    output_name: String,
    confidence_threshold: f32,
    labels: Vec<String>,
}

impl OnnxDetector {
    pub fn new(config: &ModelConfig) -> Result<Self, DetectError> {
        let session = build_session(config)
            .map_err(|e| DetectError::Model(format!("{}: {e}", config.path)))?;

        let labels = if config.labels.is_empty() {
            COCO_CLASSES.iter().map(|s| s.to_string()).collect()
        } else {
            config.labels.clone()
        };

        tracing::info!(
            model = %config.path,
            classes = labels.len(),
            threshold = config.confidence_threshold,
            "detection model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            output_name: config.output_name.clone(),
            confidence_threshold: config.confidence_threshold,
            labels,
        })
    }
}

fn build_session(
    config: &ModelConfig,
) -> Result<Session, Box<dyn std::error::Error + Send + Sync>> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(config.intra_threads)?;

    let session = if config.path.starts_with("http://") || config.path.starts_with("https://") {
        builder.commit_from_url(&config.path)?
    } else {
        builder.commit_from_file(&config.path)?
    };
    Ok(session)
}

impl Detector for OnnxDetector {
    fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(frame)?;

        let predictions: Array3<f32> = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let tensor = TensorRef::from_array_view(input.view())
                .map_err(|e| DetectError::Inference(e.to_string()))?
                .into_dyn();
            let outputs = session
                .run(ort::inputs![tensor])
                .map_err(|e| DetectError::Inference(e.to_string()))?;
            let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
                DetectError::Model(format!("model has no output named '{}'", self.output_name))
            })?;
            let owned = output
                .try_extract_array::<f32>()
                .map_err(|e| DetectError::Inference(e.to_string()))?
                .to_owned();
            drop(outputs);
            owned
                .into_dimensionality::<Ix3>()
                .map_err(|e| DetectError::Model(format!("unexpected output shape: {e}")))?
        };

        let candidates = decode_predictions(
            predictions.view(),
            self.confidence_threshold,
            &letterbox,
            frame.width as f32,
            frame.height as f32,
        );

        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD)
            .into_iter()
            .map(|c| Detection {
                label: self
                    .labels
                    .get(c.class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", c.class_id)),
                confidence: c.score,
                bbox: c.bbox,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), DetectError> {
    let rows = frame.height as f32;
    let cols = frame.width as f32;
    let input_size = INPUT_SIZE as f32;

    let scale = (input_size / cols).min(input_size / rows);
    let new_w = (cols * scale).round() as i32;
    let new_h = (rows * scale).round() as i32;

    let flat = Mat::from_slice(&frame.pixels)?;
    let image = flat.reshape(3, frame.height as i32)?;

    let mut resized = Mat::default();
    imgproc::resize(
        &image,
        &mut resized,
        Size::new(new_w, new_h),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let pad_x = (INPUT_SIZE as i32 - new_w) / 2;
    let pad_y = (INPUT_SIZE as i32 - new_h) / 2;

    let mut padded = Mat::default();
    opencv::core::copy_make_border(
        &resized,
        &mut padded,
        pad_y,
        INPUT_SIZE as i32 - new_h - pad_y,
        pad_x,
        INPUT_SIZE as i32 - new_w - pad_x,
        BORDER_CONSTANT,
        Scalar::new(LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL, 0.0),
    )?;

    let mut rgb = Mat::default();
    imgproc::cvt_color_def(&padded, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    let data = rgb.data_bytes()?;
    if data.len() < INPUT_SIZE * INPUT_SIZE * 3 {
        return Err(DetectError::Inference("letterboxed frame too small".into()));
    }

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..INPUT_SIZE {
        for x in 0..INPUT_SIZE {
            let idx = (y * INPUT_SIZE + x) * 3;
            tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
            tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
        }
    }

    Ok((
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    ))
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    class_id: usize,
    score: f32,
    bbox: [f32; 4],
}

fn decode_predictions(
    output: ArrayView3<f32>,
    confidence_threshold: f32,
    letterbox: &Letterbox,
    orig_w: f32,
    orig_h: f32,
) -> Vec<Candidate> {
    let (_, channels, num_boxes) = output.dim();
    if channels <= 4 {
        return Vec::new();
    }
    let num_classes = channels - 4;

    let mut candidates = Vec::new();
    for i in 0..num_boxes {
        let (class_id, score) = (0..num_classes)
            .map(|c| (c, output[[0, 4 + c, i]]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if score < confidence_threshold {
            continue;
        }

        // (cx, cy, w, h) in letterboxed input pixels
        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        let x1 = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, orig_w);
        let y1 = ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, orig_h);
        let x2 = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, orig_w);
        let y2 = ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, orig_h);

        candidates.push(Candidate {
            class_id,
            score,
            bbox: [x1, y1, x2, y2],
        });
    }

    candidates
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-class suppression, highest score first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
