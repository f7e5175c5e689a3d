//! Detection: inference engine seam, tensor decode, NMS and annotation.

pub mod annotate;
pub mod classes;
pub mod engine;
pub mod postprocess;

pub use annotate::annotate_canvas;
pub use classes::{ClassRecord, ClassTable};
pub use engine::{InferenceEngine, OutputTensor, StubEngine};
pub use postprocess::{box_iou, decode_detections, nms, Detection};
