//! anchor-ocr - Anchor-calibrated zone extraction with hybrid OCR
//!
//! Locates a document inside a photographed page from textual or visual
//! anchors, maps user-defined zones from the canonical frame into the image,
//! and reads each zone with two recognition engines, fusing their results by
//! confidence and correcting them against known values.

pub mod calibration;
pub mod config;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod request;
pub mod shared;
pub mod storage;
pub mod vision;

pub use calibration::{Calibration, CalibrationFrame, CalibrationMode, FrameCalibrator, ZoneProjector};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use pipeline::{extract_template, FusionOrchestrator, RunOutput, ZoneResult, ZoneStatus};
pub use request::{AnchorId, AnchorSpec, ExtractionRequest, Zone, ZoneKind};
pub use vision::registry::{global as global_registry, RecognizerRegistry};
