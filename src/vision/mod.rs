//! Vision Layer
//!
//! Everything that looks at pixels: the page word pass, anchor label and
//! template detection, zone preprocessing, the two recognition engines and
//! code decoding. Recognizer backends are pluggable:
//! - Tesseract via `leptess` (feature `tesseract`)
//! - Any [`TextRecognizer`] / [`PageReader`] registered at runtime

pub mod anchors;
pub mod codes;
pub mod detection;
pub mod engines;
pub mod labels;
pub mod ocr_preprocess;
pub mod registry;
#[cfg(feature = "tesseract")]
pub mod tesseract;
pub mod words;

pub use anchors::{AnchorDetection, AnchorMatch, AnchorResolver, DetectionMethod};
pub use codes::{CodeBackend, CodeDecoder, CodeReading, DecodedCode, QrBackend};
pub use detection::{MatchMethod, Template, TemplateLocation, TemplateMatcher, TemplateSearch};
pub use engines::{
    EngineKind, EngineOutput, ReaderEngine, Recognition, RecognitionEngine, SegmentationMode,
    SegmentingEngine, TextRecognizer,
};
pub use labels::{LabelHit, LabelMatcher};
pub use registry::{RecognizerRegistry, SharedRecognizer};
pub use words::{PageReader, Token, WordIndex};
