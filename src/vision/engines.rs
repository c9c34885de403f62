//! Recognition engines
//!
//! Two interchangeable adapters over raw text recognizers. The segmenting
//! engine sweeps segmentation modes across preprocessing variants; the reader
//! engine tries the raw, upscaled and enhanced crop. Both keep the most
//! confident reading, preferring the longer text on ties.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PreprocessSettings;
use crate::error::Result;
use crate::request::{Language, PreprocessHint};
use crate::vision::ocr_preprocess::{reader_variants, segmenting_variants, Variant};
use crate::vision::registry::RecognizerRegistry;

/// Which adapter produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Multi-mode segmenting recognizer (Engine-A)
    Segmenting,
    /// Reader-style recognizer (Engine-B)
    Reader,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Segmenting => "segmenting",
            EngineKind::Reader => "reader",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page segmentation hint passed to the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    SingleLine,
    Block,
    RawLine,
    SingleWord,
    /// Let the recognizer decide
    Auto,
}

impl SegmentationMode {
    /// Order in which the segmenting engine sweeps modes
    pub const SWEEP: [SegmentationMode; 4] = [
        SegmentationMode::SingleLine,
        SegmentationMode::Block,
        SegmentationMode::RawLine,
        SegmentationMode::SingleWord,
    ];

    /// Tesseract page segmentation mode number
    pub fn psm(&self) -> u32 {
        match self {
            SegmentationMode::SingleLine => 7,
            SegmentationMode::Block => 6,
            SegmentationMode::RawLine => 13,
            SegmentationMode::SingleWord => 8,
            SegmentationMode::Auto => 3,
        }
    }
}

/// Raw recognizer output
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Confidence (0.0 - 1.0)
    pub confidence: f64,
}

/// A raw text recognizer backend
pub trait TextRecognizer: Send {
    fn recognize(&mut self, image: &GrayImage, mode: SegmentationMode) -> Result<Recognition>;
}

/// Best reading an engine produced for one zone
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    /// Confidence (0.0 - 1.0)
    pub confidence: f64,
    /// Variant that produced the text, empty when nothing was read
    pub variant: String,
    pub mode: Option<SegmentationMode>,
}

impl EngineOutput {
    fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            variant: String::new(),
            mode: None,
        }
    }

    /// Replace self when `text`/`confidence` is strictly better
    fn offer(&mut self, text: &str, confidence: f64, variant: &str, mode: Option<SegmentationMode>) {
        let better = confidence > self.confidence
            || (confidence == self.confidence && text.chars().count() > self.text.chars().count());
        if better {
            self.text = text.to_string();
            self.confidence = confidence;
            self.variant = variant.to_string();
            self.mode = mode;
        }
    }
}

/// Common surface of both engines
pub trait RecognitionEngine {
    fn kind(&self) -> EngineKind;

    /// Whether a recognizer backend is registered for this engine
    fn is_available(&self) -> bool;

    /// Read one zone crop
    fn recognize(
        &self,
        zone: &GrayImage,
        language: Language,
        preprocess: PreprocessHint,
    ) -> Result<EngineOutput>;
}

/// Run `recognizer` over every (mode, variant) pair, skipping failures
fn sweep(
    recognizer: &mut dyn TextRecognizer,
    variants: &[Variant],
    modes: &[SegmentationMode],
    record_mode: bool,
) -> EngineOutput {
    let mut best = EngineOutput::empty();

    for &mode in modes {
        for variant in variants {
            match recognizer.recognize(&variant.image, mode) {
                Ok(r) => {
                    let text = r.text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let confidence = r.confidence.clamp(0.0, 1.0);
                    debug!(
                        "{:?} ({}) -> '{}' conf={:.0}%",
                        mode,
                        variant.name,
                        text,
                        confidence * 100.0
                    );
                    best.offer(text, confidence, &variant.name, record_mode.then_some(mode));
                }
                Err(e) => debug!("{:?} ({}) failed: {}", mode, variant.name, e),
            }
        }
    }

    best
}

/// Engine-A: segmentation mode sweep over language-specific variants
pub struct SegmentingEngine {
    registry: Arc<RecognizerRegistry>,
    settings: PreprocessSettings,
}

impl SegmentingEngine {
    pub fn new(registry: Arc<RecognizerRegistry>, settings: PreprocessSettings) -> Self {
        Self { registry, settings }
    }
}

impl RecognitionEngine for SegmentingEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Segmenting
    }

    fn is_available(&self) -> bool {
        self.registry.is_available(EngineKind::Segmenting)
    }

    fn recognize(
        &self,
        zone: &GrayImage,
        language: Language,
        preprocess: PreprocessHint,
    ) -> Result<EngineOutput> {
        let handle = self.registry.get(EngineKind::Segmenting, language)?;
        let mode = preprocess.resolve(language);
        let variants = segmenting_variants(zone, mode, &self.settings);

        let mut recognizer = handle.lock();
        let best = sweep(&mut **recognizer, &variants, &SegmentationMode::SWEEP, true);

        if best.text.is_empty() {
            warn!("Segmenting engine read nothing ({} variants x {} modes)", variants.len(), SegmentationMode::SWEEP.len());
        } else {
            info!(
                "Segmenting engine [{}]: best {:?}/{} conf={:.0}%",
                language.code(),
                best.mode,
                best.variant,
                best.confidence * 100.0
            );
        }
        Ok(best)
    }
}

/// Engine-B: reader-style recognizer over raw, upscaled and enhanced crops
pub struct ReaderEngine {
    registry: Arc<RecognizerRegistry>,
    settings: PreprocessSettings,
}

impl ReaderEngine {
    pub fn new(registry: Arc<RecognizerRegistry>, settings: PreprocessSettings) -> Self {
        Self { registry, settings }
    }
}

impl RecognitionEngine for ReaderEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Reader
    }

    fn is_available(&self) -> bool {
        self.registry.is_available(EngineKind::Reader)
    }

    fn recognize(
        &self,
        zone: &GrayImage,
        language: Language,
        _preprocess: PreprocessHint,
    ) -> Result<EngineOutput> {
        let handle = self.registry.get(EngineKind::Reader, language)?;
        let variants = reader_variants(zone, &self.settings);

        let mut recognizer = handle.lock();
        let best = sweep(&mut **recognizer, &variants, &[SegmentationMode::Auto], false);

        if !best.text.is_empty() {
            info!(
                "Reader engine [{}]: {} conf={:.0}%",
                language.code(),
                best.variant,
                best.confidence * 100.0
            );
        }
        Ok(best)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;

    /// Recognizer answering from a (height, mode) lookup table.
    /// Unknown combinations fail.
    pub struct TableRecognizer {
        pub answers: HashMap<(u32, SegmentationMode), (String, f64)>,
        pub fallback: Option<(String, f64)>,
    }

    impl TextRecognizer for TableRecognizer {
        fn recognize(&mut self, image: &GrayImage, mode: SegmentationMode) -> Result<Recognition> {
            let hit = self
                .answers
                .get(&(image.height(), mode))
                .or(self.fallback.as_ref());
            match hit {
                Some((text, confidence)) => Ok(Recognition {
                    text: text.clone(),
                    confidence: *confidence,
                }),
                None => Err(Error::RecognizerUnavailable("no answer".to_string())),
            }
        }
    }

    /// Recognizer that always returns the same reading
    pub struct ConstRecognizer(pub String, pub f64);

    impl TextRecognizer for ConstRecognizer {
        fn recognize(&mut self, _image: &GrayImage, _mode: SegmentationMode) -> Result<Recognition> {
            Ok(Recognition {
                text: self.0.clone(),
                confidence: self.1,
            })
        }
    }

    fn registry_with(kind: EngineKind, make: fn() -> Box<dyn TextRecognizer>) -> Arc<RecognizerRegistry> {
        let registry = Arc::new(RecognizerRegistry::new());
        registry.register(kind, Box::new(move |_| Ok(make())));
        registry
    }

    #[test]
    fn test_best_by_confidence_then_length() {
        let mut best = EngineOutput::empty();
        best.offer("AB", 0.5, "gray", None);
        best.offer("ABC", 0.5, "iso80", None);
        best.offer("X", 0.4, "iso60", None);
        assert_eq!(best.text, "ABC");
        assert_eq!(best.variant, "iso80");

        best.offer("Z", 0.9, "raw", None);
        assert_eq!(best.text, "Z");
    }

    #[test]
    fn test_segmenting_engine_picks_best_mode() {
        fn make() -> Box<dyn TextRecognizer> {
            let mut answers = HashMap::new();
            // Variants are upscaled to 200px tall
            answers.insert((200, SegmentationMode::SingleLine), ("DUPONT".to_string(), 0.72));
            answers.insert((200, SegmentationMode::Block), ("DUP0NT".to_string(), 0.55));
            answers.insert((200, SegmentationMode::SingleWord), ("DUPONT".to_string(), 0.91));
            Box::new(TableRecognizer {
                answers,
                fallback: None,
            })
        }
        let engine = SegmentingEngine::new(
            registry_with(EngineKind::Segmenting, make),
            PreprocessSettings::default(),
        );
        assert!(engine.is_available());

        let zone = GrayImage::from_pixel(120, 30, image::Luma([200]));
        let out = engine
            .recognize(&zone, Language::French, PreprocessHint::None)
            .unwrap();

        assert_eq!(out.text, "DUPONT");
        assert!((out.confidence - 0.91).abs() < 1e-9);
        assert_eq!(out.mode, Some(SegmentationMode::SingleWord));
        assert_eq!(out.variant, "raw");
    }

    #[test]
    fn test_failing_variants_are_skipped() {
        fn make() -> Box<dyn TextRecognizer> {
            Box::new(TableRecognizer {
                answers: HashMap::new(),
                fallback: None,
            })
        }
        let engine = SegmentingEngine::new(
            registry_with(EngineKind::Segmenting, make),
            PreprocessSettings::default(),
        );
        let zone = GrayImage::from_pixel(40, 20, image::Luma([255]));
        let out = engine
            .recognize(&zone, Language::English, PreprocessHint::LatinSimple)
            .unwrap();
        assert!(out.text.is_empty());
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn test_reader_engine_clamps_confidence() {
        fn make() -> Box<dyn TextRecognizer> {
            Box::new(ConstRecognizer(" 1985 ".to_string(), 1.4))
        }
        let engine = ReaderEngine::new(
            registry_with(EngineKind::Reader, make),
            PreprocessSettings::default(),
        );
        let zone = GrayImage::from_pixel(80, 20, image::Luma([255]));
        let out = engine
            .recognize(&zone, Language::Arabic, PreprocessHint::Auto)
            .unwrap();
        assert_eq!(out.text, "1985");
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.variant, "raw");
        assert!(out.mode.is_none());
    }

    #[test]
    fn test_engine_without_backend_is_unavailable() {
        let engine = ReaderEngine::new(Arc::new(RecognizerRegistry::new()), PreprocessSettings::default());
        assert!(!engine.is_available());
        let zone = GrayImage::new(10, 10);
        assert!(matches!(
            engine.recognize(&zone, Language::French, PreprocessHint::Auto),
            Err(Error::RecognizerUnavailable(_))
        ));
    }
}
