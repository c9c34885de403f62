//! Extraction pipeline
//!
//! One run: page word pass, anchor resolution, calibration, projection, then
//! the fusion stages over every zone:
//!
//! ```text
//! Init -> CodeZonesResolved -> PrimaryPassDone -> SecondaryPassDone
//!      -> CorrectionApplied -> Finalized
//! ```
//!
//! Only a calibration failure aborts a run. Anything that goes wrong for one
//! zone leaves that zone failed and the run continues.

pub mod correction;
pub mod result;

pub use correction::{Correction, ValueCorrector};
pub use result::{CodeInfo, RunOutput, ZoneResult, ZoneStatus, NO_ENGINE};

use image::GrayImage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::calibration::{Calibration, FrameCalibrator, ProjectedZone, ZoneProjector};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::geometry::{ImageDims, ImageRelative, PixelBounds, Rect};
use crate::request::{AnchorSpec, CompiledAnchor, ExtractionRequest, Zone};
use crate::vision::anchors::{AnchorMatch, AnchorResolver};
use crate::vision::codes::CodeDecoder;
use crate::vision::engines::{ReaderEngine, RecognitionEngine, SegmentingEngine};
use crate::vision::registry::RecognizerRegistry;
use crate::vision::words::WordIndex;

/// Fusion stage reached by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FusionStage {
    Init,
    CodeZonesResolved,
    PrimaryPassDone,
    SecondaryPassDone,
    CorrectionApplied,
    Finalized,
}

type SharedEngine = Box<dyn RecognitionEngine + Send + Sync>;

/// Runs extraction requests against page images
pub struct FusionOrchestrator {
    config: EngineConfig,
    registry: Arc<RecognizerRegistry>,
    resolver: AnchorResolver,
    calibrator: FrameCalibrator,
    codes: CodeDecoder,
    primary: SharedEngine,
    secondary: SharedEngine,
    corrector: ValueCorrector,
}

impl FusionOrchestrator {
    pub fn new(config: EngineConfig, registry: Arc<RecognizerRegistry>) -> Self {
        let codes = CodeDecoder::with_default_backends(&config.codes.delimiter);
        Self {
            resolver: AnchorResolver::new(&config),
            calibrator: FrameCalibrator::new(),
            codes,
            primary: Box::new(SegmentingEngine::new(
                registry.clone(),
                config.preprocessing.clone(),
            )),
            secondary: Box::new(ReaderEngine::new(
                registry.clone(),
                config.preprocessing.clone(),
            )),
            corrector: ValueCorrector::new(&config.fusion),
            registry,
            config,
        }
    }

    /// Replace the code decoder
    pub fn with_code_decoder(mut self, codes: CodeDecoder) -> Self {
        self.codes = codes;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decode an image file and run the request on it
    pub fn run_path(&self, path: &Path, request: ExtractionRequest) -> Result<RunOutput> {
        let image = load_target(path)?;
        self.run(&image, request)
    }

    /// Run one request on a decoded page
    pub fn run(&self, image: &GrayImage, request: ExtractionRequest) -> Result<RunOutput> {
        let start = Instant::now();
        let request = request.validate()?;
        info!(
            "Run: {} anchor(s), {} zone(s) on {}x{} image",
            request.anchors.len(),
            request.zones.len(),
            image.width(),
            image.height()
        );

        let anchors = self.locate_anchors(&request.anchors, image)?;
        let calibration = self.calibrator.calibrate(&anchors)?;
        let projector = ZoneProjector::new(image, &calibration);

        let mut run = FusionRun::new(&request.zones, &projector, &calibration);
        run.resolve_codes(&self.codes);
        run.primary_pass(self.primary.as_ref(), self.config.fusion.confidence_floor as f64);
        run.secondary_pass(self.secondary.as_ref(), self.config.fusion.confidence_floor as f64);
        run.apply_corrections(&self.corrector, self.config.fusion.promotion_threshold as f64);
        let output = run.finalize(calibration.clone(), anchors);

        info!(
            "Run finished in {:.1}ms: {} zone(s), {} alert(s)",
            start.elapsed().as_secs_f64() * 1000.0,
            output.results.len(),
            output.alerts.len()
        );
        Ok(output)
    }

    /// Report where each anchor is found, without calibrating
    pub fn preview_anchors(&self, image: &GrayImage, anchors: Vec<AnchorSpec>) -> Result<Vec<AnchorMatch>> {
        let request = ExtractionRequest {
            anchors,
            zones: Vec::new(),
        }
        .validate()?;
        self.locate_anchors(&request.anchors, image)
    }

    fn locate_anchors(&self, anchors: &[CompiledAnchor], image: &GrayImage) -> Result<Vec<AnchorMatch>> {
        if anchors.is_empty() {
            return Ok(Vec::new());
        }

        let dims = ImageDims::new(image.width(), image.height());
        let settings = &self.config.anchors;
        let words = if anchors.iter().any(|a| !a.labels.is_empty()) {
            self.read_page(image)
                .unwrap_or_else(|| WordIndex::from_tokens(Vec::new(), dims, settings.min_token_confidence))
        } else {
            WordIndex::from_tokens(Vec::new(), dims, settings.min_token_confidence)
        };

        Ok(self.resolver.resolve(anchors, &words, image))
    }

    fn read_page(&self, image: &GrayImage) -> Option<WordIndex> {
        let settings = &self.config.anchors;
        let reader = match self.registry.page_reader() {
            Ok(reader) => reader,
            Err(e) => {
                warn!("No page reader, label anchors cannot be found: {}", e);
                return None;
            }
        };

        let mut reader = reader.lock();
        match WordIndex::build(
            &mut **reader,
            image,
            &settings.page_language,
            settings.min_token_confidence,
        ) {
            Ok(words) => Some(words),
            Err(e) => {
                warn!("Page word pass failed: {}", e);
                None
            }
        }
    }
}

/// Per-zone state carried through the stages
struct ZoneSlot<'z> {
    zone: &'z Zone,
    projected: Option<ProjectedZone>,
    crop: Option<GrayImage>,
    result: Option<ZoneResult>,
}

/// State of one run between stages
struct FusionRun<'z, 'p> {
    stage: FusionStage,
    slots: Vec<ZoneSlot<'z>>,
    projector: &'p ZoneProjector<'p>,
    calibration: &'p Calibration,
}

impl<'z, 'p> FusionRun<'z, 'p> {
    fn new(zones: &'z [Zone], projector: &'p ZoneProjector<'p>, calibration: &'p Calibration) -> Self {
        let slots = zones
            .iter()
            .map(|zone| match projector.project(zone) {
                Ok(projected) => {
                    let crop = projector.crop_zone(&projected);
                    ZoneSlot {
                        zone,
                        projected: Some(projected),
                        crop: Some(crop),
                        result: None,
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    ZoneSlot {
                        zone,
                        projected: None,
                        crop: None,
                        result: None,
                    }
                }
            })
            .collect();

        Self {
            stage: FusionStage::Init,
            slots,
            projector,
            calibration,
        }
    }

    fn advance(&mut self, next: FusionStage) {
        debug!("Fusion stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    fn resolve_codes(&mut self, decoder: &CodeDecoder) {
        let mut decoded = 0;
        for slot in self.slots.iter_mut().filter(|s| s.zone.kind.is_code()) {
            let Some(crop) = slot.crop.as_ref() else {
                continue;
            };
            match decoder.decode(crop) {
                Ok(reading) => {
                    let mut result =
                        ZoneResult::recognized(&reading.payload, 1.0, &format!("qrcode_{}", reading.backend), 0.0);
                    result.status = ZoneStatus::Ok;
                    result.code = Some(CodeInfo {
                        symbology: reading.symbology,
                        count: reading.count,
                        sequences: reading.sequences,
                    });
                    slot.result = Some(result);
                    decoded += 1;
                }
                Err(e) => warn!("Zone '{}': {}, falling back to text recognition", slot.zone.id, e),
            }
        }
        if decoded > 0 {
            info!("Decoded {} code zone(s)", decoded);
        }
        self.advance(FusionStage::CodeZonesResolved);
    }

    fn primary_pass(&mut self, engine: &dyn RecognitionEngine, floor: f64) {
        if !engine.is_available() {
            warn!("{} engine unavailable, skipping primary pass", engine.kind());
        } else {
            let pending = self.slots.iter_mut().filter(|s| s.result.is_none());
            for slot in pending {
                let Some(crop) = slot.crop.as_ref() else {
                    continue;
                };
                match engine.recognize(crop, slot.zone.lang, slot.zone.preprocess) {
                    Ok(out) if !out.text.is_empty() => {
                        slot.result = Some(ZoneResult::recognized(
                            &out.text,
                            out.confidence,
                            engine.kind().as_str(),
                            floor,
                        ));
                    }
                    Ok(_) => debug!("Zone '{}': {} read nothing", slot.zone.id, engine.kind()),
                    Err(e) => warn!("Zone '{}': {} failed: {}", slot.zone.id, engine.kind(), e),
                }
            }
        }
        self.advance(FusionStage::PrimaryPassDone);
    }

    fn secondary_pass(&mut self, engine: &dyn RecognitionEngine, floor: f64) {
        if !engine.is_available() {
            debug!("{} engine unavailable, skipping secondary pass", engine.kind());
            self.advance(FusionStage::SecondaryPassDone);
            return;
        }

        let retry = self
            .slots
            .iter_mut()
            .filter(|s| s.result.as_ref().map_or(true, |r| r.confidence < floor));

        let mut improved = 0;
        for slot in retry {
            let Some(crop) = slot.crop.as_ref() else {
                continue;
            };
            let out = match engine.recognize(crop, slot.zone.lang, slot.zone.preprocess) {
                Ok(out) if !out.text.is_empty() => out,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Zone '{}': {} failed: {}", slot.zone.id, engine.kind(), e);
                    continue;
                }
            };

            let replace = match &slot.result {
                None => true,
                Some(previous) => out.confidence > previous.confidence,
            };
            if replace {
                info!(
                    "Zone '{}': {} improved reading to {:.0}%",
                    slot.zone.id,
                    engine.kind(),
                    out.confidence * 100.0
                );
                let mut result =
                    ZoneResult::recognized(&out.text, out.confidence, engine.kind().as_str(), floor);
                result.improved_by = Some(engine.kind().as_str().to_string());
                slot.result = Some(result);
                improved += 1;
            }
        }

        if improved > 0 {
            info!("Secondary pass improved {} zone(s)", improved);
        }
        self.advance(FusionStage::SecondaryPassDone);
    }

    fn apply_corrections(&mut self, corrector: &ValueCorrector, promotion: f64) {
        for slot in &mut self.slots {
            let Some(result) = slot.result.as_mut() else {
                continue;
            };
            if slot.zone.expected_values.is_empty() || result.raw_text.is_empty() {
                continue;
            }
            if let Some(correction) = corrector.correct(&result.raw_text, &slot.zone.expected_values) {
                info!(
                    "Zone '{}': '{}' corrected to '{}' ({:.2})",
                    slot.zone.id, correction.original, correction.value, correction.score
                );
                result.final_text = correction.value.clone();
                let score = correction.score as f64;
                if score >= promotion {
                    result.status = ZoneStatus::Ok;
                    result.confidence = result.confidence.max(score);
                }
                result.correction = Some(correction);
            }
        }
        self.advance(FusionStage::CorrectionApplied);
    }

    fn finalize(mut self, calibration: Calibration, anchors: Vec<AnchorMatch>) -> RunOutput {
        let mut results = BTreeMap::new();
        for slot in self.slots.drain(..) {
            let coords = match &slot.projected {
                Some(projected) => self.projector.reproject(projected),
                None => self.calibration.frame.map_rect(&slot.zone.effective_coords()),
            };
            let result = match slot.result {
                Some(mut result) => {
                    result.coords = coords;
                    result
                }
                None => ZoneResult::failed(coords),
            };
            results.insert(slot.zone.id.clone(), result);
        }
        self.stage = FusionStage::Finalized;
        debug!("Fusion stage {:?}", self.stage);

        let mut output = RunOutput {
            results,
            alerts: Vec::new(),
            calibration,
            anchors,
        };
        output.refresh_alerts();
        output
    }
}

fn load_target(path: &Path) -> Result<GrayImage> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|e| Error::TargetUnreadable(format!("{}: {}", path.display(), e)))
}

/// Cut a normalized rectangle out of a reference image and save it as a
/// template patch
pub fn extract_template(reference: &Path, rect: Rect<ImageRelative>, output: &Path) -> Result<PathBuf> {
    let image = load_target(reference)?;
    let dims = ImageDims::new(image.width(), image.height());
    let bounds = PixelBounds::from_rect(&rect.clamp_unit().to_pixels(dims), dims).ok_or_else(|| {
        Error::InvalidRequest(format!("template rectangle {} is empty", rect))
    })?;

    let patch = image::imageops::crop_imm(&image, bounds.x, bounds.y, bounds.width, bounds.height).to_image();
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    patch.save(output)?;

    info!(
        "Template patch {}x{} saved to {:?}",
        bounds.width, bounds.height, output
    );
    Ok(output.to_path_buf())
}
