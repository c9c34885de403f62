//! Anchor resolution
//!
//! Each requested anchor is searched for by label (against the page word
//! index) and by template patch, independently. The more confident detection
//! wins; on a tie the label detection is kept.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Error;
use crate::geometry::{FrameRelative, ImageRelative, Point, Rect};
use crate::request::{AnchorId, CompiledAnchor, TemplateSource};
use crate::vision::detection::{Template, TemplateMatcher, TemplateSearch};
use crate::vision::labels::LabelMatcher;
use crate::vision::words::WordIndex;

/// How an anchor was located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Label,
    Template,
}

/// A located anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorDetection {
    /// Token text (label detections only)
    pub text: Option<String>,
    /// Matched label as written in the request (label detections only)
    pub label: Option<String>,
    pub similarity: f64,
    pub bbox: Rect<ImageRelative>,
    pub center: Point<ImageRelative>,
    pub method: DetectionMethod,
    /// Confidence of the winning method (0.0 - 1.0)
    pub confidence: f64,
}

/// Outcome for one requested anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorMatch {
    pub id: AnchorId,
    pub found: bool,
    /// False when the anchor has neither labels nor template
    pub required: bool,
    pub base_position: Point<FrameRelative>,
    pub detection: Option<AnchorDetection>,
    /// Why the anchor was not found
    pub reason: Option<String>,
}

impl AnchorMatch {
    fn found(anchor: &CompiledAnchor, detection: AnchorDetection) -> Self {
        Self {
            id: anchor.id,
            found: true,
            required: true,
            base_position: anchor.base_position,
            detection: Some(detection),
            reason: None,
        }
    }

    fn missing(anchor: &CompiledAnchor, required: bool, reason: String) -> Self {
        Self {
            id: anchor.id,
            found: false,
            required,
            base_position: anchor.base_position,
            detection: None,
            reason: Some(reason),
        }
    }

    /// Detected box, when found
    pub fn bbox(&self) -> Option<Rect<ImageRelative>> {
        self.detection.as_ref().map(|d| d.bbox)
    }

    /// Detected center, when found
    pub fn center(&self) -> Option<Point<ImageRelative>> {
        self.detection.as_ref().map(|d| d.center)
    }
}

/// Locates anchors on a page
pub struct AnchorResolver {
    labels: LabelMatcher,
    templates: TemplateMatcher,
}

impl AnchorResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            labels: LabelMatcher::new(config.anchors.similarity_threshold),
            templates: TemplateMatcher::new(config.templates.clone()),
        }
    }

    /// One [`AnchorMatch`] per anchor, in request order
    pub fn resolve(
        &self,
        anchors: &[CompiledAnchor],
        words: &WordIndex,
        image: &GrayImage,
    ) -> Vec<AnchorMatch> {
        let start = Instant::now();
        let matches: Vec<AnchorMatch> = anchors
            .iter()
            .map(|anchor| self.resolve_one(anchor, words, image))
            .collect();

        let found = matches.iter().filter(|m| m.found).count();
        let required = matches.iter().filter(|m| m.required).count();
        info!(
            "Anchors resolved: {}/{} found in {:.1}ms",
            found,
            required,
            start.elapsed().as_secs_f64() * 1000.0
        );
        matches
    }

    fn resolve_one(&self, anchor: &CompiledAnchor, words: &WordIndex, image: &GrayImage) -> AnchorMatch {
        if anchor.is_empty() {
            debug!("Anchor '{}' has no labels or template, not required", anchor.id);
            return AnchorMatch::missing(anchor, false, "not required".to_string());
        }

        let mut reasons = Vec::new();

        let by_label = if anchor.labels.is_empty() {
            None
        } else {
            let hit = self.detect_by_label(anchor, words);
            if hit.is_none() {
                reasons.push(format!("no token matched {} label(s)", anchor.labels.len()));
            }
            hit
        };

        let by_template = match &anchor.template {
            None => None,
            Some(source) => match load_template(anchor.id, source) {
                Ok(template) => match self.templates.locate(image, &template) {
                    TemplateSearch::Found(location) => Some(AnchorDetection {
                        text: None,
                        label: None,
                        similarity: location.confidence,
                        bbox: location.bbox,
                        center: location.center,
                        method: DetectionMethod::Template,
                        confidence: location.confidence,
                    }),
                    TemplateSearch::NotFound {
                        keypoints,
                        correlation,
                    } => {
                        reasons.push(format!(
                            "template not found (keypoints: {}; correlation: {})",
                            keypoints, correlation
                        ));
                        None
                    }
                },
                Err(e) => {
                    if anchor.labels.is_empty() {
                        warn!("Anchor '{}': {}", anchor.id, e);
                    } else {
                        warn!("Anchor '{}': {} (falling back to labels)", anchor.id, e);
                    }
                    reasons.push(e.to_string());
                    None
                }
            },
        };

        let winner = match (by_label, by_template) {
            (Some(label), Some(template)) => {
                if template.confidence > label.confidence {
                    template
                } else {
                    label
                }
            }
            (Some(label), None) => label,
            (None, Some(template)) => template,
            (None, None) => {
                let reason = format!("{}: {}", Error::AnchorNotFound(anchor.id.to_string()), reasons.join("; "));
                debug!("{}", reason);
                return AnchorMatch::missing(anchor, true, reason);
            }
        };

        let winner = apply_offset(winner, anchor);
        debug!(
            "Anchor '{}' found by {:?} at {} (conf {:.2})",
            anchor.id, winner.method, winner.bbox, winner.confidence
        );
        AnchorMatch::found(anchor, winner)
    }

    fn detect_by_label(&self, anchor: &CompiledAnchor, words: &WordIndex) -> Option<AnchorDetection> {
        let hit = self.labels.best_match(words.tokens(), &anchor.labels)?;
        let token = &words.tokens()[hit.token_index];
        let bbox = token.relative_rect(words.dims());

        Some(AnchorDetection {
            text: Some(token.text.clone()),
            label: Some(hit.label),
            similarity: hit.similarity,
            bbox,
            center: bbox.center(),
            method: DetectionMethod::Label,
            confidence: hit.similarity,
        })
    }
}

fn load_template(id: AnchorId, source: &TemplateSource) -> crate::error::Result<Template> {
    match source {
        TemplateSource::Path(path) => Template::from_file(id.as_str(), path),
        TemplateSource::Image(image) => Ok(Template::from_image(id.as_str(), image.clone())),
    }
}

fn apply_offset(mut detection: AnchorDetection, anchor: &CompiledAnchor) -> AnchorDetection {
    let offset = anchor.offset;
    if offset.dx != 0.0 || offset.dy != 0.0 {
        detection.bbox = detection.bbox.translate(offset.dx, offset.dy);
        detection.center = detection.bbox.center();
    }
    detection
}
