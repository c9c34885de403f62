//! Extraction requests
//!
//! The caller-facing description of a run: which anchors to look for and which
//! zones to read. A request is validated once into a [`ValidatedRequest`]; the
//! rest of the pipeline only ever sees the compiled form.

use image::GrayImage;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::{FrameRelative, Point, Rect};

/// Prefix marking a label as a regular expression
pub const REGEX_PREFIX: &str = "regex:";

/// Fixed anchor vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorId {
    Top,
    Right,
    Left,
    Bottom,
    /// Legacy combined left/bottom anchor (3-anchor frames)
    LeftBottom,
    /// Legacy single-origin anchor
    Origin,
    /// Legacy width anchor
    Width,
    /// Legacy height anchor
    Height,
}

impl AnchorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorId::Top => "top",
            AnchorId::Right => "right",
            AnchorId::Left => "left",
            AnchorId::Bottom => "bottom",
            AnchorId::LeftBottom => "left_bottom",
            AnchorId::Origin => "origin",
            AnchorId::Width => "width",
            AnchorId::Height => "height",
        }
    }

    /// Canonical position of this anchor on the template frame
    pub fn default_base_position(&self) -> Point<FrameRelative> {
        let (x, y) = match self {
            AnchorId::Top => (0.5, 0.0),
            AnchorId::Right => (1.0, 0.5),
            AnchorId::Left => (0.0, 0.5),
            AnchorId::Bottom => (0.5, 1.0),
            AnchorId::LeftBottom => (0.0, 1.0),
            AnchorId::Origin => (0.0, 0.0),
            AnchorId::Width => (1.0, 0.0),
            AnchorId::Height => (0.0, 1.0),
        };
        Point::new(x, y)
    }

    fn is_legacy_origin_set(&self) -> bool {
        matches!(self, AnchorId::Origin | AnchorId::Width | AnchorId::Height)
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed displacement added to a detected anchor box or a zone rectangle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub dx: f64,
    pub dy: f64,
}

/// One anchor as supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnchorSpec {
    pub id: Option<AnchorId>,
    /// Literal labels, or `regex:`-prefixed patterns
    #[serde(default)]
    pub labels: Vec<String>,
    /// Template patch on disk
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// Template patch already in memory (takes precedence over `template`)
    #[serde(skip)]
    pub template_image: Option<Arc<GrayImage>>,
    #[serde(default)]
    pub base_position: Option<Point<FrameRelative>>,
    /// Shift applied to the detected box, in image-relative units
    #[serde(default)]
    pub offset: Option<Offset>,
}

impl AnchorSpec {
    pub fn with_labels(id: AnchorId, labels: &[&str]) -> Self {
        Self {
            id: Some(id),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// A compiled anchor label
#[derive(Debug, Clone)]
pub enum LabelPattern {
    Literal(String),
    Regex { source: String, regex: Regex },
}

impl LabelPattern {
    pub fn compile(label: &str) -> Result<Self> {
        match label.strip_prefix(REGEX_PREFIX) {
            Some(pattern) => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::InvalidRequest(format!("invalid regex label '{}': {}", pattern, e))
                    })?;
                Ok(LabelPattern::Regex {
                    source: label.to_string(),
                    regex,
                })
            }
            None => Ok(LabelPattern::Literal(label.to_string())),
        }
    }

    /// Label as written in the request
    pub fn source(&self) -> &str {
        match self {
            LabelPattern::Literal(s) => s,
            LabelPattern::Regex { source, .. } => source,
        }
    }
}

/// Where a template patch comes from
#[derive(Debug, Clone)]
pub enum TemplateSource {
    Path(PathBuf),
    Image(Arc<GrayImage>),
}

/// Anchor after boundary validation
#[derive(Debug, Clone)]
pub struct CompiledAnchor {
    pub id: AnchorId,
    pub labels: Vec<LabelPattern>,
    pub template: Option<TemplateSource>,
    pub base_position: Point<FrameRelative>,
    pub offset: Offset,
}

impl CompiledAnchor {
    /// Neither labels nor a template: nothing to search for
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.template.is_none()
    }
}

/// Zone content type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    #[default]
    Text,
    Qrcode,
    Barcode,
}

impl ZoneKind {
    pub fn is_code(&self) -> bool {
        matches!(self, ZoneKind::Qrcode | ZoneKind::Barcode)
    }
}

/// Recognition language hint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "ara")]
    Arabic,
    #[default]
    #[serde(rename = "ara+fra")]
    ArabicFrench,
    #[serde(rename = "fra")]
    French,
    #[serde(rename = "eng")]
    English,
}

impl Language {
    /// Language code understood by the segmenting engine
    pub fn code(&self) -> &'static str {
        match self {
            Language::Arabic => "ara",
            Language::ArabicFrench => "ara+fra",
            Language::French => "fra",
            Language::English => "eng",
        }
    }

    pub fn is_arabic(&self) -> bool {
        matches!(self, Language::Arabic | Language::ArabicFrench)
    }
}

/// Preprocessing hint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessHint {
    /// Pick from the language
    #[default]
    Auto,
    ArabicTextured,
    LatinSimple,
    None,
}

impl PreprocessHint {
    /// Replace `Auto` with a concrete mode
    pub fn resolve(self, language: Language) -> Self {
        match self {
            PreprocessHint::Auto if language.is_arabic() => PreprocessHint::ArabicTextured,
            PreprocessHint::Auto => PreprocessHint::LatinSimple,
            other => other,
        }
    }
}

/// One extraction zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub coords: Rect<FrameRelative>,
    #[serde(default, rename = "type")]
    pub kind: ZoneKind,
    #[serde(default)]
    pub lang: Language,
    #[serde(default)]
    pub preprocess: PreprocessHint,
    #[serde(default)]
    pub expected_values: Vec<String>,
    /// Shift applied to the rectangle before projection, in frame units
    #[serde(default)]
    pub offset: Option<Offset>,
}

impl Zone {
    pub fn text(id: &str, coords: Rect<FrameRelative>) -> Self {
        Self {
            id: id.to_string(),
            coords,
            kind: ZoneKind::Text,
            lang: Language::default(),
            preprocess: PreprocessHint::default(),
            expected_values: Vec::new(),
            offset: None,
        }
    }

    /// Rectangle with the zone offset applied
    pub fn effective_coords(&self) -> Rect<FrameRelative> {
        match self.offset {
            Some(o) => self.coords.translate(o.dx, o.dy),
            None => self.coords,
        }
    }
}

/// Anchors and zones for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionRequest {
    #[serde(default)]
    pub anchors: Vec<AnchorSpec>,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

/// A request that passed boundary validation
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub anchors: Vec<CompiledAnchor>,
    pub zones: Vec<Zone>,
}

impl ExtractionRequest {
    /// Parse a request from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidRequest(e.to_string()))
    }

    /// Check ids and compile labels.
    ///
    /// Anchor sets follow the frame vocabulary: `left_bottom` is only used when
    /// neither `left` nor `bottom` is given, and the legacy `origin`/`width`/
    /// `height` set only when no directional anchor is given. Anchors dropped by
    /// these rules are logged and ignored.
    pub fn validate(self) -> Result<ValidatedRequest> {
        let mut seen_zones = HashSet::new();
        for zone in &self.zones {
            if zone.id.trim().is_empty() {
                return Err(Error::InvalidRequest("zone with empty id".to_string()));
            }
            if !seen_zones.insert(zone.id.as_str()) {
                return Err(Error::InvalidRequest(format!("duplicate zone id '{}'", zone.id)));
            }
        }

        let mut seen_anchors = HashSet::new();
        let mut compiled = Vec::with_capacity(self.anchors.len());
        for spec in self.anchors {
            let id = spec
                .id
                .ok_or_else(|| Error::InvalidRequest("anchor without id".to_string()))?;
            if !seen_anchors.insert(id) {
                return Err(Error::InvalidRequest(format!("duplicate anchor id '{}'", id)));
            }

            let labels = spec
                .labels
                .iter()
                .filter(|l| !l.trim().is_empty())
                .map(|l| LabelPattern::compile(l))
                .collect::<Result<Vec<_>>>()?;

            let template = match (spec.template_image, spec.template) {
                (Some(image), _) => Some(TemplateSource::Image(image)),
                (None, Some(path)) => Some(TemplateSource::Path(path)),
                (None, None) => None,
            };

            compiled.push(CompiledAnchor {
                id,
                labels,
                template,
                base_position: spec
                    .base_position
                    .unwrap_or_else(|| id.default_base_position()),
                offset: spec.offset.unwrap_or_default(),
            });
        }

        Ok(ValidatedRequest {
            anchors: select_anchor_set(compiled),
            zones: self.zones,
        })
    }
}

fn select_anchor_set(anchors: Vec<CompiledAnchor>) -> Vec<CompiledAnchor> {
    let has = |id: AnchorId| anchors.iter().any(|a| a.id == id);
    let directional = anchors.iter().any(|a| !a.id.is_legacy_origin_set());
    let split_corner = has(AnchorId::Left) || has(AnchorId::Bottom);

    anchors
        .into_iter()
        .filter(|a| {
            let keep = match a.id {
                AnchorId::LeftBottom => !split_corner,
                id if id.is_legacy_origin_set() => !directional,
                _ => true,
            };
            if !keep {
                debug!("Ignoring anchor '{}' superseded by a more specific set", a.id);
            }
            keep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str) -> Zone {
        Zone::text(id, Rect::new(0.1, 0.1, 0.5, 0.2))
    }

    #[test]
    fn test_parse_request_json() {
        let json = r#"{
            "anchors": [
                {"id": "top", "labels": ["PASSPORT", "regex:P<[A-Z]{3}"]},
                {"id": "left_bottom", "labels": ["SIGNATURE"], "offset": {"dx": 0.01, "dy": 0.0}}
            ],
            "zones": [
                {"id": "name", "coords": [0.1, 0.2, 0.6, 0.3], "lang": "fra"},
                {"id": "mrz", "coords": [0.0, 0.8, 1.0, 1.0], "type": "qrcode"},
                {"id": "sex", "coords": [0.5, 0.5, 0.6, 0.55], "expected_values": ["M", "F"], "preprocess": "none"}
            ]
        }"#;

        let request = ExtractionRequest::from_json(json).unwrap();
        assert_eq!(request.anchors.len(), 2);
        assert_eq!(request.zones[0].lang, Language::French);
        assert_eq!(request.zones[1].kind, ZoneKind::Qrcode);
        assert_eq!(request.zones[2].preprocess, PreprocessHint::None);
        assert_eq!(request.zones[2].lang, Language::ArabicFrench);

        let validated = request.validate().unwrap();
        assert_eq!(validated.anchors.len(), 2);
        assert!(matches!(validated.anchors[0].labels[1], LabelPattern::Regex { .. }));
        assert!((validated.anchors[1].offset.dx - 0.01).abs() < 1e-12);
        assert_eq!(validated.anchors[1].base_position, Point::new(0.0, 1.0));
    }

    #[test]
    fn test_duplicate_zone_rejected() {
        let request = ExtractionRequest {
            anchors: vec![],
            zones: vec![zone("a"), zone("a")],
        };
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let request = ExtractionRequest {
            anchors: vec![AnchorSpec::with_labels(AnchorId::Top, &["regex:(unclosed"])],
            zones: vec![],
        };
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_left_bottom_dropped_when_split_corner_given() {
        let request = ExtractionRequest {
            anchors: vec![
                AnchorSpec::with_labels(AnchorId::Top, &["A"]),
                AnchorSpec::with_labels(AnchorId::Left, &["B"]),
                AnchorSpec::with_labels(AnchorId::LeftBottom, &["C"]),
            ],
            zones: vec![],
        };
        let ids: Vec<_> = request.validate().unwrap().anchors.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![AnchorId::Top, AnchorId::Left]);
    }

    #[test]
    fn test_legacy_origin_only_without_directional_anchors() {
        let legacy = ExtractionRequest {
            anchors: vec![
                AnchorSpec::with_labels(AnchorId::Origin, &["NOM"]),
                AnchorSpec::with_labels(AnchorId::Width, &["DATE"]),
            ],
            zones: vec![],
        };
        assert_eq!(legacy.validate().unwrap().anchors.len(), 2);

        let mixed = ExtractionRequest {
            anchors: vec![
                AnchorSpec::with_labels(AnchorId::Origin, &["NOM"]),
                AnchorSpec::with_labels(AnchorId::Top, &["TITRE"]),
            ],
            zones: vec![],
        };
        let ids: Vec<_> = mixed.validate().unwrap().anchors.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![AnchorId::Top]);
    }

    #[test]
    fn test_preprocess_auto_resolution() {
        assert_eq!(
            PreprocessHint::Auto.resolve(Language::Arabic),
            PreprocessHint::ArabicTextured
        );
        assert_eq!(
            PreprocessHint::Auto.resolve(Language::English),
            PreprocessHint::LatinSimple
        );
        assert_eq!(
            PreprocessHint::None.resolve(Language::Arabic),
            PreprocessHint::None
        );
    }

    #[test]
    fn test_zone_offset_shifts_coords() {
        let mut z = zone("a");
        z.offset = Some(Offset { dx: 0.05, dy: -0.05 });
        let r = z.effective_coords();
        assert!((r.x_min - 0.15).abs() < 1e-12);
        assert!((r.y_min - 0.05).abs() < 1e-12);
    }
}
