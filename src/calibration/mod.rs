//! Frame calibration
//!
//! Turns resolved anchors into a [`CalibrationFrame`] describing where the
//! canonical document frame sits in the photographed image. Modes, most
//! specific first:
//!
//! 1. four-anchor box (`top`, `right`, `left`, `bottom`)
//! 2. three-anchor legacy box (`top`, `right`, `left_bottom`)
//! 3. least-squares affine over three or more found anchors
//! 4. two-anchor similarity
//! 5. legacy `origin` translation
//!
//! Requests without any searchable anchor run in plain image coordinates.

pub mod projector;

pub use projector::{ProjectedZone, Target, ZoneProjector};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::geometry::{Affine2, FrameRelative, ImageRelative, Point, Rect};
use crate::request::AnchorId;
use crate::vision::anchors::AnchorMatch;

/// Legacy frames narrower or shorter than this span the whole image
const MIN_LEGACY_EXTENT: f64 = 0.01;

/// How the frame was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMode {
    Identity,
    FourAnchorBox,
    ThreeAnchorBox,
    LeastSquares,
    Similarity,
    OriginTranslation,
}

impl CalibrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationMode::Identity => "identity",
            CalibrationMode::FourAnchorBox => "four_anchor_box",
            CalibrationMode::ThreeAnchorBox => "three_anchor_box",
            CalibrationMode::LeastSquares => "least_squares",
            CalibrationMode::Similarity => "similarity",
            CalibrationMode::OriginTranslation => "origin_translation",
        }
    }
}

/// Placement of the canonical frame within the image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationFrame {
    /// Zones are already image-relative
    Identity,
    /// Axis-aligned frame box in image-relative units; triggers a crop
    Box {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    /// General frame-to-image map
    Affine { transform: Affine2 },
    /// Every zone is shifted by the detected origin
    Translation { dx: f64, dy: f64 },
}

impl CalibrationFrame {
    /// Map a frame rectangle into image-relative coordinates
    pub fn map_rect(&self, rect: &Rect<FrameRelative>) -> Rect<ImageRelative> {
        match *self {
            CalibrationFrame::Identity => rect.retag(),
            CalibrationFrame::Box {
                x,
                y,
                width,
                height,
            } => Rect::new(
                x + rect.x_min * width,
                y + rect.y_min * height,
                x + rect.x_max * width,
                y + rect.y_max * height,
            ),
            CalibrationFrame::Affine { transform } => transform.apply_rect(rect),
            CalibrationFrame::Translation { dx, dy } => rect.translate(dx, dy).retag(),
        }
    }

    /// Frame box, for the modes that crop
    pub fn frame_box(&self) -> Option<Rect<ImageRelative>> {
        match *self {
            CalibrationFrame::Box {
                x,
                y,
                width,
                height,
            } => Some(Rect::from_xywh(x, y, width, height)),
            _ => None,
        }
    }
}

/// Calibration result for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub mode: CalibrationMode,
    pub frame: CalibrationFrame,
    /// Anchors the frame was derived from
    pub anchors_used: Vec<AnchorId>,
}

impl Calibration {
    fn new(mode: CalibrationMode, frame: CalibrationFrame, anchors_used: Vec<AnchorId>) -> Self {
        info!("Calibration: {} from {:?}", mode.as_str(), anchors_used);
        Self {
            mode,
            frame,
            anchors_used,
        }
    }

    pub fn identity() -> Self {
        Self {
            mode: CalibrationMode::Identity,
            frame: CalibrationFrame::Identity,
            anchors_used: Vec::new(),
        }
    }
}

/// Derives the calibration frame from anchor matches
#[derive(Debug, Default, Clone)]
pub struct FrameCalibrator;

impl FrameCalibrator {
    pub fn new() -> Self {
        Self
    }

    /// Pick the most specific mode the found anchors allow
    pub fn calibrate(&self, matches: &[AnchorMatch]) -> Result<Calibration> {
        let required: Vec<&AnchorMatch> = matches.iter().filter(|m| m.required).collect();
        if required.is_empty() {
            info!("No anchors requested, using image coordinates");
            return Ok(Calibration::identity());
        }

        let found: Vec<&AnchorMatch> = required.iter().copied().filter(|m| m.found).collect();
        let boxes: HashMap<AnchorId, Rect<ImageRelative>> = found
            .iter()
            .filter_map(|m| Some((m.id, m.bbox()?)))
            .collect();

        if let Some(calibration) = four_anchor_box(&boxes) {
            return Ok(calibration);
        }
        if let Some(calibration) = three_anchor_box(&boxes) {
            return Ok(calibration);
        }

        let pairs: Vec<(AnchorId, Point<FrameRelative>, Point<ImageRelative>)> = found
            .iter()
            .filter_map(|m| Some((m.id, m.base_position, m.center()?)))
            .collect();

        if pairs.len() >= 3 {
            let correspondences: Vec<_> = pairs.iter().map(|(_, b, d)| (*b, *d)).collect();
            match Affine2::least_squares(&correspondences) {
                Some(transform) => {
                    return Ok(Calibration::new(
                        CalibrationMode::LeastSquares,
                        CalibrationFrame::Affine { transform },
                        pairs.iter().map(|(id, _, _)| *id).collect(),
                    ));
                }
                None => warn!("Anchor base positions are collinear, falling back to similarity"),
            }
        }

        if pairs.len() >= 2 {
            let (id0, b0, d0) = pairs[0];
            let (id1, b1, d1) = pairs[1];
            let similarity = Affine2::similarity([b0, b1], [d0, d1]);
            info!(
                "Similarity fit: scale={:.4} rotation={:.4}rad translation=({:.4}, {:.4})",
                similarity.scale,
                similarity.rotation,
                similarity.translation.0,
                similarity.translation.1
            );
            return Ok(Calibration::new(
                CalibrationMode::Similarity,
                CalibrationFrame::Affine {
                    transform: similarity.transform,
                },
                vec![id0, id1],
            ));
        }

        if let Some(origin) = found.iter().find(|m| m.id == AnchorId::Origin) {
            if let Some(center) = origin.center() {
                return Ok(Calibration::new(
                    CalibrationMode::OriginTranslation,
                    CalibrationFrame::Translation {
                        dx: center.x,
                        dy: center.y,
                    },
                    vec![AnchorId::Origin],
                ));
            }
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|m| !m.found)
            .map(|m| m.id.to_string())
            .collect();
        warn!("Calibration impossible, missing anchors: {:?}", missing);
        Err(Error::MissingAnchors { missing })
    }
}

fn four_anchor_box(boxes: &HashMap<AnchorId, Rect<ImageRelative>>) -> Option<Calibration> {
    let top = boxes.get(&AnchorId::Top)?;
    let right = boxes.get(&AnchorId::Right)?;
    let left = boxes.get(&AnchorId::Left)?;
    let bottom = boxes.get(&AnchorId::Bottom)?;

    let frame = CalibrationFrame::Box {
        x: left.x_min,
        y: top.y_min,
        width: legacy_extent("width", right.x_max - left.x_min),
        height: legacy_extent("height", bottom.y_max - top.y_min),
    };
    Some(Calibration::new(
        CalibrationMode::FourAnchorBox,
        frame,
        vec![AnchorId::Top, AnchorId::Right, AnchorId::Left, AnchorId::Bottom],
    ))
}

fn three_anchor_box(boxes: &HashMap<AnchorId, Rect<ImageRelative>>) -> Option<Calibration> {
    let top = boxes.get(&AnchorId::Top)?;
    let right = boxes.get(&AnchorId::Right)?;
    let corner = boxes.get(&AnchorId::LeftBottom)?;

    let width = legacy_extent("width", right.x_max - corner.x_min);
    let height = legacy_extent("height", corner.y_max - top.y_min);

    Some(Calibration::new(
        CalibrationMode::ThreeAnchorBox,
        CalibrationFrame::Box {
            x: corner.x_min,
            y: top.y_min,
            width,
            height,
        },
        vec![AnchorId::Top, AnchorId::Right, AnchorId::LeftBottom],
    ))
}

/// Collapsed or inverted box extents fall back to the full image
fn legacy_extent(axis: &str, extent: f64) -> f64 {
    if extent <= MIN_LEGACY_EXTENT {
        warn!("Anchor box {} {:.4} is degenerate, spanning the whole image", axis, extent);
        1.0
    } else {
        extent
    }
}
