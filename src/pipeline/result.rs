//! Run output types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use crate::calibration::Calibration;
use crate::geometry::{ImageRelative, Rect};
use crate::pipeline::correction::Correction;
use crate::vision::anchors::AnchorMatch;

/// Engine label for zones nothing could read
pub const NO_ENGINE: &str = "none";

/// Outcome category of one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    Ok,
    LowConfidence,
    Failed,
    /// Final text set by a manual correction
    Corrected,
}

/// Decoded code details for barcode / QR zones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeInfo {
    pub symbology: String,
    pub count: usize,
    pub sequences: Vec<String>,
}

/// Result for one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneResult {
    /// Text as recognized
    pub raw_text: String,
    /// Confidence (0.0 - 1.0)
    pub confidence: f64,
    /// Text after corrections
    pub final_text: String,
    pub status: ZoneStatus,
    /// Source of the reading
    pub engine: String,
    /// Zone position in the full image
    pub coords: Rect<ImageRelative>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<Correction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeInfo>,
    /// Engine that replaced the first reading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_text: Option<String>,
}

impl ZoneResult {
    /// Reading with a status derived from its confidence
    pub fn recognized(text: &str, confidence: f64, engine: &str, floor: f64) -> Self {
        let status = if !text.is_empty() && confidence >= floor {
            ZoneStatus::Ok
        } else {
            ZoneStatus::LowConfidence
        };
        Self {
            raw_text: text.to_string(),
            confidence,
            final_text: text.to_string(),
            status,
            engine: engine.to_string(),
            coords: Rect::new(0.0, 0.0, 0.0, 0.0),
            correction: None,
            code: None,
            improved_by: None,
            manual_text: None,
        }
    }

    /// Zone nothing could read
    pub fn failed(coords: Rect<ImageRelative>) -> Self {
        Self {
            raw_text: String::new(),
            confidence: 0.0,
            final_text: String::new(),
            status: ZoneStatus::Failed,
            engine: NO_ENGINE.to_string(),
            coords,
            correction: None,
            code: None,
            improved_by: None,
            manual_text: None,
        }
    }
}

/// Everything a run produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// One entry per requested zone
    pub results: BTreeMap<String, ZoneResult>,
    /// Zones whose status is not ok
    pub alerts: Vec<String>,
    pub calibration: Calibration,
    pub anchors: Vec<AnchorMatch>,
}

impl RunOutput {
    /// Zone count per engine source
    pub fn engine_stats(&self) -> BTreeMap<String, usize> {
        let mut stats = BTreeMap::new();
        for result in self.results.values() {
            *stats.entry(result.engine.clone()).or_insert(0) += 1;
        }
        stats
    }

    /// Apply operator-entered values. Unknown zone ids are ignored.
    pub fn apply_manual_corrections(&mut self, corrections: &HashMap<String, String>) -> usize {
        let mut applied = 0;
        for (zone_id, text) in corrections {
            if let Some(result) = self.results.get_mut(zone_id) {
                result.final_text = text.clone();
                result.manual_text = Some(text.clone());
                result.status = ZoneStatus::Corrected;
                applied += 1;
            }
        }
        self.refresh_alerts();
        info!("Applied {} manual correction(s)", applied);
        applied
    }

    pub(crate) fn refresh_alerts(&mut self) {
        self.alerts = self
            .results
            .iter()
            .filter(|(_, r)| r.status != ZoneStatus::Ok)
            .map(|(id, _)| id.clone())
            .collect();
    }
}
