//! Error taxonomy for calibration and recognition runs
//!
//! Only anchor/geometry failures that make projection impossible abort a run.
//! Everything that goes wrong for a single zone is converted into a failed
//! `ZoneResult` by the pipeline instead of surfacing here.

use thiserror::Error;

/// Errors produced by the extraction core
#[derive(Error, Debug)]
pub enum Error {
    /// Fewer resolved anchors than the calibration mode requires
    #[error("Anchors not found: {}", .missing.join(", "))]
    MissingAnchors {
        /// Ids of the anchors that were requested but not resolved
        missing: Vec<String>,
    },

    /// A single anchor could not be located
    #[error("Anchor '{0}' not found")]
    AnchorNotFound(String),

    /// A template patch could not be decoded
    #[error("Could not load template image {path}: {reason}")]
    TemplateUnreadable { path: String, reason: String },

    /// The target image could not be decoded
    #[error("Could not load target image: {0}")]
    TargetUnreadable(String),

    /// A recognizer backend is not registered or failed to initialize
    #[error("Recognizer '{0}' is unavailable")]
    RecognizerUnavailable(String),

    /// No decoder backend could read the code zone
    #[error("No code decoded: {0}")]
    DecodeFailure(String),

    /// The zone rectangle is empty after projection
    #[error("Zone '{zone}' has invalid geometry: {reason}")]
    InvalidZoneGeometry { zone: String, reason: String },

    /// The request failed boundary validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Engine configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_anchors_message_lists_ids() {
        let err = Error::MissingAnchors {
            missing: vec!["top".to_string(), "left".to_string()],
        };
        assert_eq!(err.to_string(), "Anchors not found: top, left");
    }

    #[test]
    fn test_invalid_zone_geometry_message() {
        let err = Error::InvalidZoneGeometry {
            zone: "name".to_string(),
            reason: "zero width".to_string(),
        };
        assert!(err.to_string().contains("'name'"));
    }
}
