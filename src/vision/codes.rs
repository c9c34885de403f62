//! Barcode and QR code decoding
//!
//! Code zones are tried with a primary multi-symbology backend, then with a
//! QR-only secondary backend. The first backend that reads anything wins.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One symbol read from an image
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCode {
    pub payload: String,
    /// Symbology name ("QR_CODE", "CODE_128", ...)
    pub symbology: String,
}

/// Outcome of decoding a code zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeReading {
    /// Payload of the first symbol
    pub payload: String,
    pub symbology: String,
    /// Number of symbols found in the zone
    pub count: usize,
    /// Backend that decoded the zone
    pub backend: String,
    /// Payload split on the delimiter, empty pieces dropped
    pub sequences: Vec<String>,
}

/// A code decoding library
pub trait CodeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend can decode at all
    fn is_available(&self) -> bool {
        true
    }

    /// Every symbol found in `image`, in detection order
    fn decode(&self, image: &GrayImage) -> Result<Vec<DecodedCode>>;
}

/// QR-only backend built on `rqrr`
pub struct QrBackend;

impl CodeBackend for QrBackend {
    fn name(&self) -> &'static str {
        "rqrr"
    }

    fn decode(&self, image: &GrayImage) -> Result<Vec<DecodedCode>> {
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            image.width() as usize,
            image.height() as usize,
            |x, y| image.get_pixel(x as u32, y as u32).0[0],
        );

        let codes = prepared
            .detect_grids()
            .into_iter()
            .filter_map(|grid| match grid.decode() {
                Ok((_meta, content)) => Some(DecodedCode {
                    payload: content,
                    symbology: "QR_CODE".to_string(),
                }),
                Err(e) => {
                    debug!("QR grid found but not decoded: {:?}", e);
                    None
                }
            })
            .collect();

        Ok(codes)
    }
}

/// Multi-symbology backend built on `rxing`
#[cfg(feature = "barcodes")]
pub struct BarcodeBackend;

#[cfg(feature = "barcodes")]
impl CodeBackend for BarcodeBackend {
    fn name(&self) -> &'static str {
        "rxing"
    }

    fn decode(&self, image: &GrayImage) -> Result<Vec<DecodedCode>> {
        let results = rxing::helpers::detect_multiple_in_luma(
            image.as_raw().clone(),
            image.width(),
            image.height(),
        )
        .map_err(|e| Error::DecodeFailure(e.to_string()))?;

        Ok(results
            .iter()
            .map(|r| DecodedCode {
                payload: r.getText().to_string(),
                symbology: r.getBarcodeFormat().to_string(),
            })
            .collect())
    }
}

/// Primary + QR-only secondary decoder
pub struct CodeDecoder {
    primary: Option<Box<dyn CodeBackend>>,
    secondary: Option<Box<dyn CodeBackend>>,
    delimiter: String,
}

impl CodeDecoder {
    pub fn new(
        primary: Option<Box<dyn CodeBackend>>,
        secondary: Option<Box<dyn CodeBackend>>,
        delimiter: &str,
    ) -> Self {
        Self {
            primary,
            secondary,
            delimiter: delimiter.to_string(),
        }
    }

    /// Decoder with the compiled-in backends
    pub fn with_default_backends(delimiter: &str) -> Self {
        #[cfg(feature = "barcodes")]
        let primary: Option<Box<dyn CodeBackend>> = Some(Box::new(BarcodeBackend));
        #[cfg(not(feature = "barcodes"))]
        let primary: Option<Box<dyn CodeBackend>> = None;

        Self::new(primary, Some(Box::new(QrBackend)), delimiter)
    }

    /// Decode a zone crop
    pub fn decode(&self, crop: &GrayImage) -> Result<CodeReading> {
        let mut failures = Vec::new();

        for backend in [&self.primary, &self.secondary].into_iter().flatten() {
            if !backend.is_available() {
                failures.push(format!("{}: unavailable", backend.name()));
                continue;
            }

            match backend.decode(crop) {
                Ok(codes) if !codes.is_empty() => {
                    let first = &codes[0];
                    info!(
                        "{} decoded {} symbol(s), first is {}",
                        backend.name(),
                        codes.len(),
                        first.symbology
                    );
                    return Ok(CodeReading {
                        payload: first.payload.clone(),
                        symbology: first.symbology.clone(),
                        count: codes.len(),
                        backend: backend.name().to_string(),
                        sequences: split_payload(&first.payload, &self.delimiter),
                    });
                }
                Ok(_) => failures.push(format!("{}: no code detected", backend.name())),
                Err(e) => failures.push(format!("{}: {}", backend.name(), e)),
            }
        }

        if failures.is_empty() {
            failures.push("no decoder backend".to_string());
        }
        Err(Error::DecodeFailure(failures.join("; ")))
    }
}

/// Split a payload into its non-empty delimited pieces
pub fn split_payload(payload: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        return vec![payload.to_string()];
    }
    payload
        .split(delimiter)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Backend returning a fixed payload, or nothing
    pub struct FixedBackend {
        pub name: &'static str,
        pub payload: Option<String>,
        pub available: bool,
    }

    impl CodeBackend for FixedBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn decode(&self, _image: &GrayImage) -> Result<Vec<DecodedCode>> {
            Ok(self
                .payload
                .iter()
                .map(|p| DecodedCode {
                    payload: p.clone(),
                    symbology: "QR_CODE".to_string(),
                })
                .collect())
        }
    }

    pub fn fixed(name: &'static str, payload: Option<&str>) -> Box<dyn CodeBackend> {
        Box::new(FixedBackend {
            name,
            payload: payload.map(str::to_string),
            available: true,
        })
    }

    #[test]
    fn test_split_payload() {
        assert_eq!(split_payload("A*B*C", "*"), vec!["A", "B", "C"]);
        assert_eq!(split_payload("*A**B*", "*"), vec!["A", "B"]);
        assert_eq!(split_payload("PLAIN", "*"), vec!["PLAIN"]);
        assert!(split_payload("", "*").is_empty());
    }

    #[test]
    fn test_primary_wins() {
        let decoder = CodeDecoder::new(
            Some(fixed("primary", Some("A*B*C"))),
            Some(fixed("secondary", Some("OTHER"))),
            "*",
        );
        let reading = decoder.decode(&GrayImage::new(10, 10)).unwrap();
        assert_eq!(reading.backend, "primary");
        assert_eq!(reading.sequences, vec!["A", "B", "C"]);
        assert_eq!(reading.count, 1);
    }

    #[test]
    fn test_secondary_after_primary_failure() {
        let unavailable = Box::new(FixedBackend {
            name: "primary",
            payload: Some("IGNORED".to_string()),
            available: false,
        });
        let decoder = CodeDecoder::new(Some(unavailable), Some(fixed("secondary", Some("QR"))), "*");
        assert_eq!(decoder.decode(&GrayImage::new(10, 10)).unwrap().backend, "secondary");

        let empty = CodeDecoder::new(
            Some(fixed("primary", None)),
            Some(fixed("secondary", Some("QR"))),
            "*",
        );
        assert_eq!(empty.decode(&GrayImage::new(10, 10)).unwrap().payload, "QR");
    }

    #[test]
    fn test_all_backends_fail() {
        let decoder = CodeDecoder::new(Some(fixed("primary", None)), None, "*");
        match decoder.decode(&GrayImage::new(10, 10)) {
            Err(Error::DecodeFailure(msg)) => assert!(msg.contains("primary")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_qr_backend_on_blank_image() {
        let blank = GrayImage::from_pixel(64, 64, image::Luma([255]));
        assert!(QrBackend.decode(&blank).unwrap().is_empty());
    }
}
