//! Tesseract backend (feature `tesseract`)
//!
//! Provides a [`TextRecognizer`] for zone crops and a [`PageReader`] for the
//! full-page word pass. Each keeps one `LepTess` handle open for its language
//! and only switches the page segmentation mode between calls.

use image::GrayImage;
use leptess::{LepTess, Variable};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vision::engines::{Recognition, SegmentationMode, TextRecognizer};
use crate::vision::words::{PageReader, Token};

/// An open Tesseract handle
struct Handle(LepTess);

// SAFETY: the Tesseract base API is not tied to the thread that created it.
// Handles are owned by a recognizer or page reader, which the registry only
// hands out behind a mutex, so a handle is never used concurrently.
unsafe impl Send for Handle {}

impl Handle {
    fn open(language: &str) -> Result<Self> {
        debug!("Loading tesseract language data [{}]", language);
        LepTess::new(None, language)
            .map(Handle)
            .map_err(|e| Error::RecognizerUnavailable(format!("tesseract [{}]: {}", language, e)))
    }

    fn set_mode(&mut self, mode: SegmentationMode) -> Result<()> {
        self.0
            .set_variable(Variable::TesseditPagesegMode, &mode.psm().to_string())
            .map_err(|e| Error::RecognizerUnavailable(format!("tesseract psm: {}", e)))
    }

    /// Replaces the previous image and resets the recognition rectangle
    fn load_image(&mut self, image: &GrayImage) -> Result<()> {
        // leptess decodes an encoded buffer, not raw pixels
        let mut png = std::io::Cursor::new(Vec::new());
        image.write_to(&mut png, image::ImageFormat::Png)?;
        self.0
            .set_image_from_mem(png.get_ref())
            .map_err(|e| Error::DecodeFailure(format!("tesseract image: {}", e)))
    }
}

/// A handle opened for one language, reused until another language is asked for
struct LanguageSlot<T> {
    language: String,
    handle: Option<T>,
}

impl<T> LanguageSlot<T> {
    fn empty() -> Self {
        Self {
            language: String::new(),
            handle: None,
        }
    }

    fn get_or_open(&mut self, language: &str, open: impl FnOnce(&str) -> Result<T>) -> Result<&mut T> {
        if self.handle.is_none() || self.language != language {
            self.handle = Some(open(language)?);
            self.language = language.to_string();
        }
        self.handle
            .as_mut()
            .ok_or_else(|| Error::RecognizerUnavailable(format!("tesseract [{}]", language)))
    }
}

/// Zone recognizer backed by Tesseract
pub struct TesseractRecognizer {
    language: String,
    /// Overrides the requested mode (reader-style use)
    fixed_mode: Option<SegmentationMode>,
    slot: LanguageSlot<Handle>,
}

impl TesseractRecognizer {
    /// Load the language data once; the handle lives as long as the recognizer
    pub fn new(language: &str, fixed_mode: Option<SegmentationMode>) -> Result<Self> {
        let mut slot = LanguageSlot::empty();
        slot.get_or_open(language, Handle::open)?;
        Ok(Self {
            language: language.to_string(),
            fixed_mode,
            slot,
        })
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&mut self, image: &GrayImage, mode: SegmentationMode) -> Result<Recognition> {
        let mode = self.fixed_mode.unwrap_or(mode);
        let handle = self.slot.get_or_open(&self.language, Handle::open)?;
        handle.set_mode(mode)?;
        handle.load_image(image)?;

        let text = handle.0.get_utf8_text().unwrap_or_default().trim().to_string();
        let confidence = if text.is_empty() {
            0.0
        } else {
            handle.0.mean_text_conf().max(0) as f64 / 100.0
        };

        Ok(Recognition { text, confidence })
    }
}

/// Full-page word reader backed by Tesseract
pub struct TesseractPageReader {
    slot: LanguageSlot<Handle>,
}

impl TesseractPageReader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            slot: LanguageSlot::empty(),
        })
    }
}

impl PageReader for TesseractPageReader {
    fn read_words(&mut self, image: &GrayImage, language: &str) -> Result<Vec<Token>> {
        let handle = self.slot.get_or_open(language, Handle::open)?;
        handle.set_mode(SegmentationMode::Auto)?;
        handle.load_image(image)?;
        let lt = &mut handle.0;

        // None when the page has no text at all
        let boxes = match lt.get_component_boxes(leptess::capi::TessPageIteratorLevel_RIL_WORD, true) {
            Some(boxes) => boxes,
            None => return Ok(Vec::new()),
        };

        let mut tokens = Vec::new();
        for bbox in &boxes {
            let geom = bbox.get_geometry();
            lt.set_rectangle(geom.x, geom.y, geom.w, geom.h);

            let text = lt.get_utf8_text().unwrap_or_default().trim().to_string();
            if text.is_empty() {
                continue;
            }

            tokens.push(Token {
                text,
                x: geom.x.max(0) as u32,
                y: geom.y.max(0) as u32,
                width: geom.w.max(0) as u32,
                height: geom.h.max(0) as u32,
                confidence: lt.mean_text_conf() as f32,
            });
        }

        debug!("Tesseract page pass: {} word box(es)", tokens.len());
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_slot_opens_once_per_language() {
        let mut opened: Vec<String> = Vec::new();
        let mut slot: LanguageSlot<String> = LanguageSlot::empty();

        for language in ["fra", "fra", "fra", "ara", "ara", "fra"] {
            let handle = slot
                .get_or_open(language, |lang| {
                    opened.push(lang.to_string());
                    Ok(format!("handle-{}", lang))
                })
                .unwrap();
            assert_eq!(handle, &format!("handle-{}", language));
        }

        assert_eq!(opened, vec!["fra", "ara", "fra"]);
    }

    #[test]
    fn test_failed_open_is_retried() {
        let mut slot: LanguageSlot<u32> = LanguageSlot::empty();
        let err = slot.get_or_open("eng", |_| Err(Error::RecognizerUnavailable("no data".to_string())));
        assert!(err.is_err());

        let mut calls = 0;
        let handle = slot
            .get_or_open("eng", |_| {
                calls += 1;
                Ok(7)
            })
            .unwrap();
        assert_eq!(*handle, 7);
        assert_eq!(calls, 1);
    }
}
