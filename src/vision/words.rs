//! Full-page word index
//!
//! One page-level reading pass produces positioned tokens that anchor labels
//! are searched against.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::geometry::{ImageDims, ImagePixel, ImageRelative, Rect};

/// A recognized word with its pixel box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Recognizer confidence (0 - 100)
    #[serde(rename = "conf")]
    pub confidence: f32,
}

impl Token {
    pub fn pixel_rect(&self) -> Rect<ImagePixel> {
        Rect::from_xywh(
            self.x as f64,
            self.y as f64,
            self.width as f64,
            self.height as f64,
        )
    }

    pub fn relative_rect(&self, dims: ImageDims) -> Rect<ImageRelative> {
        self.pixel_rect().to_relative(dims)
    }
}

/// Reads every word on a page together with its position
pub trait PageReader: Send {
    /// Recognize all words in `image` using the given language code
    fn read_words(&mut self, image: &GrayImage, language: &str) -> Result<Vec<Token>>;
}

/// Filtered tokens of one page, scoped to one run
#[derive(Debug, Clone)]
pub struct WordIndex {
    tokens: Vec<Token>,
    dims: ImageDims,
}

impl WordIndex {
    /// Run the page reader once and index its output
    pub fn build(
        reader: &mut dyn PageReader,
        image: &GrayImage,
        language: &str,
        min_confidence: f32,
    ) -> Result<Self> {
        let tokens = reader.read_words(image, language)?;
        let dims = ImageDims::new(image.width(), image.height());
        let index = Self::from_tokens(tokens, dims, min_confidence);
        info!("Page word pass: {} words kept", index.tokens.len());
        Ok(index)
    }

    /// Index tokens produced elsewhere. Blank tokens and tokens at or below
    /// `min_confidence` are dropped.
    pub fn from_tokens(tokens: Vec<Token>, dims: ImageDims, min_confidence: f32) -> Self {
        let total = tokens.len();
        let tokens: Vec<Token> = tokens
            .into_iter()
            .filter_map(|mut t| {
                let trimmed = t.text.trim();
                if trimmed.is_empty() || t.confidence <= min_confidence {
                    return None;
                }
                if trimmed.len() != t.text.len() {
                    t.text = trimmed.to_string();
                }
                Some(t)
            })
            .collect();

        debug!("Word index: {}/{} tokens kept", tokens.len(), total);
        Self { tokens, dims }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn dims(&self) -> ImageDims {
        self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn token(text: &str, x: u32, y: u32, width: u32, height: u32) -> Token {
        Token {
            text: text.to_string(),
            x,
            y,
            width,
            height,
            confidence: 90.0,
        }
    }

    /// Page reader returning a fixed token list
    pub struct FixedPageReader {
        pub tokens: Vec<Token>,
        pub calls: usize,
    }

    impl PageReader for FixedPageReader {
        fn read_words(&mut self, _image: &GrayImage, _language: &str) -> Result<Vec<Token>> {
            self.calls += 1;
            Ok(self.tokens.clone())
        }
    }

    #[test]
    fn test_filters_blank_and_low_confidence() {
        let mut low = token("LOW", 0, 0, 10, 10);
        low.confidence = 20.0;
        let tokens = vec![token("  ", 0, 0, 5, 5), low, token(" NOM ", 1, 1, 5, 5)];

        let index = WordIndex::from_tokens(tokens, ImageDims::new(100, 100), 20.0);
        assert_eq!(index.tokens().len(), 1);
        assert_eq!(index.tokens()[0].text, "NOM");
    }

    #[test]
    fn test_build_runs_reader_once() {
        let mut reader = FixedPageReader {
            tokens: vec![token("PASSPORT", 10, 10, 80, 20)],
            calls: 0,
        };
        let image = GrayImage::new(800, 600);
        let index = WordIndex::build(&mut reader, &image, "fra+eng", 20.0).unwrap();

        assert_eq!(reader.calls, 1);
        assert_eq!(index.dims(), ImageDims::new(800, 600));
        assert!(!index.is_empty());
    }

    #[test]
    fn test_token_relative_rect() {
        let t = token("PASSPORT", 10, 10, 80, 20);
        let r = t.relative_rect(ImageDims::new(800, 600));
        assert!((r.x_min - 0.0125).abs() < 1e-12);
        assert!((r.x_max - 0.1125).abs() < 1e-12);
        assert!((r.y_max - 0.05).abs() < 1e-12);
    }
}
