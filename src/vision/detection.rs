//! Template patch localization
//!
//! Finds a small reference patch inside a photographed page. Keypoint matching
//! (FAST corners with oriented binary descriptors over an image pyramid) copes
//! with resolution changes; zero-mean normalized cross-correlation at native
//! scale is the fallback for patches with too little texture.

use image::imageops::FilterType;
use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::TemplateSettings;
use crate::error::{Error, Result};
use crate::geometry::{ImageDims, ImagePixel, ImageRelative, Point, Rect};

/// Radius of the circular patch used for keypoint orientation
const ORIENTATION_RADIUS: i32 = 15;
/// Sampling pairs lie within this box before rotation
const PATTERN_HALF: i32 = 13;
/// Keypoints closer than this to the border are dropped
const BORDER: u32 = 20;
/// Smoothing applied before descriptor sampling
const DESCRIPTOR_SIGMA: f32 = 2.0;
const DESCRIPTOR_BITS: u32 = 256;

/// Template patch to locate
#[derive(Debug, Clone)]
pub struct Template {
    /// Identifier used in logs
    pub id: String,
    grayscale: Arc<GrayImage>,
}

impl Template {
    /// Load template from an image file
    pub fn from_file(id: &str, path: &Path) -> Result<Self> {
        let img = image::open(path).map_err(|e| Error::TemplateUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            id: id.to_string(),
            grayscale: Arc::new(img.to_luma8()),
        })
    }

    /// Wrap an already decoded patch
    pub fn from_image(id: &str, image: Arc<GrayImage>) -> Self {
        Self {
            id: id.to_string(),
            grayscale: image,
        }
    }

    /// Get the grayscale image
    pub fn image(&self) -> &GrayImage {
        &self.grayscale
    }
}

/// How a template was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Keypoints,
    Correlation,
}

/// Where a template was found
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateLocation {
    pub bbox: Rect<ImageRelative>,
    pub center: Point<ImageRelative>,
    /// Match confidence (0.0 - 1.0)
    pub confidence: f64,
    pub method: MatchMethod,
}

/// Outcome of a template search
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateSearch {
    Found(TemplateLocation),
    NotFound {
        /// Why the keypoint pass failed
        keypoints: String,
        /// Why the correlation pass failed
        correlation: String,
    },
}

/// Locates template patches in a target image
#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    settings: TemplateSettings,
}

impl TemplateMatcher {
    pub fn new(settings: TemplateSettings) -> Self {
        Self { settings }
    }

    /// Find `template` in `target`, keypoints first then correlation
    pub fn locate(&self, target: &GrayImage, template: &Template) -> TemplateSearch {
        let start = Instant::now();

        let keypoint_error = match self.match_keypoints(target, template.image()) {
            Ok(location) => {
                info!(
                    "Template '{}' found by keypoints at ({:.3}, {:.3}) in {:?}",
                    template.id,
                    location.center.x,
                    location.center.y,
                    start.elapsed()
                );
                return TemplateSearch::Found(location);
            }
            Err(reason) => reason,
        };

        debug!(
            "Keypoint match failed for '{}' ({}), trying correlation",
            template.id, keypoint_error
        );

        match self.match_correlation(target, template.image()) {
            Ok(location) => {
                info!(
                    "Template '{}' found by correlation at ({:.3}, {:.3}), conf={:.2}",
                    template.id, location.center.x, location.center.y, location.confidence
                );
                TemplateSearch::Found(location)
            }
            Err(reason) => TemplateSearch::NotFound {
                keypoints: keypoint_error,
                correlation: reason,
            },
        }
    }

    fn match_keypoints(
        &self,
        target: &GrayImage,
        template: &GrayImage,
    ) -> std::result::Result<TemplateLocation, String> {
        let tmpl_features = detect_features(template, &self.settings);
        let target_features = detect_features(target, &self.settings);

        let min_kp = self.settings.min_keypoints;
        if tmpl_features.len() < min_kp || target_features.len() < min_kp {
            return Err(format!(
                "insufficient keypoints (template: {}, target: {})",
                tmpl_features.len(),
                target_features.len()
            ));
        }

        let mut matches = mutual_matches(&tmpl_features, &target_features);
        if matches.len() < self.settings.min_matches {
            return Err(format!("insufficient matches: {}", matches.len()));
        }

        matches.sort_by_key(|m| m.distance);
        matches.truncate(self.settings.min_matches * 2);

        let points: Vec<Point<ImagePixel>> = matches
            .iter()
            .map(|m| {
                let kp = &target_features[m.target].keypoint;
                Point::new(kp.x as f64, kp.y as f64)
            })
            .collect();

        let dims = ImageDims::new(target.width(), target.height());
        let bbox = Rect::bounding(&points)
            .ok_or_else(|| "no matched points".to_string())?
            .to_relative(dims);

        let n = points.len() as f64;
        let center = Point::<ImagePixel>::new(
            points.iter().map(|p| p.x).sum::<f64>() / n,
            points.iter().map(|p| p.y).sum::<f64>() / n,
        )
        .to_relative(dims);

        let mean_distance = matches.iter().map(|m| m.distance as f64).sum::<f64>() / n;

        Ok(TemplateLocation {
            bbox,
            center,
            confidence: 1.0 - mean_distance / DESCRIPTOR_BITS as f64,
            method: MatchMethod::Keypoints,
        })
    }

    pub(crate) fn match_correlation(
        &self,
        target: &GrayImage,
        template: &GrayImage,
    ) -> std::result::Result<TemplateLocation, String> {
        let (img_w, img_h) = target.dimensions();
        let (tmpl_w, tmpl_h) = template.dimensions();

        if tmpl_w == 0 || tmpl_h == 0 {
            return Err("empty template".to_string());
        }
        if tmpl_w > img_w || tmpl_h > img_h {
            return Err("template larger than target".to_string());
        }

        let (best_pos, best_score) = best_correlation(target, template);
        let threshold = self.settings.correlation_threshold as f64;
        if best_score < threshold {
            return Err(format!(
                "low correlation ({:.2} < {:.2})",
                best_score, threshold
            ));
        }

        let dims = ImageDims::new(img_w, img_h);
        let bbox = Rect::<ImagePixel>::from_xywh(
            best_pos.0 as f64,
            best_pos.1 as f64,
            tmpl_w as f64,
            tmpl_h as f64,
        )
        .to_relative(dims);

        Ok(TemplateLocation {
            center: bbox.center(),
            bbox,
            confidence: best_score,
            method: MatchMethod::Correlation,
        })
    }
}

/// Exhaustive zero-mean NCC; returns the best top-left corner and its score
fn best_correlation(image: &GrayImage, template: &GrayImage) -> ((u32, u32), f64) {
    let (img_w, img_h) = image.dimensions();
    let (tmpl_w, tmpl_h) = template.dimensions();
    let n = (tmpl_w * tmpl_h) as f64;

    // Zero-mean template, so sum(I * T') == sum((I - mean_I) * T')
    let mean_t = template.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;
    let centered: Vec<f64> = template.as_raw().iter().map(|&v| v as f64 - mean_t).collect();
    let norm_t = centered.iter().map(|v| v * v).sum::<f64>().sqrt();

    let sums = integral_image::<_, u64>(image);
    let squares = integral_squared_image::<_, u64>(image);
    let raw = image.as_raw();
    let stride = img_w as usize;

    let mut best = ((0, 0), f64::MIN);

    for y in 0..=(img_h - tmpl_h) {
        for x in 0..=(img_w - tmpl_w) {
            let (right, bottom) = (x + tmpl_w - 1, y + tmpl_h - 1);
            let sum = sum_image_pixels(&sums, x, y, right, bottom)[0] as f64;
            let sum_sq = sum_image_pixels(&squares, x, y, right, bottom)[0] as f64;
            let var_i = sum_sq - sum * sum / n;
            let denominator = var_i.max(0.0).sqrt() * norm_t;

            let score = if denominator < 1e-10 {
                0.0
            } else {
                let mut numerator = 0.0f64;
                for ty in 0..tmpl_h as usize {
                    let row = (y as usize + ty) * stride + x as usize;
                    let tmpl_row = ty * tmpl_w as usize;
                    for tx in 0..tmpl_w as usize {
                        numerator += raw[row + tx] as f64 * centered[tmpl_row + tx];
                    }
                }
                numerator / denominator
            };

            if score > best.1 {
                best = ((x, y), score);
            }
        }
    }

    (best.0, best.1.clamp(-1.0, 1.0))
}

/// A keypoint in base-image pixel coordinates
#[derive(Debug, Clone, Copy)]
struct Keypoint {
    x: f32,
    y: f32,
    score: f32,
}

#[derive(Debug, Clone)]
struct Feature {
    keypoint: Keypoint,
    descriptor: [u64; 4],
}

#[derive(Debug, Clone, Copy)]
struct FeatureMatch {
    target: usize,
    distance: u32,
}

/// Sampling pairs (dx1, dy1, dx2, dy2), fixed for the life of the process
static PATTERN: Lazy<Vec<[i32; 4]>> = Lazy::new(|| {
    let mut state: u32 = 0x2545_f491;
    let mut next = || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        ((state >> 16) % (2 * PATTERN_HALF as u32 + 1)) as i32 - PATTERN_HALF
    };
    (0..DESCRIPTOR_BITS)
        .map(|_| [next(), next(), next(), next()])
        .collect()
});

/// Detect oriented keypoints on every pyramid level and describe them
fn detect_features(image: &GrayImage, settings: &TemplateSettings) -> Vec<Feature> {
    let mut features = Vec::new();
    let min_side = 2 * BORDER + 1;

    for level in 0..settings.pyramid_levels.max(1) {
        let scale = settings.pyramid_scale.max(1.0).powi(level as i32);
        let w = (image.width() as f32 / scale).round() as u32;
        let h = (image.height() as f32 / scale).round() as u32;
        if w < min_side || h < min_side {
            break;
        }

        let level_img = if level == 0 {
            image.clone()
        } else {
            image::imageops::resize(image, w, h, FilterType::Triangle)
        };
        let smoothed = gaussian_blur_f32(&level_img, DESCRIPTOR_SIGMA);

        for corner in corners_fast9(&level_img, settings.fast_threshold) {
            if corner.x < BORDER
                || corner.y < BORDER
                || corner.x >= w - BORDER
                || corner.y >= h - BORDER
            {
                continue;
            }

            let angle = orientation(&level_img, corner.x, corner.y);
            let descriptor = describe(&smoothed, corner.x, corner.y, angle);
            features.push(Feature {
                keypoint: Keypoint {
                    x: corner.x as f32 * scale,
                    y: corner.y as f32 * scale,
                    score: corner.score,
                },
                descriptor,
            });
        }
    }

    features.sort_by(|a, b| b.keypoint.score.total_cmp(&a.keypoint.score));
    features.truncate(settings.max_features);
    features
}

/// Intensity-centroid orientation in radians
fn orientation(image: &GrayImage, cx: u32, cy: u32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;

    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = image.get_pixel((cx as i32 + dx) as u32, (cy as i32 + dy) as u32).0[0] as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }

    m01.atan2(m10)
}

/// 256-bit binary descriptor steered by the keypoint angle
fn describe(smoothed: &GrayImage, cx: u32, cy: u32, angle: f32) -> [u64; 4] {
    let (sin, cos) = angle.sin_cos();
    let sample = |dx: i32, dy: i32| -> u8 {
        let rx = (cos * dx as f32 - sin * dy as f32).round() as i32;
        let ry = (sin * dx as f32 + cos * dy as f32).round() as i32;
        smoothed
            .get_pixel((cx as i32 + rx) as u32, (cy as i32 + ry) as u32)
            .0[0]
    };

    let mut bits = [0u64; 4];
    for (i, pair) in PATTERN.iter().enumerate() {
        if sample(pair[0], pair[1]) < sample(pair[2], pair[3]) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    bits
}

fn hamming(a: &[u64; 4], b: &[u64; 4]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Brute-force Hamming matching keeping only mutual best pairs
fn mutual_matches(template: &[Feature], target: &[Feature]) -> Vec<FeatureMatch> {
    let best_in = |needle: &Feature, haystack: &[Feature]| -> Option<(usize, u32)> {
        haystack
            .iter()
            .enumerate()
            .map(|(i, f)| (i, hamming(&needle.descriptor, &f.descriptor)))
            .min_by_key(|&(_, d)| d)
    };

    let reverse: Vec<Option<usize>> = target
        .iter()
        .map(|t| best_in(t, template).map(|(i, _)| i))
        .collect();

    template
        .iter()
        .enumerate()
        .filter_map(|(ti, feature)| {
            let (target_idx, distance) = best_in(feature, target)?;
            (reverse[target_idx] == Some(ti)).then_some(FeatureMatch {
                target: target_idx,
                distance,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Deterministic textured image
    fn noise(width: u32, height: u32, seed: u32) -> GrayImage {
        let mut state = seed;
        GrayImage::from_fn(width, height, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            Luma([(state >> 16) as u8])
        })
    }

    #[test]
    fn test_ncc_perfect_match() {
        let img = GrayImage::from_raw(4, 2, vec![100u8, 200, 100, 200, 200, 100, 200, 100]).unwrap();
        let tmpl = GrayImage::from_raw(2, 1, vec![100u8, 200]).unwrap();

        let (pos, score) = best_correlation(&img, &tmpl);
        assert_eq!(pos, (0, 0));
        assert!(score > 0.99, "Perfect match should have high score: {}", score);
    }

    #[test]
    fn test_correlation_locates_exact_patch() {
        let target = noise(120, 90, 7);
        let patch = image::imageops::crop_imm(&target, 40, 30, 24, 16).to_image();

        let matcher = TemplateMatcher::new(TemplateSettings::default());
        let location = matcher.match_correlation(&target, &patch).unwrap();

        assert_eq!(location.method, MatchMethod::Correlation);
        assert!(location.confidence > 0.99);
        assert!((location.bbox.x_min - 40.0 / 120.0).abs() < 1e-9);
        assert!((location.bbox.y_min - 30.0 / 90.0).abs() < 1e-9);
        assert!((location.center.x - 52.0 / 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_locate_finds_textured_patch() {
        let target = noise(200, 150, 11);
        let patch = Template::from_image(
            "stamp",
            Arc::new(image::imageops::crop_imm(&target, 60, 40, 70, 60).to_image()),
        );

        // Keep every corner so the patch's own keypoints survive in the target
        let settings = TemplateSettings {
            max_features: 20_000,
            ..Default::default()
        };
        let matcher = TemplateMatcher::new(settings);
        match matcher.locate(&target, &patch) {
            TemplateSearch::Found(location) => {
                let cx = location.center.x * 200.0;
                let cy = location.center.y * 150.0;
                assert!((60.0..=130.0).contains(&cx), "center x {}", cx);
                assert!((40.0..=100.0).contains(&cy), "center y {}", cy);
                assert!(location.confidence > 0.5);
            }
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[test]
    fn test_template_larger_than_target() {
        let target = GrayImage::from_pixel(20, 20, Luma([128]));
        let patch = Template::from_image("big", Arc::new(noise(40, 40, 3)));

        let matcher = TemplateMatcher::new(TemplateSettings::default());
        match matcher.locate(&target, &patch) {
            TemplateSearch::NotFound { correlation, .. } => {
                assert!(correlation.contains("larger"));
            }
            other => panic!("expected no match, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_patch_not_found() {
        let target = noise(80, 60, 5);
        let patch = Template::from_image("flat", Arc::new(GrayImage::from_pixel(10, 10, Luma([90]))));

        let matcher = TemplateMatcher::new(TemplateSettings::default());
        assert!(matches!(
            matcher.locate(&target, &patch),
            TemplateSearch::NotFound { .. }
        ));
    }

    #[test]
    fn test_descriptor_is_deterministic() {
        let img = noise(64, 64, 9);
        let smoothed = gaussian_blur_f32(&img, DESCRIPTOR_SIGMA);
        let angle = orientation(&img, 32, 32);
        let a = describe(&smoothed, 32, 32, angle);
        let b = describe(&smoothed, 32, 32, angle);
        assert_eq!(hamming(&a, &b), 0);
    }

    #[test]
    fn test_missing_template_file() {
        let err = Template::from_file("x", Path::new("/nonexistent/template.png")).unwrap_err();
        assert!(matches!(err, Error::TemplateUnreadable { .. }));
    }
}
