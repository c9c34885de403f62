//! Image preprocessing filters for zone recognition
//!
//! Builds the set of image variants a recognizer is run against. Documents with
//! textured security backgrounds need the dark ink isolated from the pattern;
//! plain latin documents mostly need vertical guide lines removed.

use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::contrast::{adaptive_threshold, equalize_histogram, otsu_level};
use imageproc::integral_image::{integral_image, sum_image_pixels};
use imageproc::morphology::{grayscale_close, grayscale_open, Mask};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::debug;

use crate::config::PreprocessSettings;
use crate::request::PreprocessHint;

const FOREGROUND: u8 = 255;
const BACKGROUND: u8 = 0;

/// Components smaller than this (pixels) are always treated as noise
const MIN_COMPONENT_AREA: f64 = 10.0;
/// Components smaller than this fraction of the median are noise
const COMPONENT_MEDIAN_RATIO: f64 = 0.2;
/// Largest structuring element side accepted by `Mask`
const MAX_ELEMENT_SIDE: u32 = 511;

/// One preprocessed image handed to a recognizer
#[derive(Debug, Clone)]
pub struct Variant {
    /// Short tag used in logs ("iso80", "gray", ...)
    pub name: String,
    pub image: GrayImage,
}

impl Variant {
    fn new(name: impl Into<String>, image: GrayImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }
}

/// Variants for the segmenting engine, chosen by preprocessing mode
pub fn segmenting_variants(
    zone: &GrayImage,
    mode: PreprocessHint,
    settings: &PreprocessSettings,
) -> Vec<Variant> {
    let upscaled = upscale_for_ocr(
        zone,
        settings.upscale_min_height,
        settings.upscale_target_height,
    );

    let variants = match mode {
        PreprocessHint::ArabicTextured | PreprocessHint::Auto => {
            let mut v: Vec<Variant> = settings
                .textured_thresholds
                .iter()
                .map(|&t| Variant::new(format!("iso{}", t), isolate_dark_text(&upscaled, t, false)))
                .collect();
            v.push(Variant::new("nobin", prepare_textured(&upscaled, false)));
            v.push(Variant::new("gray", upscaled));
            v
        }
        PreprocessHint::LatinSimple => {
            let mut v: Vec<Variant> = settings
                .latin_thresholds
                .iter()
                .map(|&t| {
                    Variant::new(
                        format!("iso{}_novlines", t),
                        isolate_dark_text(&upscaled, t, true),
                    )
                })
                .collect();
            v.push(Variant::new("binary", otsu_binarize(&upscaled)));
            v.push(Variant::new("gray", upscaled));
            v
        }
        PreprocessHint::None => vec![Variant::new("raw", upscaled)],
    };

    debug!(
        "Prepared {} variant(s) for mode {:?}: {:?}",
        variants.len(),
        mode,
        variants.iter().map(|v| v.name.as_str()).collect::<Vec<_>>()
    );
    variants
}

/// Variants for the reader engine: raw crop, upscaled, upscaled and enhanced
pub fn reader_variants(zone: &GrayImage, settings: &PreprocessSettings) -> Vec<Variant> {
    let upscaled = upscale_for_ocr(
        zone,
        settings.upscale_min_height,
        settings.upscale_target_height,
    );
    let enhanced = prepare_textured(&upscaled, false);

    vec![
        Variant::new("raw", zone.clone()),
        Variant::new("upscaled", upscaled),
        Variant::new("upscaled_enhanced", enhanced),
    ]
}

/// Enlarge short crops so glyphs reach a readable height
pub fn upscale_for_ocr(img: &GrayImage, min_height: u32, target_height: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if h == 0 || h >= min_height {
        return img.clone();
    }

    let scale = target_height as f64 / h as f64;
    let new_w = ((w as f64 * scale) as u32).max(1);
    let new_h = ((h as f64 * scale) as u32).max(1);

    debug!("Upscale for OCR: {}x{} -> {}x{} (x{:.1})", w, h, new_w, new_h, scale);
    image::imageops::resize(img, new_w, new_h, FilterType::Lanczos3)
}

/// Keep only pixels darker than `threshold`, drop background speckle, and
/// return black text on white.
pub fn isolate_dark_text(img: &GrayImage, threshold: u8, remove_vlines: bool) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut mask = GrayImage::from_fn(w, h, |x, y| {
        if img.get_pixel(x, y).0[0] < threshold {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    });

    if remove_vlines {
        remove_vertical_lines(&mut mask, (h / 4).max(2));
    }

    // 1x2 opening drops one-pixel-tall specks, 3x1 closing bridges stroke gaps
    let opened = grayscale_open(&mask, &rect_element(1, 2));
    let mask = grayscale_close(&opened, &rect_element(3, 1));
    let (filtered, kept) = drop_small_components(&mask);

    debug!(
        "Dark text isolation: threshold={}, components kept={}{}",
        threshold,
        kept,
        if remove_vlines { " +vlines removed" } else { "" }
    );

    invert(&filtered)
}

/// Contrast-equalize, trim empty margins, optionally binarize
pub fn prepare_textured(img: &GrayImage, binarize: bool) -> GrayImage {
    let enhanced = equalize_histogram(img);
    let cropped = content_crop(&enhanced);
    if binarize && cropped.width() > 0 && cropped.height() > 0 {
        adaptive_threshold(&cropped, 7)
    } else {
        cropped
    }
}

/// Global Otsu binarization (dark text stays dark)
pub fn otsu_binarize(img: &GrayImage) -> GrayImage {
    let level = otsu_level(img);
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] > level { 255 } else { 0 };
    }
    out
}

/// Local threshold: a pixel is ink when it is more than `offset` below the
/// mean of its `(2 * radius + 1)` window
pub fn adaptive_binarize(img: &GrayImage, radius: u32, offset: i32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let integral = integral_image::<_, u64>(img);

    GrayImage::from_fn(w, h, |x, y| {
        let (x0, y0) = (x.saturating_sub(radius), y.saturating_sub(radius));
        let (x1, y1) = ((x + radius).min(w - 1), (y + radius).min(h - 1));
        let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64;
        let mean = sum_image_pixels(&integral, x0, y0, x1, y1)[0] as f64 / area;

        let v = img.get_pixel(x, y).0[0] as f64;
        if v > mean - offset as f64 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Crop to the bounding box of detected ink plus a margin, when that saves
/// at least a tenth of either side.
fn content_crop(img: &GrayImage) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }

    let level = otsu_level(img);
    let local = adaptive_binarize(img, 10, 10);

    let mut count = 0usize;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0u32, 0u32);
    for (x, y, p) in img.enumerate_pixels() {
        let ink = p.0[0] <= level || local.get_pixel(x, y).0[0] == 0;
        if ink {
            count += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }

    if count <= 50 {
        return img.clone();
    }

    let (bw, bh) = (max_x - min_x + 1, max_y - min_y + 1);
    let ratio = (bw * bh) as f64 / (w * h) as f64;
    if ratio <= 0.01 || bw <= 20 || bh <= 10 {
        return img.clone();
    }

    let margin_x = 15u32.max((bw as f64 * 0.15) as u32);
    let margin_y = 15u32.max((bh as f64 * 0.15) as u32);
    let x1 = min_x.saturating_sub(margin_x);
    let y1 = min_y.saturating_sub(margin_y);
    let x2 = (max_x + 1 + margin_x).min(w);
    let y2 = (max_y + 1 + margin_y).min(h);

    let (nw, nh) = (x2 - x1, y2 - y1);
    if (nw as f64) < w as f64 * 0.9 || (nh as f64) < h as f64 * 0.9 {
        image::imageops::crop_imm(img, x1, y1, nw, nh).to_image()
    } else {
        img.clone()
    }
}

/// Solid rectangular structuring element anchored at its center
fn rect_element(width: u32, height: u32) -> Mask {
    let element = GrayImage::from_pixel(width, height, Luma([FOREGROUND]));
    Mask::from_image(&element, (width / 2) as u8, (height / 2) as u8)
}

/// Clear vertical strokes at least `min_run` pixels tall
fn remove_vertical_lines(mask: &mut GrayImage, min_run: u32) {
    let length = min_run.min(MAX_ELEMENT_SIDE);
    let lines = grayscale_open(mask, &rect_element(1, length));
    for (p, line) in mask.pixels_mut().zip(lines.pixels()) {
        if line.0[0] == FOREGROUND {
            p.0[0] = BACKGROUND;
        }
    }
}

/// Remove connected components below `max(10, median * 0.2)` pixels
fn drop_small_components(mask: &GrayImage) -> (GrayImage, usize) {
    let labels = connected_components(mask, Connectivity::Eight, Luma([BACKGROUND]));

    let mut areas: Vec<usize> = Vec::new();
    for p in labels.pixels() {
        let label = p.0[0] as usize;
        if label == 0 {
            continue;
        }
        if areas.len() < label {
            areas.resize(label, 0);
        }
        areas[label - 1] += 1;
    }

    let mut nonzero: Vec<usize> = areas.iter().copied().filter(|&a| a > 0).collect();
    if nonzero.is_empty() {
        return (mask.clone(), 0);
    }
    nonzero.sort_unstable();
    let median = median_of_sorted(&nonzero);
    let min_size = MIN_COMPONENT_AREA.max(median * COMPONENT_MEDIAN_RATIO);

    let kept = nonzero.iter().filter(|&&a| a as f64 >= min_size).count();
    let (w, h) = mask.dimensions();
    let filtered = GrayImage::from_fn(w, h, |x, y| {
        let label = labels.get_pixel(x, y).0[0] as usize;
        let keep = label > 0 && areas[label - 1] as f64 >= min_size;
        Luma([if keep { FOREGROUND } else { BACKGROUND }])
    });

    (filtered, kept)
}

fn median_of_sorted(values: &[usize]) -> f64 {
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2] as f64
    } else {
        (values[n / 2 - 1] + values[n / 2]) as f64 / 2.0
    }
}

fn invert(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    image::imageops::invert(&mut out);
    out
}
