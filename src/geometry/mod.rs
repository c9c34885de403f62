//! Coordinate spaces
//!
//! Every point and rectangle carries the space it lives in as a type parameter.
//! A value only changes space through one of the conversion methods below, so
//! frame-relative zone coordinates can never be mistaken for pixels (or the
//! reverse) by looking at their magnitude.
//!
//! Spaces:
//! - [`FrameRelative`]: 0-1 within the canonical document frame
//! - [`ImageRelative`]: 0-1 within the full photographed image
//! - [`ImagePixel`]: absolute pixels within the full image
//! - [`CropPixel`]: absolute pixels within a physically cropped sub-image

pub mod affine;

pub use affine::{Affine2, Similarity};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Marker trait implemented by the four coordinate space tags
pub trait CoordinateSpace: Copy + Default + PartialEq + fmt::Debug {
    /// Human-readable space name used in logs
    const NAME: &'static str;
}

/// 0-1 within the canonical template frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameRelative;

/// 0-1 within the full image
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImageRelative;

/// Absolute pixels within the full image
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImagePixel;

/// Absolute pixels within a cropped sub-image
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CropPixel;

impl CoordinateSpace for FrameRelative {
    const NAME: &'static str = "frame_relative";
}

impl CoordinateSpace for ImageRelative {
    const NAME: &'static str = "image_relative";
}

impl CoordinateSpace for ImagePixel {
    const NAME: &'static str = "image_pixel";
}

impl CoordinateSpace for CropPixel {
    const NAME: &'static str = "crop_pixel";
}

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

impl ImageDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of a decoded image
    pub fn of(image: &image::DynamicImage) -> Self {
        Self::new(image.width(), image.height())
    }

    fn w(&self) -> f64 {
        self.width as f64
    }

    fn h(&self) -> f64 {
        self.height as f64
    }
}

/// A point tagged with its coordinate space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point<S> {
    pub x: f64,
    pub y: f64,
    space: PhantomData<S>,
}

impl<S: CoordinateSpace> Point<S> {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            space: PhantomData,
        }
    }

    /// Euclidean distance to another point in the same space
    pub fn distance(&self, other: &Point<S>) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub(crate) fn retag<T: CoordinateSpace>(self) -> Point<T> {
        Point::new(self.x, self.y)
    }
}

impl Point<ImageRelative> {
    pub fn to_pixels(&self, dims: ImageDims) -> Point<ImagePixel> {
        Point::new(self.x * dims.w(), self.y * dims.h())
    }
}

impl Point<ImagePixel> {
    pub fn to_relative(&self, dims: ImageDims) -> Point<ImageRelative> {
        Point::new(ratio(self.x, dims.w()), ratio(self.y, dims.h()))
    }

    pub fn to_crop(&self, window: &CropWindow) -> Point<CropPixel> {
        Point::new(self.x - window.origin.x, self.y - window.origin.y)
    }
}

impl Point<CropPixel> {
    pub fn to_image(&self, window: &CropWindow) -> Point<ImagePixel> {
        Point::new(self.x + window.origin.x, self.y + window.origin.y)
    }
}

/// An axis-aligned rectangle tagged with its coordinate space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect<S> {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
    space: PhantomData<S>,
}

impl<S: CoordinateSpace> Rect<S> {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
            space: PhantomData,
        }
    }

    /// Build from top-left corner and size
    pub fn from_xywh(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    /// Bounding box of a set of points
    pub fn bounding(points: &[Point<S>]) -> Option<Self> {
        let first = points.first()?;
        let mut rect = Self::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            rect.x_min = rect.x_min.min(p.x);
            rect.y_min = rect.y_min.min(p.y);
            rect.x_max = rect.x_max.max(p.x);
            rect.y_max = rect.y_max.max(p.y);
        }
        Some(rect)
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn center(&self) -> Point<S> {
        Point::new(
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Corners in clockwise order starting at the top-left
    pub fn corners(&self) -> [Point<S>; 4] {
        [
            Point::new(self.x_min, self.y_min),
            Point::new(self.x_max, self.y_min),
            Point::new(self.x_max, self.y_max),
            Point::new(self.x_min, self.y_max),
        ]
    }

    /// Shift by an offset expressed in the same space
    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self::new(
            self.x_min + dx,
            self.y_min + dy,
            self.x_max + dx,
            self.y_max + dy,
        )
    }

    /// True when any coordinate is NaN/infinite or the rectangle has no area
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.x_min, self.y_min, self.x_max, self.y_max]
            .iter()
            .all(|v| v.is_finite());
        !finite || self.width() <= 0.0 || self.height() <= 0.0
    }

    pub(crate) fn retag<T: CoordinateSpace>(self) -> Rect<T> {
        Rect::new(self.x_min, self.y_min, self.x_max, self.y_max)
    }
}

impl Rect<ImageRelative> {
    /// Clamp every coordinate to [0, 1]
    pub fn clamp_unit(&self) -> Self {
        Self::new(
            self.x_min.clamp(0.0, 1.0),
            self.y_min.clamp(0.0, 1.0),
            self.x_max.clamp(0.0, 1.0),
            self.y_max.clamp(0.0, 1.0),
        )
    }

    pub fn to_pixels(&self, dims: ImageDims) -> Rect<ImagePixel> {
        Rect::new(
            self.x_min * dims.w(),
            self.y_min * dims.h(),
            self.x_max * dims.w(),
            self.y_max * dims.h(),
        )
    }
}

impl Rect<ImagePixel> {
    pub fn to_relative(&self, dims: ImageDims) -> Rect<ImageRelative> {
        Rect::new(
            ratio(self.x_min, dims.w()),
            ratio(self.y_min, dims.h()),
            ratio(self.x_max, dims.w()),
            ratio(self.y_max, dims.h()),
        )
    }

    pub fn to_crop(&self, window: &CropWindow) -> Rect<CropPixel> {
        self.translate(-window.origin.x, -window.origin.y).retag()
    }
}

impl Rect<CropPixel> {
    pub fn to_image(&self, window: &CropWindow) -> Rect<ImagePixel> {
        self.translate(window.origin.x, window.origin.y).retag()
    }
}

fn ratio(value: f64, extent: f64) -> f64 {
    if extent > 0.0 {
        value / extent
    } else {
        0.0
    }
}

/// Integer pixel box used to cut a sub-image out of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelBounds {
    /// Round a pixel rectangle outward-in (floor min, floor max) and clamp it to
    /// an image of `dims`. Returns `None` when nothing is left.
    pub fn from_rect<S: CoordinateSpace>(rect: &Rect<S>, dims: ImageDims) -> Option<Self> {
        if rect.is_degenerate() {
            return None;
        }

        let x1 = rect.x_min.floor().max(0.0).min(dims.w()) as u32;
        let y1 = rect.y_min.floor().max(0.0).min(dims.h()) as u32;
        let x2 = rect.x_max.floor().max(0.0).min(dims.w()) as u32;
        let y2 = rect.y_max.floor().max(0.0).min(dims.h()) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

/// A physical crop of the full image, expressed in full-image pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropWindow {
    /// Top-left corner of the crop in the full image
    pub origin: Point<ImagePixel>,
    pub width: u32,
    pub height: u32,
    /// Dimensions of the full image, captured before cropping
    pub full: ImageDims,
}

impl CropWindow {
    pub fn dims(&self) -> ImageDims {
        ImageDims::new(self.width, self.height)
    }

    pub fn bounds(&self) -> PixelBounds {
        PixelBounds {
            x: self.origin.x as u32,
            y: self.origin.y as u32,
            width: self.width,
            height: self.height,
        }
    }
}

impl<S: CoordinateSpace> Serialize for Rect<S> {
    fn serialize<Se: Serializer>(&self, serializer: Se) -> Result<Se::Ok, Se::Error> {
        [self.x_min, self.y_min, self.x_max, self.y_max].serialize(serializer)
    }
}

impl<'de, S: CoordinateSpace> Deserialize<'de> for Rect<S> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [x_min, y_min, x_max, y_max] = <[f64; 4]>::deserialize(deserializer)?;
        Ok(Self::new(x_min, y_min, x_max, y_max))
    }
}

impl<S: CoordinateSpace> Serialize for Point<S> {
    fn serialize<Se: Serializer>(&self, serializer: Se) -> Result<Se::Ok, Se::Error> {
        [self.x, self.y].serialize(serializer)
    }
}

impl<'de, S: CoordinateSpace> Deserialize<'de> for Point<S> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [x, y] = <[f64; 2]>::deserialize(deserializer)?;
        Ok(Self::new(x, y))
    }
}

impl<S: CoordinateSpace> fmt::Display for Rect<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.4}, {:.4}, {:.4}, {:.4}] ({})",
            self.x_min,
            self.y_min,
            self.x_max,
            self.y_max,
            S::NAME
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_relative_to_pixels() {
        let rect = Rect::<ImageRelative>::new(0.1, 0.2, 0.5, 0.6);
        let px = rect.to_pixels(ImageDims::new(1000, 500));
        assert!(approx(px.x_min, 100.0));
        assert!(approx(px.y_min, 100.0));
        assert!(approx(px.x_max, 500.0));
        assert!(approx(px.y_max, 300.0));
    }

    #[test]
    fn test_crop_roundtrip_restores_relative_rect() {
        let full = ImageDims::new(1280, 960);
        let window = CropWindow {
            origin: Point::new(137.0, 59.0),
            width: 900,
            height: 700,
            full,
        };

        let original = Rect::<ImageRelative>::new(0.23, 0.31, 0.58, 0.47);
        let in_crop = original.to_pixels(full).to_crop(&window);
        let back = in_crop.to_image(&window).to_relative(full);

        assert!(approx(back.x_min, original.x_min));
        assert!(approx(back.y_min, original.y_min));
        assert!(approx(back.x_max, original.x_max));
        assert!(approx(back.y_max, original.y_max));
    }

    #[test]
    fn test_point_crop_roundtrip() {
        let full = ImageDims::new(640, 480);
        let window = CropWindow {
            origin: Point::new(10.0, 20.0),
            width: 300,
            height: 200,
            full,
        };
        let p = Point::<ImageRelative>::new(0.4, 0.3);
        let back = p.to_pixels(full).to_crop(&window).to_image(&window).to_relative(full);
        assert!(approx(back.x, 0.4));
        assert!(approx(back.y, 0.3));
    }

    #[test]
    fn test_pixel_bounds_clamps_to_image() {
        let rect = Rect::<ImagePixel>::new(-5.0, 10.2, 120.7, 80.0);
        let bounds = PixelBounds::from_rect(&rect, ImageDims::new(100, 100)).unwrap();
        assert_eq!(bounds, PixelBounds { x: 0, y: 10, width: 100, height: 70 });
    }

    #[test]
    fn test_pixel_bounds_rejects_empty() {
        let rect = Rect::<ImagePixel>::new(150.0, 10.0, 180.0, 20.0);
        assert!(PixelBounds::from_rect(&rect, ImageDims::new(100, 100)).is_none());

        let nan = Rect::<ImagePixel>::new(f64::NAN, 0.0, 10.0, 10.0);
        assert!(PixelBounds::from_rect(&nan, ImageDims::new(100, 100)).is_none());
    }

    #[test]
    fn test_bounding_box_of_points() {
        let pts = [
            Point::<ImageRelative>::new(0.3, 0.1),
            Point::new(0.1, 0.4),
            Point::new(0.2, 0.2),
        ];
        let rect = Rect::bounding(&pts).unwrap();
        assert_eq!(rect, Rect::new(0.1, 0.1, 0.3, 0.4));
        assert!(Rect::<ImageRelative>::bounding(&[]).is_none());
    }

    #[test]
    fn test_rect_serializes_as_array() {
        let rect = Rect::<FrameRelative>::new(0.1, 0.2, 0.3, 0.4);
        let json = serde_json::to_string(&rect).unwrap();
        assert_eq!(json, "[0.1,0.2,0.3,0.4]");
        let parsed: Rect<FrameRelative> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rect);
    }
}
