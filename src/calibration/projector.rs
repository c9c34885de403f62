//! Zone projection
//!
//! Frame-relative zone rectangles are mapped through the calibration frame
//! into the image, then into pixels of the image that is actually read. Box
//! frames crop the page once, so their zones end up in crop pixels. After
//! recognition every zone is mapped back to full-image relative coordinates
//! using the dimensions captured before cropping.

use image::imageops;
use image::GrayImage;
use tracing::{debug, info, warn};

use crate::calibration::{Calibration, CalibrationFrame};
use crate::error::{Error, Result};
use crate::geometry::{
    CropPixel, CropWindow, FrameRelative, ImageDims, ImagePixel, ImageRelative, PixelBounds, Point,
    Rect,
};
use crate::request::Zone;

/// The image zones are read from
pub enum Target<'a> {
    Full(&'a GrayImage),
    /// Physical crop to the calibration frame, owned for the duration of a run
    Cropped { image: GrayImage, window: CropWindow },
}

impl Target<'_> {
    pub fn image(&self) -> &GrayImage {
        match self {
            Target::Full(image) => image,
            Target::Cropped { image, .. } => image,
        }
    }

    pub fn window(&self) -> Option<&CropWindow> {
        match self {
            Target::Full(_) => None,
            Target::Cropped { window, .. } => Some(window),
        }
    }
}

/// A zone placed on the target image
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedZone {
    pub id: String,
    pub frame_rect: Rect<FrameRelative>,
    pub image_rect: Rect<ImageRelative>,
    pub pixel_rect: Rect<ImagePixel>,
    /// Set when the target is a crop
    pub crop_rect: Option<Rect<CropPixel>>,
    /// Integer box cut out of the target image
    pub bounds: PixelBounds,
}

/// Projects zones onto the target and back
pub struct ZoneProjector<'a> {
    frame: CalibrationFrame,
    full: ImageDims,
    target: Target<'a>,
}

impl<'a> ZoneProjector<'a> {
    /// Prepare the target, cropping when the frame is a box
    pub fn new(image: &'a GrayImage, calibration: &Calibration) -> Self {
        let full = ImageDims::new(image.width(), image.height());

        let target = match calibration.frame.frame_box() {
            Some(frame_box) => match crop_window(&frame_box, full) {
                Some(window) => {
                    let bounds = window.bounds();
                    info!(
                        "Cropping to frame: origin=({}, {}) size={}x{}",
                        bounds.x, bounds.y, bounds.width, bounds.height
                    );
                    let cropped =
                        imageops::crop_imm(image, bounds.x, bounds.y, bounds.width, bounds.height)
                            .to_image();
                    Target::Cropped {
                        image: cropped,
                        window,
                    }
                }
                None => {
                    warn!("Frame box {} leaves no pixels, reading the full image", frame_box);
                    Target::Full(image)
                }
            },
            None => Target::Full(image),
        };

        Self {
            frame: calibration.frame,
            full,
            target,
        }
    }

    pub fn target(&self) -> &Target<'a> {
        &self.target
    }

    /// Full-image dimensions captured before any crop
    pub fn full_dims(&self) -> ImageDims {
        self.full
    }

    /// Place one zone on the target
    pub fn project(&self, zone: &Zone) -> Result<ProjectedZone> {
        let frame_rect = zone.effective_coords();
        if frame_rect.is_degenerate() {
            return Err(Error::InvalidZoneGeometry {
                zone: zone.id.clone(),
                reason: format!("empty rectangle {}", frame_rect),
            });
        }

        let image_rect = self.frame.map_rect(&frame_rect);
        if image_rect.is_degenerate() {
            return Err(Error::InvalidZoneGeometry {
                zone: zone.id.clone(),
                reason: format!("empty after calibration {}", image_rect),
            });
        }

        let pixel_rect = image_rect.to_pixels(self.full);
        let (crop_rect, bounds) = match self.target.window() {
            Some(window) => {
                let crop_rect = pixel_rect.to_crop(window);
                (Some(crop_rect), PixelBounds::from_rect(&crop_rect, window.dims()))
            }
            None => (None, PixelBounds::from_rect(&pixel_rect, self.full)),
        };

        let bounds = bounds.ok_or_else(|| Error::InvalidZoneGeometry {
            zone: zone.id.clone(),
            reason: format!("outside the image {}", image_rect),
        })?;

        debug!("Zone '{}': {} -> {:?}", zone.id, image_rect, bounds);
        Ok(ProjectedZone {
            id: zone.id.clone(),
            frame_rect,
            image_rect,
            pixel_rect,
            crop_rect,
            bounds,
        })
    }

    /// Pixels of a projected zone
    pub fn crop_zone(&self, zone: &ProjectedZone) -> GrayImage {
        let b = zone.bounds;
        imageops::crop_imm(self.target.image(), b.x, b.y, b.width, b.height).to_image()
    }

    /// Map a projected zone back to full-image relative coordinates
    pub fn reproject(&self, zone: &ProjectedZone) -> Rect<ImageRelative> {
        match (zone.crop_rect, self.target.window()) {
            (Some(crop_rect), Some(window)) => crop_rect.to_image(window).to_relative(window.full),
            _ => zone.pixel_rect.to_relative(self.full),
        }
    }
}

/// Pixel crop of the frame box: origin truncated, far edge truncated after
/// adding the pixel extent, both clamped to the image
fn crop_window(frame_box: &Rect<ImageRelative>, full: ImageDims) -> Option<CropWindow> {
    let x_px = frame_box.x_min * full.width as f64;
    let y_px = frame_box.y_min * full.height as f64;
    let w_px = frame_box.width() * full.width as f64;
    let h_px = frame_box.height() * full.height as f64;
    if !(x_px.is_finite() && y_px.is_finite() && w_px.is_finite() && h_px.is_finite()) {
        return None;
    }

    let left = x_px.trunc() as i64;
    let top = y_px.trunc() as i64;
    let right = ((left as f64 + w_px).trunc() as i64).min(full.width as i64);
    let bottom = ((top as f64 + h_px).trunc() as i64).min(full.height as i64);
    let left = left.max(0);
    let top = top.max(0);

    if right <= left || bottom <= top {
        return None;
    }

    Some(CropWindow {
        origin: Point::new(left as f64, top as f64),
        width: (right - left) as u32,
        height: (bottom - top) as u32,
        full,
    })
}
