//! Affine maps from the canonical frame into the photographed image

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::{FrameRelative, ImageRelative, Point, Rect};

/// Base vectors shorter than this are treated as zero
const MIN_BASE_LENGTH: f64 = 1e-12;

/// Normal matrices with a smaller determinant are treated as singular
const MIN_DETERMINANT: f64 = 1e-12;

/// A 2x3 affine matrix mapping `FrameRelative` points to `ImageRelative` points
///
/// ```text
/// | a  b  tx |   | x |
/// | c  d  ty | * | y |
///                | 1 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine2 {
    pub matrix: [[f64; 3]; 2],
}

/// Parameters of a two-point similarity fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub scale: f64,
    /// Rotation in radians
    pub rotation: f64,
    pub translation: (f64, f64),
    pub transform: Affine2,
}

impl Affine2 {
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        }
    }

    /// Map a frame point into the image
    pub fn apply(&self, p: &Point<FrameRelative>) -> Point<ImageRelative> {
        let m = &self.matrix;
        Point::new(
            m[0][0] * p.x + m[0][1] * p.y + m[0][2],
            m[1][0] * p.x + m[1][1] * p.y + m[1][2],
        )
    }

    /// Transform all four corners and return their bounding box clamped to [0, 1]
    pub fn apply_rect(&self, rect: &Rect<FrameRelative>) -> Rect<ImageRelative> {
        let corners = rect.corners().map(|c| self.apply(&c));
        // Four corners are always present
        let bbox = Rect::bounding(&corners).unwrap_or_else(|| Rect::new(0.0, 0.0, 0.0, 0.0));
        bbox.clamp_unit()
    }

    /// Similarity transform (rotation, uniform scale, translation) from two
    /// point correspondences. The first base point maps exactly onto the first
    /// detected point.
    pub fn similarity(
        base: [Point<FrameRelative>; 2],
        detected: [Point<ImageRelative>; 2],
    ) -> Similarity {
        let (bx, by) = (base[1].x - base[0].x, base[1].y - base[0].y);
        let (dx, dy) = (detected[1].x - detected[0].x, detected[1].y - detected[0].y);

        let base_len = (bx * bx + by * by).sqrt();
        let det_len = (dx * dx + dy * dy).sqrt();

        let scale = if base_len > MIN_BASE_LENGTH {
            det_len / base_len
        } else {
            1.0
        };
        let rotation = dy.atan2(dx) - by.atan2(bx);

        let a = scale * rotation.cos();
        let c = scale * rotation.sin();

        let tx = detected[0].x - (a * base[0].x - c * base[0].y);
        let ty = detected[0].y - (c * base[0].x + a * base[0].y);

        Similarity {
            scale,
            rotation,
            translation: (tx, ty),
            transform: Self {
                matrix: [[a, -c, tx], [c, a, ty]],
            },
        }
    }

    /// Least-squares affine fit over three or more correspondences.
    ///
    /// Solves the normal equations for each output row with one LU
    /// factorization. Returns `None` when fewer than three pairs are given or
    /// the base points are collinear.
    pub fn least_squares(pairs: &[(Point<FrameRelative>, Point<ImageRelative>)]) -> Option<Self> {
        if pairs.len() < 3 {
            return None;
        }

        // A^T A where each row of A is [x, y, 1]
        let mut ata = Matrix3::<f64>::zeros();
        let mut atu = Vector3::<f64>::zeros();
        let mut atv = Vector3::<f64>::zeros();

        for (b, d) in pairs {
            let row = Vector3::new(b.x, b.y, 1.0);
            ata += row * row.transpose();
            atu += row * d.x;
            atv += row * d.y;
        }

        // Collinear bases leave A^T A singular
        if ata.determinant().abs() < MIN_DETERMINANT {
            return None;
        }

        let lu = ata.lu();
        let top = lu.solve(&atu)?;
        let bottom = lu.solve(&atv)?;

        Some(Self {
            matrix: [[top[0], top[1], top[2]], [bottom[0], bottom[1], bottom[2]]],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_two_point_similarity() {
        let sim = Affine2::similarity(
            [Point::new(0.0, 0.0), Point::new(1.0, 0.0)],
            [Point::new(0.1, 0.1), Point::new(0.9, 0.1)],
        );

        assert!(approx(sim.scale, 0.8));
        assert!(approx(sim.rotation, 0.0));
        assert!(approx(sim.translation.0, 0.1));
        assert!(approx(sim.translation.1, 0.1));

        let mapped = sim.transform.apply(&Point::new(1.0, 0.0));
        assert!(approx(mapped.x, 0.9));
        assert!(approx(mapped.y, 0.1));
    }

    #[test]
    fn test_similarity_with_rotation() {
        // Quarter turn: base points along x, detected along y
        let sim = Affine2::similarity(
            [Point::new(0.0, 0.0), Point::new(0.5, 0.0)],
            [Point::new(0.5, 0.2), Point::new(0.5, 0.7)],
        );
        assert!(approx(sim.scale, 1.0));
        assert!(approx(sim.rotation, std::f64::consts::FRAC_PI_2));

        let mapped = sim.transform.apply(&Point::new(0.5, 0.0));
        assert!(approx(mapped.x, 0.5));
        assert!(approx(mapped.y, 0.7));
    }

    #[test]
    fn test_zero_base_vector_keeps_unit_scale() {
        let sim = Affine2::similarity(
            [Point::new(0.3, 0.3), Point::new(0.3, 0.3)],
            [Point::new(0.1, 0.2), Point::new(0.4, 0.2)],
        );
        assert!(approx(sim.scale, 1.0));
    }

    #[test]
    fn test_least_squares_recovers_exact_affine() {
        let truth = Affine2 {
            matrix: [[0.9, 0.05, 0.02], [-0.03, 0.85, 0.07]],
        };
        let bases = [
            Point::new(0.5, 0.0),
            Point::new(1.0, 0.5),
            Point::new(0.0, 0.5),
            Point::new(0.5, 1.0),
        ];
        let pairs: Vec<_> = bases.iter().map(|b| (*b, truth.apply(b))).collect();

        let fit = Affine2::least_squares(&pairs).unwrap();
        for r in 0..2 {
            for c in 0..3 {
                assert!((fit.matrix[r][c] - truth.matrix[r][c]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_least_squares_cancels_balanced_residuals() {
        // Residuals +e/-e on the corners are orthogonal to [x, y, 1]
        let e = 0.01;
        let pairs: Vec<_> = [(0.0, 0.0, e), (1.0, 0.0, -e), (0.0, 1.0, -e), (1.0, 1.0, e)]
            .iter()
            .map(|&(x, y, noise)| (Point::new(x, y), Point::new(0.5 * x + 0.1 + noise, 0.5 * y + 0.2)))
            .collect();

        let fit = Affine2::least_squares(&pairs).unwrap();
        let expected = [[0.5, 0.0, 0.1], [0.0, 0.5, 0.2]];
        for r in 0..2 {
            for c in 0..3 {
                assert!((fit.matrix[r][c] - expected[r][c]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_least_squares_rejects_duplicate_bases() {
        let pairs = vec![
            (Point::new(0.2, 0.2), Point::new(0.1, 0.1)),
            (Point::new(0.2, 0.2), Point::new(0.3, 0.1)),
            (Point::new(0.2, 0.2), Point::new(0.1, 0.4)),
        ];
        assert!(Affine2::least_squares(&pairs).is_none());
    }

    #[test]
    fn test_least_squares_rejects_collinear_points() {
        let pairs = vec![
            (Point::new(0.0, 0.0), Point::new(0.0, 0.0)),
            (Point::new(0.5, 0.0), Point::new(0.5, 0.0)),
            (Point::new(1.0, 0.0), Point::new(1.0, 0.0)),
        ];
        assert!(Affine2::least_squares(&pairs).is_none());
        assert!(Affine2::least_squares(&pairs[..2]).is_none());
    }

    #[test]
    fn test_apply_rect_takes_bounding_box_and_clamps() {
        let sim = Affine2::similarity(
            [Point::new(0.0, 0.0), Point::new(1.0, 0.0)],
            [Point::new(0.1, 0.1), Point::new(0.9, 0.1)],
        );
        let rect = sim.transform.apply_rect(&Rect::new(0.0, 0.0, 0.5, 0.5));
        assert!(approx(rect.x_min, 0.1));
        assert!(approx(rect.y_min, 0.1));
        assert!(approx(rect.x_max, 0.5));
        assert!(approx(rect.y_max, 0.5));

        let out = Affine2 {
            matrix: [[1.0, 0.0, 0.8], [0.0, 1.0, -0.2]],
        }
        .apply_rect(&Rect::new(0.0, 0.0, 0.5, 0.5));
        assert!(approx(out.x_max, 1.0));
        assert!(approx(out.y_min, 0.0));
    }
}
