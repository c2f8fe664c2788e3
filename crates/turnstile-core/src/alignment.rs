//! Face alignment to the 112×112 ArcFace template.
//!
//! Fits a 4-DOF similarity transform (uniform scale, rotation, translation)
//! from detected landmarks to the reference landmarks, then resamples the
//! source image through its inverse with bilinear interpolation.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// `dst = [a -b; b a] * src + [tx; ty]`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit. With both point sets centred, the optimum has a
    /// closed form; the translation then maps centroid onto centroid.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for ((sx, sy), (dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        if norm <= f32::EPSILON {
            // Degenerate landmarks: translate only.
            return Self { a: 1.0, b: 0.0, tx: dmx - smx, ty: dmy - smy };
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Self {
        let det = self.a * self.a + self.b * self.b;
        let (a, b) = (self.a / det, -self.b / det);
        Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        }
    }
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let to_template = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS);
    let to_source = to_template.inverse();

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let (sx, sy) = to_source.apply((x as f32, y as f32));
        sample_bilinear(image, sx, sy)
    })
}

/// Bilinear sample; points outside the image read as black.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |cx: i64, cy: i64| -> [f32; 3] {
        if cx < 0 || cy < 0 || cx >= w || cy >= h {
            [0.0; 3]
        } else {
            let p = image.get_pixel(cx as u32, cy as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        }
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS);
        assert!((t.a - 1.0).abs() < 1e-5);
        assert!(t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_estimate_recovers_scale_and_shift() {
        let src: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS[i];
            (x * 2.0 + 10.0, y * 2.0 - 4.0)
        });
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS.iter()) {
            assert!(close(t.apply(*s), *d), "{:?} -> {:?}, want {:?}", s, t.apply(*s), d);
        }
    }

    #[test]
    fn test_estimate_recovers_rotation() {
        // Template rotated by -90° about the origin: (x, y) -> (y, -x)
        let src: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS[i];
            (y, -x)
        });
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS);
        assert!(t.a.abs() < 1e-4);
        assert!((t.b.abs() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -7.0 };
        let p = (33.0, 51.0);
        assert!(close(t.inverse().apply(t.apply(p)), p));
    }

    #[test]
    fn test_align_uniform_image_stays_uniform() {
        let image = RgbImage::from_pixel(400, 400, Rgb([10, 120, 240]));
        let landmarks: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS[i];
            (x + 100.0, y + 100.0)
        });
        let aligned = align_face(&image, &landmarks);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(*aligned.get_pixel(56, 56), Rgb([10, 120, 240]));
    }

    #[test]
    fn test_sample_outside_is_black() {
        let image = RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]));
        assert_eq!(sample_bilinear(&image, -10.0, -10.0), Rgb([0, 0, 0]));
    }
}
