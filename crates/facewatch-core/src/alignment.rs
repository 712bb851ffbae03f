//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference layout
//! and resamples an RGB crop of 112×112 for ArcFace.

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit from `src` to `dst` (closed form on centred points).
    ///
    /// Degenerate input (all source points coincide) yields the identity.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let mut spread = 0.0f32;
        let mut cos_term = 0.0f32;
        let mut sin_term = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - smx, s.1 - smy);
            let (dx, dy) = (d.0 - dmx, d.1 - dmy);
            spread += sx * sx + sy * sy;
            cos_term += sx * dx + sy * dy;
            sin_term += sx * dy - sy * dx;
        }

        if spread < 1e-12 {
            return Self::identity();
        }

        let a = cos_term / spread;
        let b = sin_term / spread;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn identity() -> Self {
        Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 }
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse transform, or `None` for a zero-scale transform.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        // Inverse rotation/scale applied to the negated translation.
        let tx = -(ia * self.tx - ib * self.ty);
        let ty = -(ib * self.tx + ia * self.ty);
        Some(Self { a: ia, b: ib, tx, ty })
    }
}

/// Resample an `out_size`×`out_size` RGB crop from a packed RGB24 frame.
///
/// Each output pixel is mapped back through the inverse of `transform` and
/// bilinearly sampled; pixels that fall outside the frame are black.
pub fn warp_rgb(
    rgb: &[u8],
    width: usize,
    height: usize,
    transform: &SimilarityTransform,
    out_size: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; out_size * out_size * 3];
    let Some(inv) = transform.inverse() else {
        return out;
    };

    let texel = |x: i32, y: i32, c: usize| -> f32 {
        if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
            return 0.0;
        }
        rgb.get((y as usize * width + x as usize) * 3 + c)
            .copied()
            .unwrap_or(0) as f32
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = inv.apply((ox as f32, oy as f32));
            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let base = (oy * out_size + ox) * 3;
            for c in 0..3 {
                let top = texel(x0, y0, c) * (1.0 - fx) + texel(x0 + 1, y0, c) * fx;
                let bottom = texel(x0, y0 + 1, c) * (1.0 - fx) + texel(x0 + 1, y0 + 1, c) * fx;
                let value = top * (1.0 - fy) + bottom * fy;
                out[base + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Align a detected face to the canonical 112×112 ArcFace crop (RGB24).
pub fn align_face(rgb: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    warp_rgb(rgb, width as usize, height as usize, &transform, ALIGNED_SIZE)
}
