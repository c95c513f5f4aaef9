//! Random affine augmentation for training images.
//!
//! Works on channel-first `f32` buffers after resizing. Each call draws a
//! rotation, shift, shear and zoom, composes them around the image centre
//! and resamples bilinearly; coordinates that fall outside the source are
//! clamped to the nearest edge pixel.

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationConfig {
    /// Degrees, drawn uniformly from `[-range, range]`.
    pub rotation_range: f32,
    pub horizontal_flip: bool,
    /// Fraction of the image width.
    pub width_shift_range: f32,
    /// Fraction of the image height.
    pub height_shift_range: f32,
    /// Shear angle in degrees.
    pub shear_range: f32,
    /// Zoom factors are drawn from `[1 - zoom, 1 + zoom]` per axis.
    pub zoom_range: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 40.0,
            horizontal_flip: true,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
        }
    }
}

/// One concrete draw of the random transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub theta: f32,
    pub tx: f32,
    pub ty: f32,
    pub shear: f32,
    pub zx: f32,
    pub zy: f32,
    pub flip_horizontal: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            tx: 0.0,
            ty: 0.0,
            shear: 0.0,
            zx: 1.0,
            zy: 1.0,
            flip_horizontal: false,
        }
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

impl AugmentationConfig {
    /// A config that draws the identity transform every time.
    pub fn disabled() -> Self {
        Self {
            rotation_range: 0.0,
            horizontal_flip: false,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
        }
    }

    /// Draw transform parameters for an image of the given size.
    pub fn sample<R: Rng + ?Sized>(&self, height: usize, width: usize, rng: &mut R) -> AffineParams {
        let theta = symmetric(rng, self.rotation_range).to_radians();
        // shift ranges below 1 are fractions of the axis length
        let tx = symmetric(rng, self.height_shift_range) * height as f32;
        let ty = symmetric(rng, self.width_shift_range) * width as f32;
        let shear = symmetric(rng, self.shear_range).to_radians();
        let (zx, zy) = if self.zoom_range > 0.0 {
            let low = 1.0 - self.zoom_range;
            let high = 1.0 + self.zoom_range;
            (rng.gen_range(low..=high), rng.gen_range(low..=high))
        } else {
            (1.0, 1.0)
        };
        let flip_horizontal = self.horizontal_flip && rng.gen_bool(0.5);

        AffineParams {
            theta,
            tx,
            ty,
            shear,
            zx,
            zy,
            flip_horizontal,
        }
    }

    pub fn random_transform<R: Rng + ?Sized>(
        &self,
        pixels: &[f32],
        channels: usize,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> Vec<f32> {
        let params = self.sample(height, width, rng);
        apply_transform(pixels, channels, height, width, &params)
    }
}

type Mat3 = [[f32; 3]; 3];

fn matmul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Output-to-input mapping in (row, col) coordinates.
fn transform_matrix(params: &AffineParams, height: usize, width: usize) -> Mat3 {
    let (sin_t, cos_t) = params.theta.sin_cos();
    let rotation = [[cos_t, -sin_t, 0.0], [sin_t, cos_t, 0.0], [0.0, 0.0, 1.0]];
    let shift = [[1.0, 0.0, params.tx], [0.0, 1.0, params.ty], [0.0, 0.0, 1.0]];
    let (sin_s, cos_s) = params.shear.sin_cos();
    let shear = [[1.0, -sin_s, 0.0], [0.0, cos_s, 0.0], [0.0, 0.0, 1.0]];
    let zoom = [[params.zx, 0.0, 0.0], [0.0, params.zy, 0.0], [0.0, 0.0, 1.0]];

    let m = matmul(&matmul(&matmul(&rotation, &shift), &shear), &zoom);

    let oy = height as f32 / 2.0 - 0.5;
    let ox = width as f32 / 2.0 - 0.5;
    let offset = [[1.0, 0.0, oy], [0.0, 1.0, ox], [0.0, 0.0, 1.0]];
    let reset = [[1.0, 0.0, -oy], [0.0, 1.0, -ox], [0.0, 0.0, 1.0]];
    matmul(&matmul(&offset, &m), &reset)
}

fn sample_bilinear(plane: &[f32], height: usize, width: usize, row: f32, col: f32) -> f32 {
    let row = row.clamp(0.0, (height - 1) as f32);
    let col = col.clamp(0.0, (width - 1) as f32);
    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let dr = row - r0 as f32;
    let dc = col - c0 as f32;

    let top = plane[r0 * width + c0] * (1.0 - dc) + plane[r0 * width + c1] * dc;
    let bottom = plane[r1 * width + c0] * (1.0 - dc) + plane[r1 * width + c1] * dc;
    top * (1.0 - dr) + bottom * dr
}

/// Resample a CHW buffer through `params`.
pub fn apply_transform(
    pixels: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    params: &AffineParams,
) -> Vec<f32> {
    let plane_size = height * width;
    if plane_size == 0 {
        return pixels.to_vec();
    }
    let m = transform_matrix(params, height, width);
    let mut out = vec![0.0; channels * plane_size];

    for c in 0..channels {
        let plane = &pixels[c * plane_size..(c + 1) * plane_size];
        let target = &mut out[c * plane_size..(c + 1) * plane_size];
        for r in 0..height {
            for col in 0..width {
                let (rf, cf) = (r as f32, col as f32);
                let src_r = m[0][0] * rf + m[0][1] * cf + m[0][2];
                let src_c = m[1][0] * rf + m[1][1] * cf + m[1][2];
                let dst_col = if params.flip_horizontal { width - 1 - col } else { col };
                target[r * width + dst_col] = sample_bilinear(plane, height, width, src_r, src_c);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn gradient(channels: usize, height: usize, width: usize) -> Vec<f32> {
        (0..channels * height * width).map(|i| i as f32 / 100.0).collect()
    }

    #[test]
    fn identity_leaves_pixels_untouched() {
        let pixels = gradient(3, 6, 5);
        let out = apply_transform(&pixels, 3, 6, 5, &AffineParams::identity());
        assert_eq!(out, pixels);

        let mut rng = StdRng::seed_from_u64(7);
        let out = AugmentationConfig::disabled().random_transform(&pixels, 3, 6, 5, &mut rng);
        assert_eq!(out, pixels);
    }

    #[test]
    fn random_transform_preserves_dimensions() {
        let pixels = gradient(3, 16, 12);
        let mut rng = StdRng::seed_from_u64(42);
        let config = AugmentationConfig::default();
        for _ in 0..10 {
            let out = config.random_transform(&pixels, 3, 16, 12, &mut rng);
            assert_eq!(out.len(), pixels.len());
        }
    }

    #[test]
    fn flip_mirrors_columns() {
        let pixels = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let params = AffineParams {
            flip_horizontal: true,
            ..AffineParams::identity()
        };
        let out = apply_transform(&pixels, 1, 2, 3, &params);
        assert_eq!(out, vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]);
    }

    #[test]
    fn shifted_out_pixels_take_nearest_edge() {
        let pixels = vec![1.0, 2.0, 3.0, 4.0];
        let params = AffineParams {
            ty: 10.0,
            ..AffineParams::identity()
        };
        let out = apply_transform(&pixels, 1, 1, 4, &params);
        assert_eq!(out, vec![4.0; 4]);
    }

    #[test]
    fn sampled_params_stay_in_range() {
        let config = AugmentationConfig::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let p = config.sample(100, 80, &mut rng);
            assert!(p.theta.abs() <= 40f32.to_radians() + 1e-6);
            assert!(p.tx.abs() <= 20.0 + 1e-4);
            assert!(p.ty.abs() <= 16.0 + 1e-4);
            assert!((0.8..=1.2).contains(&p.zx));
            assert!((0.8..=1.2).contains(&p.zy));
        }
    }
}
