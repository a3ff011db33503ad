//! Smoothing kernels shared by the transfer, density, and level-set passes.

use glam::Vec3;

/// 1D hat (tent) weight with unit support.
#[inline]
pub fn hat(t: f32) -> f32 {
    (1.0 - t.abs()).max(0.0)
}

/// Trilinear hat weight for an offset expressed in cell units.
///
/// Support is one cell along each axis; weights over the surrounding face
/// stencil sum to one, which is what makes a lone particle's splat/gather
/// round trip exact.
#[inline]
pub fn trilinear_hat(offset: Vec3) -> f32 {
    hat(offset.x) * hat(offset.y) * hat(offset.z)
}

/// Smooth compactly supported kernel over squared distance.
///
/// `(1 - r^2/h^2)^3` inside the support radius `h`, zero outside. Used for
/// the particle density estimate and the Zhu-Bridson surface
/// reconstruction weights.
#[inline]
pub fn smooth(r2: f32, h: f32) -> f32 {
    let q = 1.0 - r2 / (h * h);
    if q > 0.0 {
        q * q * q
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hat_partition_of_unity() {
        for frac in [0.0, 0.25, 0.5, 0.9] {
            let sum = hat(frac) + hat(frac - 1.0);
            assert!((sum - 1.0).abs() < 1e-6, "frac {frac}: sum {sum}");
        }
    }

    #[test]
    fn trilinear_hat_sums_to_one() {
        let frac = Vec3::new(0.3, 0.6, 0.9);
        let mut sum = 0.0;
        for dk in 0..2 {
            for dj in 0..2 {
                for di in 0..2 {
                    let node = Vec3::new(di as f32, dj as f32, dk as f32);
                    sum += trilinear_hat(frac - node);
                }
            }
        }
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn smooth_compact_support() {
        assert!(smooth(0.0, 0.5) > 0.99);
        assert_eq!(smooth(0.26, 0.5), 0.0);
        assert!(smooth(0.24 * 0.24, 0.5) > 0.0);
    }

    #[test]
    fn smooth_monotone_in_distance() {
        let h = 0.2;
        let mut last = f32::INFINITY;
        for step in 0..10 {
            let r = step as f32 * h / 10.0;
            let w = smooth(r * r, h);
            assert!(w <= last);
            last = w;
        }
    }
}
