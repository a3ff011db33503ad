//! Particle <-> MAC grid transfer operators.
//!
//! The splat is face-partitioned: every face is owned by exactly one worker
//! which pulls contributions from the particle buckets adjacent to it. No
//! shared accumulators, no atomics, and the result is deterministic for any
//! thread count.

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use crate::grid::{Grid3, MacGrid};
use crate::kernels::trilinear_hat;
use crate::particle::Particle;
use crate::particle_grid::ParticleGrid;

/// Face-center offsets of the three staggered grids, in cell units.
const U_X_OFFSET: Vec3 = Vec3::new(0.0, 0.5, 0.5);
const U_Y_OFFSET: Vec3 = Vec3::new(0.5, 0.0, 0.5);
const U_Z_OFFSET: Vec3 = Vec3::new(0.5, 0.5, 0.0);

/// Splat fluid particle velocities onto the MAC faces.
///
/// Each face receives the kernel-weighted average of the fluid particles
/// within one cell of it. Faces no particle reaches are left unchanged;
/// extrapolation fills those later.
pub fn splat_particles_to_grid(
    pgrid: &ParticleGrid,
    particles: &[Particle],
    mac: &mut MacGrid,
) {
    let max_dim = mac.max_dim();
    splat_component(&mut mac.u_x, U_X_OFFSET, 0, pgrid, particles, max_dim);
    splat_component(&mut mac.u_y, U_Y_OFFSET, 1, pgrid, particles, max_dim);
    splat_component(&mut mac.u_z, U_Z_OFFSET, 2, pgrid, particles, max_dim);
}

fn splat_component(
    faces: &mut Grid3<f32>,
    offset: Vec3,
    axis: usize,
    pgrid: &ParticleGrid,
    particles: &[Particle],
    max_dim: f32,
) {
    let dims = faces.dims();
    let slab = (dims.x * dims.y) as usize;
    // The face lattice extends one past the cell lattice along `axis`; the
    // adjacent-cell box must not extend with it.
    let mut axis_trim = IVec3::ZERO;
    axis_trim[axis] = 1;

    faces
        .as_mut_slice()
        .par_chunks_mut(slab)
        .enumerate()
        .for_each(|(k, plane)| {
            for j in 0..dims.y as usize {
                for i in 0..dims.x as usize {
                    let face = IVec3::new(i as i32, j as i32, k as i32);
                    let center = face.as_vec3() + offset;

                    let mut weight_sum = 0.0;
                    let mut velocity_sum = 0.0;
                    for p in
                        pgrid.particles_in_box(face - IVec3::ONE, face + IVec3::ONE - axis_trim)
                    {
                        let particle = &particles[p as usize];
                        if !particle.is_fluid() {
                            continue;
                        }
                        let w = trilinear_hat(particle.position * max_dim - center);
                        if w > 0.0 {
                            weight_sum += w;
                            velocity_sum += w * particle.velocity[axis];
                        }
                    }
                    if weight_sum > 0.0 {
                        plane[j * dims.x as usize + i] = velocity_sum / weight_sum;
                    }
                }
            }
        });
}

/// Trilinear sample of one staggered component at a normalized position.
fn sample_face_grid(faces: &Grid3<f32>, position: Vec3, offset: Vec3, max_dim: f32) -> f32 {
    let q = position * max_dim - offset;
    let base = q.floor();
    let frac = q - base;
    let (i0, j0, k0) = (base.x as i32, base.y as i32, base.z as i32);

    let mut value = 0.0;
    for dk in 0..2 {
        for dj in 0..2 {
            for di in 0..2 {
                let wx = if di == 0 { 1.0 - frac.x } else { frac.x };
                let wy = if dj == 0 { 1.0 - frac.y } else { frac.y };
                let wz = if dk == 0 { 1.0 - frac.z } else { frac.z };
                value += wx * wy * wz * faces.get(i0 + di, j0 + dj, k0 + dk);
            }
        }
    }
    value
}

/// Trilinear velocity at a normalized position, component-wise on faces.
pub fn interpolate_velocity(mac: &MacGrid, position: Vec3) -> Vec3 {
    let max_dim = mac.max_dim();
    Vec3::new(
        sample_face_grid(&mac.u_x, position, U_X_OFFSET, max_dim),
        sample_face_grid(&mac.u_y, position, U_Y_OFFSET, max_dim),
        sample_face_grid(&mac.u_z, position, U_Z_OFFSET, max_dim),
    )
}

/// Gather grid velocities back onto fluid particles, replacing their
/// velocities. The PIC/FLIP blend calls this once against the projected
/// grid and once against the delta grid.
pub fn gather_grid_to_particles(mac: &MacGrid, particles: &mut [Particle]) {
    particles.par_iter_mut().for_each(|particle| {
        if particle.is_fluid() {
            particle.velocity = interpolate_velocity(mac, particle.position);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;

    #[test]
    fn single_particle_round_trip() {
        let dims = UVec3::splat(8);
        let mut mac = MacGrid::new(dims);
        let mut pgrid = ParticleGrid::new(dims);
        let velocity = Vec3::new(0.3, -1.2, 0.7);
        let mut particles = vec![Particle::fluid(Vec3::new(0.44, 0.31, 0.57), velocity)];

        pgrid.sort(&particles, 8.0);
        splat_particles_to_grid(&pgrid, &particles, &mut mac);
        gather_grid_to_particles(&mac, &mut particles);

        let err = (particles[0].velocity - velocity).length();
        assert!(err < 1e-5, "round trip drifted by {err}");
    }

    #[test]
    fn splat_leaves_unreached_faces_alone() {
        let dims = UVec3::splat(8);
        let mut mac = MacGrid::new(dims);
        mac.u_x.fill(9.0);
        let mut pgrid = ParticleGrid::new(dims);
        let particles = vec![Particle::fluid(Vec3::splat(0.19), Vec3::X)];

        pgrid.sort(&particles, 8.0);
        splat_particles_to_grid(&pgrid, &particles, &mut mac);

        // A face far from the particle keeps its prior value.
        assert_eq!(mac.u_x.get(6, 6, 6), 9.0);
        // A face next to the particle does not.
        assert!((mac.u_x.get(1, 1, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn solid_particles_do_not_splat() {
        let dims = UVec3::splat(8);
        let mut mac = MacGrid::new(dims);
        let mut pgrid = ParticleGrid::new(dims);
        let mut solid = Particle::solid(Vec3::splat(0.44), Vec3::Y);
        solid.velocity = Vec3::splat(100.0);
        let particles = vec![solid];

        pgrid.sort(&particles, 8.0);
        splat_particles_to_grid(&pgrid, &particles, &mut mac);

        assert!(mac.u_x.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn uniform_field_interpolates_exactly() {
        let dims = UVec3::splat(8);
        let mut mac = MacGrid::new(dims);
        mac.u_x.fill(1.0);
        mac.u_y.fill(2.0);
        mac.u_z.fill(3.0);

        // Sample away from the boundary so every stencil face is in range.
        let v = interpolate_velocity(&mac, Vec3::new(0.5, 0.43, 0.61));
        assert!((v - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-6);
    }
}
