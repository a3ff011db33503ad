//! Particle reseeding and thinning.
//!
//! After advection some cells starve and some crowd. Starved bulk-liquid
//! cells get fresh particles at jittered positions with grid-sampled
//! velocities; crowded cells drop their oldest samples. Both directions are
//! capped per step so the fluid mass never jumps by more than the budget
//! fraction.

use glam::Vec3;
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::grid::{CellType, MacGrid};
use crate::params::FlipParams;
use crate::particle::Particle;
use crate::particle_grid::ParticleGrid;
use crate::transfer::interpolate_velocity;

#[derive(Clone, Copy, Debug, Default)]
pub struct ResampleStats {
    pub created: usize,
    pub deleted: usize,
    pub culled: usize,
}

/// Reseeding pass with reusable scratch.
#[derive(Default)]
pub struct Resampler {
    delete_flags: Vec<bool>,
}

impl Resampler {
    /// Cull non-finite particles, then rebalance per-cell fluid counts.
    /// Re-sorts `pgrid` so the counts reflect post-constraint positions.
    pub fn resample(
        &mut self,
        particles: &mut Vec<Particle>,
        pgrid: &mut ParticleGrid,
        mac: &MacGrid,
        params: &FlipParams,
        density: f32,
        frame: u32,
    ) -> ResampleStats {
        let mut stats = ResampleStats::default();
        let before = particles.len();
        particles.retain(|p| p.position.is_finite() && p.velocity.is_finite());
        stats.culled = before - particles.len();
        if stats.culled > 0 {
            warn!("removed {} non-finite particles", stats.culled);
        }

        let max_dim = mac.max_dim();
        let h = 1.0 / max_dim;
        pgrid.sort(particles, max_dim);

        let start_count = particles.len();
        let budget = (params.mass_budget * start_count as f32) as usize;
        let mut rng = StdRng::seed_from_u64(frame as u64);

        self.delete_flags.clear();
        self.delete_flags.resize(start_count, false);

        let dims = mac.dims;
        let mut spawned: Vec<Particle> = Vec::new();
        for k in 1..dims.z as i32 - 1 {
            for j in 1..dims.y as i32 - 1 {
                for i in 1..dims.x as i32 - 1 {
                    if mac.cell_type.get(i, j, k) != CellType::Fluid {
                        continue;
                    }
                    let bucket = pgrid.bucket(i, j, k);
                    let fluid_count = bucket
                        .iter()
                        .filter(|&&p| particles[p as usize].is_fluid())
                        .count();

                    if fluid_count > params.resample_max {
                        // Drop the oldest fluid samples down to the cap.
                        let mut excess = fluid_count - params.resample_max;
                        for &p in bucket {
                            if excess == 0 || stats.deleted >= budget {
                                break;
                            }
                            let idx = p as usize;
                            if particles[idx].is_fluid() && !self.delete_flags[idx] {
                                self.delete_flags[idx] = true;
                                stats.deleted += 1;
                                excess -= 1;
                            }
                        }
                    } else if fluid_count < params.resample_min {
                        if !self.should_reseed(particles, bucket, mac, i, j, k, params, density) {
                            continue;
                        }
                        let missing = params.resample_min - fluid_count;
                        for _ in 0..missing {
                            if stats.created >= budget {
                                break;
                            }
                            let jitter =
                                Vec3::new(rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>());
                            let position =
                                (Vec3::new(i as f32, j as f32, k as f32) + jitter) * h;
                            let velocity = interpolate_velocity(mac, position);
                            spawned.push(Particle::fluid(position, velocity));
                            stats.created += 1;
                        }
                    }
                }
            }
        }

        if stats.deleted > 0 {
            let flags = &self.delete_flags;
            let mut idx = 0;
            particles.retain(|_| {
                let keep = !flags[idx];
                idx += 1;
                keep
            });
        }
        particles.append(&mut spawned);
        if stats.deleted > 0 || stats.created > 0 || stats.culled > 0 {
            pgrid.sort(particles, max_dim);
        }
        stats
    }

    /// Only reseed genuine bulk liquid: the cell must sit below the
    /// reconstructed surface, and a populated cell must not look like
    /// spray.
    #[allow(clippy::too_many_arguments)]
    fn should_reseed(
        &self,
        particles: &[Particle],
        bucket: &[u32],
        mac: &MacGrid,
        i: i32,
        j: i32,
        k: i32,
        params: &FlipParams,
        density: f32,
    ) -> bool {
        let level = mac.liquid_sdf.get(i, j, k);
        let mut count = 0usize;
        let mut density_sum = 0.0f32;
        for &p in bucket {
            let particle = &particles[p as usize];
            if particle.is_fluid() {
                count += 1;
                density_sum += particle.density;
            }
        }
        if count == 0 {
            // An empty cell must be clearly interior before we invent mass.
            return level < -(density / mac.max_dim());
        }
        level < 0.0 && density_sum / count as f32 >= params.density_threshold
    }
}
