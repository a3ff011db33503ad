//! Particle/solid constraint handling: stuck-particle repair, domain wall
//! clamping, solid shell repulsion, and the ray-cast collision pass.

use glam::Vec3;
use rayon::prelude::*;

use crate::particle::{Particle, ParticleKind};
use crate::particle_grid::ParticleGrid;
use crate::scene::{Ray, SceneProvider};

/// Reusable scratch for the constraint passes. Owned by the simulator so
/// the hot path stays allocation-free after warmup.
#[derive(Default)]
pub struct ConstraintBuffers {
    inside_flags: Vec<bool>,
    stuck: Vec<u32>,
    projected: Vec<Vec3>,
    repulsion: Vec<(Vec3, Vec3)>,
}

/// Eject fluid particles that ended up inside a solid.
///
/// The level-set projection gives the approximate escape point; a ray cast
/// from the embedded position along the outward direction finds the exact
/// surface, and the particle lands 5% past it with its velocity pointed
/// outward at the embedding depth.
pub fn repair_stuck_particles(
    particles: &mut [Particle],
    scene: &dyn SceneProvider,
    buffers: &mut ConstraintBuffers,
    max_dim: f32,
    frame: u32,
    overshoot: f32,
) {
    particles
        .par_iter()
        .map(|p| {
            p.is_fluid()
                && scene
                    .point_inside_solid(p.position * max_dim, frame)
                    .is_some()
        })
        .collect_into_vec(&mut buffers.inside_flags);

    buffers.stuck.clear();
    buffers.projected.clear();
    for (idx, &inside) in buffers.inside_flags.iter().enumerate() {
        if inside {
            buffers.stuck.push(idx as u32);
            buffers.projected.push(particles[idx].position);
        }
    }
    if buffers.stuck.is_empty() {
        return;
    }

    scene
        .solid_level_set()
        .project_points_to_surface(&mut buffers.projected, max_dim);

    for (&idx, &surface) in buffers.stuck.iter().zip(&buffers.projected) {
        let particle = &mut particles[idx as usize];
        let embedded = particle.position;
        let escape = surface - embedded;
        let depth = escape.length();
        if !escape.is_finite() || depth == 0.0 {
            continue;
        }
        let outward = escape / depth;

        let ray = Ray {
            origin: embedded * max_dim,
            direction: outward,
            frame,
        };
        let hit = scene.intersect_solids(&ray);
        particle.position = if hit.hit && hit.point.is_finite() {
            let hit_dist = (hit.point - ray.origin).length();
            (ray.origin + outward * (overshoot * hit_dist)) / max_dim
        } else {
            surface
        };
        particle.velocity = outward * depth;
    }
}

/// Project fluid particles into `[r, 1-r]^3` with `r` one cell width.
pub fn clamp_to_walls(particles: &mut [Particle], max_dim: f32) {
    let r = 1.0 / max_dim;
    let lo = Vec3::splat(r);
    let hi = Vec3::splat(1.0 - r);
    particles.par_iter_mut().for_each(|p| {
        if p.is_fluid() {
            p.position = p.position.clamp(lo, hi);
        }
    });
}

/// Push fluid particles away from nearby solid shell samples.
///
/// Two-phase: corrections are computed against the sorted state, then
/// applied, so workers never read a position another worker is moving.
/// Solid samples themselves are immovable.
pub fn apply_solid_repulsion(
    particles: &mut [Particle],
    pgrid: &ParticleGrid,
    buffers: &mut ConstraintBuffers,
    density: f32,
    max_dim: f32,
    radius_factor: f32,
) {
    let re = radius_factor * density / max_dim;

    particles
        .par_iter()
        .map(|p| {
            if !p.is_fluid() {
                return (p.position, p.velocity);
            }
            let mut position = p.position;
            let mut velocity = p.velocity;
            let cell = pgrid.cell_of(p.position, max_dim);
            for n in pgrid.cell_neighbors(cell, glam::IVec3::ONE) {
                let neighbor = &particles[n as usize];
                let ParticleKind::Solid { normal } = neighbor.kind else {
                    continue;
                };
                let dist = position.distance(neighbor.position);
                if dist >= re {
                    continue;
                }
                let push = if normal.length_squared() > 1.0e-14 && normal.is_finite() {
                    normal
                } else if dist > 0.0 {
                    (position - neighbor.position) / dist
                } else {
                    // Coincident sample: no direction to correct along.
                    continue;
                };
                position += (re - dist) * push;
                velocity -= velocity.dot(push) * push;
            }
            (position, velocity)
        })
        .collect_into_vec(&mut buffers.repulsion);

    particles
        .par_iter_mut()
        .zip(&buffers.repulsion)
        .for_each(|(p, &(position, velocity))| {
            p.position = position;
            p.velocity = velocity;
        });
}

/// Ray-cast each fluid particle's step displacement against the solids.
///
/// A hit closer than the displacement reflects the velocity about the hit
/// normal (preserving speed) and retracts the particle to 90% of the hit
/// distance. If the particle still sits inside a solid afterwards, the move
/// is rolled back along the reversed ray.
pub fn resolve_solid_collisions(
    particles: &mut [Particle],
    scene: &dyn SceneProvider,
    max_dim: f32,
    step_size: f32,
    frame: u32,
    retract: f32,
) {
    particles.par_iter_mut().for_each(|p| {
        if !p.is_fluid() {
            return;
        }
        let displacement = p.position - p.prev_position;
        let length = displacement.length();
        if !displacement.is_finite() || length == 0.0 {
            return;
        }
        let direction = displacement / length;
        let speed = p.prev_velocity.length();

        let ray = Ray {
            origin: p.prev_position * max_dim,
            direction,
            frame,
        };
        if !ray.is_valid() {
            return;
        }

        let hit = scene.intersect_solids(&ray);
        if hit.hit && hit.point.is_finite() && hit.normal.is_finite() {
            let solid_dist = (hit.point - ray.origin).length();
            let travel = length * max_dim;
            if solid_dist < travel {
                p.position = (ray.origin + direction * (retract * solid_dist)) / max_dim;
                let reflected = direction - 2.0 * direction.dot(hit.normal) * hit.normal;
                if reflected.length_squared() > 0.0 {
                    p.velocity = reflected.normalize() * speed;
                }
            }
        }

        if scene
            .point_inside_solid(p.position * max_dim, frame)
            .is_some()
        {
            p.velocity = -direction * speed;
            p.position = p.prev_position + p.velocity * step_size;
        }
    });
}
