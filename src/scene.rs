//! Interfaces to the world outside the core solver.
//!
//! The solver never owns geometry. Obstacles, emission, forces, and export
//! sinks all live behind these traits; the simulator holds a non-owning
//! handle and the scene outlives it by contract.
//!
//! Geometry queries use scaled coordinates (positions multiplied by
//! `max_dim`, i.e. cell units), matching the level-set sampling they wrap.

use glam::{UVec3, Vec3};

use crate::particle::Particle;
use crate::particle_grid::ParticleGrid;

/// A ray in scaled (cell-unit) coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub frame: u32,
}

impl Ray {
    /// Degenerate rays (zero or non-finite direction) must be skipped by
    /// callers rather than handed to the scene.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.origin.is_finite()
            && self.direction.is_finite()
            && self.direction.length_squared() > 0.0
    }
}

/// Result of a solid-geometry ray cast.
#[derive(Clone, Copy, Debug)]
pub struct Intersection {
    pub hit: bool,
    pub point: Vec3,
    pub normal: Vec3,
}

impl Intersection {
    pub const MISS: Self = Self {
        hit: false,
        point: Vec3::ZERO,
        normal: Vec3::ZERO,
    };
}

/// Read access to a signed-distance field stored on the cell lattice.
///
/// `Sync` because cell classification queries it from worker threads.
pub trait LevelSetSource: Sync {
    /// Signed distance at cell `(i, j, k)`; out-of-range reads return a
    /// large positive value.
    fn cell(&self, i: i32, j: i32, k: i32) -> f32;

    /// Move each normalized point to the nearest surface point, scaling by
    /// `max_dim` internally as needed.
    fn project_points_to_surface(&self, points: &mut [Vec3], max_dim: f32);
}

/// Everything the solver needs from the scene.
///
/// `Sync` because particle-parallel phases issue point and ray queries from
/// worker threads.
pub trait SceneProvider: Sync {
    /// Append newly emitted particles for `frame`. The scene sets their
    /// positions, velocities, masses, and kinds.
    fn generate_particles(
        &mut self,
        particles: &mut Vec<Particle>,
        dims: UVec3,
        density: f32,
        pgrid: &ParticleGrid,
        frame: u32,
    );

    /// Refresh the solid level-set for `frame` (animated obstacles).
    fn build_solid_level_set(&mut self, frame: u32);

    fn solid_level_set(&self) -> &dyn LevelSetSource;

    fn liquid_level_set(&self) -> &dyn LevelSetSource;

    /// Nearest solid intersection along `ray`, if any.
    fn intersect_solids(&self, ray: &Ray) -> Intersection;

    /// Id of the solid containing `point` (scaled coordinates), if any.
    fn point_inside_solid(&self, point: Vec3, frame: u32) -> Option<u32>;

    /// Body forces summed into every fluid particle each step.
    fn external_forces(&self) -> &[Vec3];
}

/// Opaque particle sink. Formats and destinations are the host's business.
pub trait Exporter {
    fn export_particles(
        &mut self,
        particles: &[Particle],
        max_dim: f32,
        frame: u32,
        vdb: bool,
        obj: bool,
        partio: bool,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_rays_rejected() {
        let zero = Ray {
            origin: Vec3::ZERO,
            direction: Vec3::ZERO,
            frame: 0,
        };
        assert!(!zero.is_valid());

        let nan = Ray {
            origin: Vec3::ZERO,
            direction: Vec3::new(f32::NAN, 0.0, 0.0),
            frame: 0,
        };
        assert!(!nan.is_valid());

        let ok = Ray {
            origin: Vec3::ZERO,
            direction: Vec3::X,
            frame: 0,
        };
        assert!(ok.is_valid());
    }
}
