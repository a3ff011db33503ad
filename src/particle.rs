//! Particle representation for the FLIP solver.

use glam::Vec3;

/// What a particle samples.
///
/// Solid particles are thin-shell surface samples of obstacles. They never
/// move, but they push nearby fluid particles out along their stored
/// surface normal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParticleKind {
    Fluid,
    Solid {
        /// Outward surface normal at the sample point.
        normal: Vec3,
    },
}

/// One velocity sample point.
///
/// Positions are normalized to the `[0,1]^3` domain. `prev_position` and
/// `prev_velocity` are the step-start snapshot used by the collision pass;
/// `scratch_velocity` is working space for the PIC/FLIP blend.
#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub position: Vec3,
    pub prev_position: Vec3,
    pub velocity: Vec3,
    pub prev_velocity: Vec3,
    pub scratch_velocity: Vec3,
    pub mass: f32,
    pub density: f32,
    pub kind: ParticleKind,
}

impl Particle {
    /// A fluid particle with unit mass.
    pub fn fluid(position: Vec3, velocity: Vec3) -> Self {
        Self {
            position,
            prev_position: position,
            velocity,
            prev_velocity: velocity,
            scratch_velocity: Vec3::ZERO,
            mass: 1.0,
            density: 0.0,
            kind: ParticleKind::Fluid,
        }
    }

    /// An immovable solid shell sample with an outward normal.
    pub fn solid(position: Vec3, normal: Vec3) -> Self {
        Self {
            position,
            prev_position: position,
            velocity: Vec3::ZERO,
            prev_velocity: Vec3::ZERO,
            scratch_velocity: Vec3::ZERO,
            mass: 1.0,
            density: 1.0,
            kind: ParticleKind::Solid { normal },
        }
    }

    #[inline]
    pub fn is_fluid(&self) -> bool {
        matches!(self.kind, ParticleKind::Fluid)
    }

    /// Surface normal for solid samples, `None` for fluid.
    #[inline]
    pub fn solid_normal(&self) -> Option<Vec3> {
        match self.kind {
            ParticleKind::Solid { normal } => Some(normal),
            ParticleKind::Fluid => None,
        }
    }

    /// Record the step-start state.
    #[inline]
    pub fn snapshot(&mut self) {
        self.prev_position = self.position;
        self.prev_velocity = self.velocity;
    }
}
