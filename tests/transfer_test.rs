//! Transfer operator tests across the particle/grid boundary.

use flip3d::particle::Particle;
use flip3d::transfer::{
    gather_grid_to_particles, interpolate_velocity, splat_particles_to_grid,
};
use flip3d::{MacGrid, ParticleGrid, UVec3, Vec3};

#[test]
fn uniform_block_round_trips_exactly() {
    let dims = UVec3::splat(16);
    let mut mac = MacGrid::new(dims);
    let mut pgrid = ParticleGrid::new(dims);
    let velocity = Vec3::new(1.5, -0.25, 0.75);

    // A block of particles all moving together.
    let mut particles = Vec::new();
    let spacing = 0.5 / 16.0;
    for i in 0..8 {
        for j in 0..8 {
            for k in 0..8 {
                let p = Vec3::new(
                    0.3 + i as f32 * spacing,
                    0.3 + j as f32 * spacing,
                    0.3 + k as f32 * spacing,
                );
                particles.push(Particle::fluid(p, velocity));
            }
        }
    }

    pgrid.sort(&particles, 16.0);
    splat_particles_to_grid(&pgrid, &particles, &mut mac);
    gather_grid_to_particles(&mac, &mut particles);

    for p in &particles {
        let err = (p.velocity - velocity).length();
        assert!(err < 1.0e-5, "uniform field must survive the round trip");
    }
}

#[test]
fn splat_is_a_weighted_average_not_a_sum() {
    let dims = UVec3::splat(8);
    let mut mac = MacGrid::new(dims);
    let mut pgrid = ParticleGrid::new(dims);

    // Two coincident particles with the same velocity: the face value must
    // be that velocity, not twice it.
    let particles = vec![
        Particle::fluid(Vec3::splat(0.4), Vec3::X * 2.0),
        Particle::fluid(Vec3::splat(0.4), Vec3::X * 2.0),
    ];
    pgrid.sort(&particles, 8.0);
    splat_particles_to_grid(&pgrid, &particles, &mut mac);

    let v = interpolate_velocity(&mac, Vec3::splat(0.4));
    assert!((v.x - 2.0).abs() < 1.0e-5, "got {v}");
}

#[test]
fn gather_interpolates_linear_field_exactly() {
    // Trilinear sampling reproduces fields linear in each coordinate.
    let dims = UVec3::splat(8);
    let mut mac = MacGrid::new(dims);
    for k in 0..8 {
        for j in 0..8 {
            for i in 0..9 {
                mac.u_x.set(i, j, k, i as f32);
            }
        }
    }

    let v = interpolate_velocity(&mac, Vec3::new(0.44, 0.5, 0.5));
    // u_x faces sit at x = i/8; position 0.44 -> face coordinate 3.52.
    assert!((v.x - 3.52).abs() < 1.0e-5, "got {}", v.x);
}

#[test]
fn solid_samples_neither_splat_nor_gather() {
    let dims = UVec3::splat(8);
    let mut mac = MacGrid::new(dims);
    mac.u_x.fill(4.0);
    let mut pgrid = ParticleGrid::new(dims);

    let mut particles = vec![Particle::solid(Vec3::splat(0.5), Vec3::Y)];
    pgrid.sort(&particles, 8.0);
    gather_grid_to_particles(&mac, &mut particles);
    assert_eq!(particles[0].velocity, Vec3::ZERO);
}
