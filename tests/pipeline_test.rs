//! End-to-end scenario tests driving the full per-step pipeline.

use flip3d::test_scene::{FluidSource, SolidShape, TestScene};
use flip3d::{CellType, FlipParams, FlipSimulation, UVec3, Vec3};

const DT: f32 = 1.0 / 60.0;

fn domain_bounds(max_dim: f32) -> (f32, f32) {
    let r = 1.0 / max_dim;
    (r, 1.0 - r)
}

fn assert_fluid_contained(sim: &FlipSimulation, slack: f32) {
    let (lo, hi) = domain_bounds(sim.max_dim());
    for p in sim.particles() {
        if !p.is_fluid() {
            continue;
        }
        assert!(p.position.is_finite(), "non-finite position survived");
        assert!(p.velocity.is_finite(), "non-finite velocity survived");
        for c in [p.position.x, p.position.y, p.position.z] {
            assert!(
                c >= lo - slack && c <= hi + slack,
                "particle escaped to {:?}",
                p.position
            );
        }
    }
}

#[test]
fn dam_break_stays_contained() {
    let dims = UVec3::splat(16);
    let mut scene = TestScene::new(dims).with_gravity();
    scene.add_source(FluidSource::block(Vec3::splat(0.07), Vec3::splat(0.5)));

    let mut sim = FlipSimulation::new(dims, 1.0, DT, &mut scene, false).unwrap();
    sim.init();
    let count0 = sim.particles().len();
    assert!(count0 > 0);

    // Initial potential energy against the domain floor.
    let pe0: f32 = sim
        .particles()
        .iter()
        .filter(|p| p.is_fluid())
        .map(|p| p.mass * 9.8 * p.position.y)
        .sum();

    let mut prev_count = count0;
    for _ in 0..60 {
        sim.step(false, false, false);
        // Mass conservation: bounded drift per step.
        let count = sim.particles().len();
        assert!(
            (count as f32 - prev_count as f32).abs() <= 0.1 * prev_count as f32 + 1.0,
            "resampler churned {prev_count} -> {count} in one step"
        );
        prev_count = count;
    }

    assert_fluid_contained(&sim, 1.0e-6);
    let ke: f32 = sim
        .particles()
        .iter()
        .filter(|p| p.is_fluid())
        .map(|p| 0.5 * p.mass * p.velocity.length_squared())
        .sum();
    assert!(ke.is_finite());
    assert!(ke < 10.0 * pe0, "kinetic energy blew up: {ke} vs PE {pe0}");
}

#[test]
fn single_particle_free_fall_matches_ballistics() {
    let dims = UVec3::splat(16);
    let mut scene = TestScene::new(dims).with_gravity();
    // A source sized to emit exactly one particle near (0.5, 0.9, 0.5).
    scene.add_source(FluidSource::block(
        Vec3::new(0.47, 0.87, 0.47),
        Vec3::new(0.53, 0.93, 0.53),
    ));

    let mut sim = FlipSimulation::new(dims, 1.0, DT, &mut scene, false).unwrap();
    sim.init();
    assert_eq!(
        sim.particles().iter().filter(|p| p.is_fluid()).count(),
        1,
        "scenario needs exactly one particle"
    );
    let start = sim.particles()[0].position;

    for _ in 0..6 {
        sim.step(false, false, false);
    }

    // Symplectic Euler free fall: drop = g dt^2 * sum(1..=6).
    let expected = start.y - 9.8 * DT * DT * 21.0;
    let end = sim.particles()[0].position;
    assert!(
        (end.y - expected).abs() < 1.0e-3,
        "free fall drifted: got {}, expected {expected}",
        end.y
    );
    // Horizontal drift stays at kernel roundoff.
    assert!((end.x - start.x).abs() < 1.0e-4);
    assert!((end.z - start.z).abs() < 1.0e-4);
}

#[test]
fn still_pool_settles_hydrostatic() {
    let dims = UVec3::splat(12);
    let mut scene = TestScene::new(dims).with_gravity();
    scene.add_source(FluidSource::block(
        Vec3::new(0.15, 0.1, 0.15),
        Vec3::new(0.85, 0.45, 0.85),
    ));

    let mut sim = FlipSimulation::new(dims, 0.5, DT, &mut scene, false).unwrap();
    sim.init();

    for _ in 0..100 {
        sim.step(false, false, false);
    }

    // The pool is calm.
    let fluid: Vec<_> = sim.particles().iter().filter(|p| p.is_fluid()).collect();
    let rms = (fluid
        .iter()
        .map(|p| p.velocity.length_squared())
        .sum::<f32>()
        / fluid.len() as f32)
        .sqrt();
    assert!(rms < 0.1, "pool never settled, rms velocity {rms}");

    // Hydrostatic pressure: within each fluid column, pressure does not
    // decrease with depth.
    let mac = sim.mac();
    let p_scale = mac
        .pressure
        .as_slice()
        .iter()
        .fold(0.0f32, |m, p| m.max(p.abs()));
    assert!(p_scale > 0.0, "no pressure at all in a pool under gravity");
    let tol = 1.0e-2 * p_scale;
    for k in 1..11 {
        for i in 1..11 {
            for j in 1..10 {
                let here = mac.cell_type.get(i, j, k);
                let above = mac.cell_type.get(i, j + 1, k);
                if here == CellType::Fluid && above == CellType::Fluid {
                    assert!(
                        mac.pressure.get(i, j, k) >= mac.pressure.get(i, j + 1, k) - tol,
                        "pressure inverted at ({i},{j},{k})"
                    );
                }
            }
        }
    }
}

#[test]
fn static_scene_without_forces_stays_put() {
    let dims = UVec3::splat(12);
    let mut scene = TestScene::new(dims);
    scene.add_source(FluidSource::block(
        Vec3::new(0.2, 0.2, 0.2),
        Vec3::new(0.7, 0.5, 0.7),
    ));

    let mut sim = FlipSimulation::new(dims, 0.5, DT, &mut scene, false).unwrap();
    sim.init();
    let before: Vec<Vec3> = sim.particles().iter().map(|p| p.position).collect();

    sim.step(false, false, false);

    for (p, &b) in sim.particles().iter().zip(&before) {
        assert!(
            (p.position - b).length() < 1.0e-6,
            "particle moved without any force"
        );
    }
}

#[test]
fn solid_sphere_deflects_falling_block() {
    let dims = UVec3::splat(16);
    let sphere = SolidShape::Sphere {
        center: Vec3::new(0.5, 0.3, 0.5),
        radius: 0.12,
    };
    let mut scene = TestScene::new(dims).with_gravity();
    scene.add_solid(sphere);
    scene.add_source(FluidSource::block(
        Vec3::new(0.35, 0.6, 0.35),
        Vec3::new(0.65, 0.8, 0.65),
    ));

    let mut sim = FlipSimulation::new(dims, 0.5, DT, &mut scene, false).unwrap();
    sim.init();

    for _ in 0..40 {
        sim.step(false, false, false);
    }

    let cell = 1.0 / 16.0;
    for p in sim.particles() {
        if !p.is_fluid() {
            continue;
        }
        let d = sphere.signed_distance(p.position);
        assert!(
            d > -1.05 * cell,
            "particle at {:?} penetrated the sphere by {} cells",
            p.position,
            -d / cell
        );
    }
    assert_fluid_contained(&sim, 1.0e-6);
}

#[test]
fn confined_pool_population_is_stable() {
    let dims = UVec3::splat(12);
    let mut scene = TestScene::new(dims).with_gravity();
    scene.add_source(FluidSource::block(
        Vec3::new(0.2, 0.1, 0.2),
        Vec3::new(0.8, 0.4, 0.8),
    ));

    let mut sim = FlipSimulation::new(dims, 0.5, DT, &mut scene, false).unwrap();
    sim.init();
    let n0 = sim.particles().len() as f32;

    for step in 0..100 {
        sim.step(false, false, false);
        let n = sim.particles().len() as f32;
        assert!(
            n >= 0.9 * n0 && n <= 1.2 * n0,
            "population drifted to {n} from {n0} by step {step}"
        );
    }
}

#[test]
fn pure_pic_blend_is_supported() {
    let dims = UVec3::splat(12);
    let mut scene = TestScene::new(dims).with_gravity();
    scene.add_source(FluidSource::block(
        Vec3::new(0.2, 0.1, 0.2),
        Vec3::new(0.8, 0.4, 0.8),
    ));

    let params = FlipParams {
        pic_flip_ratio: 0.0,
        ..FlipParams::default()
    };
    let mut sim =
        FlipSimulation::with_params(dims, 0.5, DT, &mut scene, false, params).unwrap();
    sim.init();
    for _ in 0..20 {
        sim.step(false, false, false);
    }
    assert_fluid_contained(&sim, 1.0e-6);
}
