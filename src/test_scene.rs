//! Analytic scene provider built from boxes and spheres.
//!
//! Real hosts bring meshes, BVHs, and animated level-sets; this module
//! provides the same interface from closed-form geometry so the solver can
//! be exercised (and tested) without any of that machinery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glam::{UVec3, Vec3};

use crate::grid::{Grid3, SDF_FAR};
use crate::particle::Particle;
use crate::particle_grid::ParticleGrid;
use crate::scene::{Exporter, Intersection, LevelSetSource, Ray, SceneProvider};

/// Closed-form solid in normalized `[0,1]^3` coordinates.
#[derive(Clone, Copy, Debug)]
pub enum SolidShape {
    Sphere { center: Vec3, radius: f32 },
    Box { min: Vec3, max: Vec3 },
}

impl SolidShape {
    /// Signed distance in normalized units, negative inside.
    pub fn signed_distance(&self, p: Vec3) -> f32 {
        match *self {
            SolidShape::Sphere { center, radius } => p.distance(center) - radius,
            SolidShape::Box { min, max } => {
                let center = (min + max) * 0.5;
                let half = (max - min) * 0.5;
                let d = (p - center).abs() - half;
                let outside = d.max(Vec3::ZERO).length();
                let inside = d.max_element().min(0.0);
                outside + inside
            }
        }
    }

    fn normal_at(&self, p: Vec3) -> Vec3 {
        let eps = 1.0e-4;
        let grad = Vec3::new(
            self.signed_distance(p + Vec3::X * eps) - self.signed_distance(p - Vec3::X * eps),
            self.signed_distance(p + Vec3::Y * eps) - self.signed_distance(p - Vec3::Y * eps),
            self.signed_distance(p + Vec3::Z * eps) - self.signed_distance(p - Vec3::Z * eps),
        );
        grad.normalize_or(Vec3::Y)
    }
}

fn scene_distance(shapes: &[SolidShape], p: Vec3) -> f32 {
    shapes
        .iter()
        .map(|s| s.signed_distance(p))
        .fold(SDF_FAR, f32::min)
}

/// Level-set over the cell lattice, refreshed from the analytic shapes.
struct ShapeLevelSet {
    grid: Grid3<f32>,
    shapes: Vec<SolidShape>,
}

impl LevelSetSource for ShapeLevelSet {
    fn cell(&self, i: i32, j: i32, k: i32) -> f32 {
        self.grid.get(i, j, k)
    }

    fn project_points_to_surface(&self, points: &mut [Vec3], _max_dim: f32) {
        for p in points {
            // A few Newton steps along the SDF gradient land on the surface
            // for these smooth shapes.
            for _ in 0..4 {
                let d = scene_distance(&self.shapes, *p);
                if d.abs() < 1.0e-5 {
                    break;
                }
                let n = nearest_shape(&self.shapes, *p)
                    .map(|s| s.normal_at(*p))
                    .unwrap_or(Vec3::Y);
                *p -= n * d;
            }
        }
    }
}

fn nearest_shape(shapes: &[SolidShape], p: Vec3) -> Option<&SolidShape> {
    shapes.iter().min_by(|a, b| {
        a.signed_distance(p)
            .abs()
            .total_cmp(&b.signed_distance(p).abs())
    })
}

/// Empty liquid level-set; scripted liquid volumes are a host concern.
struct FarLevelSet;

impl LevelSetSource for FarLevelSet {
    fn cell(&self, _i: i32, _j: i32, _k: i32) -> f32 {
        SDF_FAR
    }
    fn project_points_to_surface(&self, _points: &mut [Vec3], _max_dim: f32) {}
}

/// A block of liquid emitted over a frame range.
#[derive(Clone, Copy, Debug)]
pub struct FluidSource {
    pub min: Vec3,
    pub max: Vec3,
    pub velocity: Vec3,
    pub first_frame: u32,
    pub last_frame: u32,
}

impl FluidSource {
    /// One-shot block present from frame zero.
    pub fn block(min: Vec3, max: Vec3) -> Self {
        Self {
            min,
            max,
            velocity: Vec3::ZERO,
            first_frame: 0,
            last_frame: 0,
        }
    }
}

/// Scene provider assembled from analytic parts.
pub struct TestScene {
    max_dim: f32,
    sources: Vec<FluidSource>,
    forces: Vec<Vec3>,
    solid: ShapeLevelSet,
    liquid: FarLevelSet,
}

impl TestScene {
    pub fn new(dims: UVec3) -> Self {
        Self {
            max_dim: dims.max_element() as f32,
            sources: Vec::new(),
            forces: Vec::new(),
            solid: ShapeLevelSet {
                grid: Grid3::new(dims, SDF_FAR),
                shapes: Vec::new(),
            },
            liquid: FarLevelSet,
        }
    }

    pub fn with_gravity(mut self) -> Self {
        self.forces.push(Vec3::new(0.0, -9.8, 0.0));
        self
    }

    pub fn add_force(&mut self, force: Vec3) {
        self.forces.push(force);
    }

    pub fn add_source(&mut self, source: FluidSource) {
        self.sources.push(source);
    }

    pub fn add_solid(&mut self, shape: SolidShape) {
        self.solid.shapes.push(shape);
    }

    /// Shell samples along every solid surface, emitted once at frame zero.
    fn emit_solid_shells(&self, particles: &mut Vec<Particle>, spacing: f32) {
        for shape in &self.solid.shapes {
            match *shape {
                SolidShape::Sphere { center, radius } => {
                    let rings = ((std::f32::consts::PI * radius / spacing).ceil() as usize).max(3);
                    for ring in 0..=rings {
                        let theta = std::f32::consts::PI * ring as f32 / rings as f32;
                        let ring_radius = radius * theta.sin();
                        let segs = ((std::f32::consts::TAU * ring_radius / spacing).ceil()
                            as usize)
                            .max(1);
                        for seg in 0..segs {
                            let phi = std::f32::consts::TAU * seg as f32 / segs as f32;
                            let normal = Vec3::new(
                                theta.sin() * phi.cos(),
                                theta.cos(),
                                theta.sin() * phi.sin(),
                            );
                            particles.push(Particle::solid(center + normal * radius, normal));
                        }
                    }
                }
                SolidShape::Box { min, max } => {
                    let size = max - min;
                    let n = (size / spacing).ceil().max(Vec3::ONE);
                    let (nx, ny, nz) = (n.x as usize, n.y as usize, n.z as usize);
                    for u in 0..=ny {
                        for v in 0..=nz {
                            let y = min.y + size.y * u as f32 / ny as f32;
                            let z = min.z + size.z * v as f32 / nz as f32;
                            particles.push(Particle::solid(Vec3::new(min.x, y, z), Vec3::NEG_X));
                            particles.push(Particle::solid(Vec3::new(max.x, y, z), Vec3::X));
                        }
                    }
                    for u in 0..=nx {
                        for v in 0..=nz {
                            let x = min.x + size.x * u as f32 / nx as f32;
                            let z = min.z + size.z * v as f32 / nz as f32;
                            particles.push(Particle::solid(Vec3::new(x, min.y, z), Vec3::NEG_Y));
                            particles.push(Particle::solid(Vec3::new(x, max.y, z), Vec3::Y));
                        }
                    }
                    for u in 0..=nx {
                        for v in 0..=ny {
                            let x = min.x + size.x * u as f32 / nx as f32;
                            let y = min.y + size.y * v as f32 / ny as f32;
                            particles.push(Particle::solid(Vec3::new(x, y, min.z), Vec3::NEG_Z));
                            particles.push(Particle::solid(Vec3::new(x, y, max.z), Vec3::Z));
                        }
                    }
                }
            }
        }
    }
}

impl SceneProvider for TestScene {
    fn generate_particles(
        &mut self,
        particles: &mut Vec<Particle>,
        _dims: UVec3,
        density: f32,
        _pgrid: &ParticleGrid,
        frame: u32,
    ) {
        let spacing = density / self.max_dim;
        if frame == 0 && !self.solid.shapes.is_empty() {
            self.emit_solid_shells(particles, spacing);
        }
        for source in &self.sources {
            if frame < source.first_frame || frame > source.last_frame {
                continue;
            }
            let mut z = source.min.z + spacing * 0.5;
            while z < source.max.z {
                let mut y = source.min.y + spacing * 0.5;
                while y < source.max.y {
                    let mut x = source.min.x + spacing * 0.5;
                    while x < source.max.x {
                        let p = Vec3::new(x, y, z);
                        if scene_distance(&self.solid.shapes, p) > 0.0 {
                            particles.push(Particle::fluid(p, source.velocity));
                        }
                        x += spacing;
                    }
                    y += spacing;
                }
                z += spacing;
            }
        }
    }

    fn build_solid_level_set(&mut self, _frame: u32) {
        let dims = self.solid.grid.dims();
        let h = 1.0 / self.max_dim;
        for k in 0..dims.z as i32 {
            for j in 0..dims.y as i32 {
                for i in 0..dims.x as i32 {
                    let center =
                        Vec3::new(i as f32 + 0.5, j as f32 + 0.5, k as f32 + 0.5) * h;
                    let d = scene_distance(&self.solid.shapes, center);
                    self.solid.grid.set(i, j, k, d);
                }
            }
        }
    }

    fn solid_level_set(&self) -> &dyn LevelSetSource {
        &self.solid
    }

    fn liquid_level_set(&self) -> &dyn LevelSetSource {
        &self.liquid
    }

    fn intersect_solids(&self, ray: &Ray) -> Intersection {
        if !ray.is_valid() {
            return Intersection::MISS;
        }
        // Sphere-trace the combined SDF in normalized space.
        let origin = ray.origin / self.max_dim;
        let direction = ray.direction.normalize();
        let mut t = 0.0f32;
        for _ in 0..128 {
            let p = origin + direction * t;
            let d = scene_distance(&self.solid.shapes, p);
            if d.abs() < 5.0e-4 {
                let shape = match nearest_shape(&self.solid.shapes, p) {
                    Some(s) => s,
                    None => return Intersection::MISS,
                };
                return Intersection {
                    hit: true,
                    point: p * self.max_dim,
                    normal: shape.normal_at(p),
                };
            }
            // Inside a solid: march by the (positive) penetration depth so
            // rays started inside still reach the surface.
            t += d.abs().max(1.0e-4);
            if t > 4.0 {
                break;
            }
        }
        Intersection::MISS
    }

    fn point_inside_solid(&self, point: Vec3, _frame: u32) -> Option<u32> {
        let p = point / self.max_dim;
        self.solid
            .shapes
            .iter()
            .position(|s| s.signed_distance(p) < 0.0)
            .map(|idx| idx as u32)
    }

    fn external_forces(&self) -> &[Vec3] {
        &self.forces
    }
}

/// Exporter that only counts invocations; tests keep clones of the shared
/// counters and assert against them.
#[derive(Default)]
pub struct CountingExporter {
    pub calls: Arc<AtomicUsize>,
    pub last_count: Arc<AtomicUsize>,
}

impl Exporter for CountingExporter {
    fn export_particles(
        &mut self,
        particles: &[Particle],
        _max_dim: f32,
        _frame: u32,
        _vdb: bool,
        _obj: bool,
        _partio: bool,
    ) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.last_count.store(particles.len(), Ordering::Relaxed);
    }
}
