//! Pressure projection: divergence, MIC(0)-preconditioned conjugate
//! gradient, and ghost-fluid pressure gradient subtraction.
//!
//! The Poisson problem is the standard 7-point negative Laplacian over
//! FLUID cells with Neumann boundaries at SOLID cells and Dirichlet P = 0
//! at AIR cells. With `subcell` enabled, air-side coefficients are scaled
//! by the liquid level-set ratio so the free surface sits between cell
//! centers instead of staircasing.

use glam::{IVec3, UVec3};
use log::{debug, warn};
use rayon::prelude::*;

use crate::grid::{CellType, Grid3, MacGrid};

/// Clamp for the fluid-side level-set value in ghost-fluid ratios.
pub const GHOST_EPS: f32 = 1.0e-6;

/// Fixed chunk width for deterministic parallel reductions. Partial sums
/// are computed per chunk and folded sequentially, so results are
/// bit-identical for any worker count.
const REDUCE_CHUNK: usize = 4096;

/// Cell-centered divergence of the face velocity field, for every cell.
pub fn compute_divergence(mac: &mut MacGrid) {
    let dims = mac.dims;
    let max_dim = mac.max_dim();
    let slab = (dims.x * dims.y) as usize;
    let MacGrid {
        u_x,
        u_y,
        u_z,
        divergence,
        ..
    } = mac;

    divergence
        .as_mut_slice()
        .par_chunks_mut(slab)
        .enumerate()
        .for_each(|(k, plane)| {
            let k = k as i32;
            for j in 0..dims.y as i32 {
                for i in 0..dims.x as i32 {
                    let div = (u_x.get(i + 1, j, k) - u_x.get(i, j, k)
                        + u_y.get(i, j + 1, k)
                        - u_y.get(i, j, k)
                        + u_z.get(i, j, k + 1)
                        - u_z.get(i, j, k))
                        * max_dim;
                    plane[(j * dims.x as i32 + i) as usize] = div;
                }
            }
        });
}

/// Outcome of one PCG solve.
#[derive(Clone, Copy, Debug)]
pub struct SolveStats {
    pub iterations: usize,
    pub residual: f32,
    pub converged: bool,
}

/// PCG solver with preallocated scratch fields.
///
/// Construct once per simulator; `solve` reuses every buffer, so the hot
/// path does not allocate.
pub struct PressureSolver {
    r: Grid3<f32>,
    z: Grid3<f32>,
    s: Grid3<f32>,
    q: Grid3<f32>,
    aux: Grid3<f32>,
    pc: Grid3<f32>,
    partials: Vec<f32>,
    tolerance: f32,
    max_iterations: usize,
}

impl PressureSolver {
    pub fn new(dims: UVec3, tolerance: f32, max_iterations: usize) -> Self {
        Self {
            r: Grid3::new(dims, 0.0),
            z: Grid3::new(dims, 0.0),
            s: Grid3::new(dims, 0.0),
            q: Grid3::new(dims, 0.0),
            aux: Grid3::new(dims, 0.0),
            pc: Grid3::new(dims, 0.0),
            partials: Vec::new(),
            tolerance,
            max_iterations,
        }
    }

    /// Solve `A P = -D` over the FLUID cells of `mac`, leaving the result
    /// in `mac.pressure`. Non-convergence is reported, not fatal; the best
    /// pressure found still gets subtracted.
    pub fn solve(&mut self, mac: &mut MacGrid, subcell: bool) -> SolveStats {
        let max_dim = mac.max_dim();
        let MacGrid {
            pressure,
            divergence,
            liquid_sdf,
            cell_type,
            ..
        } = mac;

        // Right-hand side is -D.
        negate(divergence);

        self.pc.fill(0.0);
        build_preconditioner(&mut self.pc, cell_type, liquid_sdf, subcell);

        pressure.fill(0.0);
        restrict_to_fluid(&mut self.r, divergence, cell_type);

        let mut residual = max_abs(&mut self.partials, self.r.as_slice());
        if residual < self.tolerance {
            return SolveStats {
                iterations: 0,
                residual,
                converged: true,
            };
        }

        apply_preconditioner(
            &mut self.z,
            &mut self.aux,
            &self.r,
            &self.pc,
            cell_type,
        );
        self.s.copy_from(&self.z);
        let mut sigma = dot(&mut self.partials, self.z.as_slice(), self.r.as_slice());

        let mut converged = false;
        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            apply_laplacian(
                &mut self.q,
                &self.s,
                cell_type,
                liquid_sdf,
                subcell,
                max_dim,
            );
            let sq = dot(&mut self.partials, self.s.as_slice(), self.q.as_slice());
            if sq == 0.0 {
                break;
            }
            let alpha = sigma / sq;
            scaled_add(pressure, &self.s, alpha, cell_type);
            scaled_add(&mut self.r, &self.q, -alpha, cell_type);

            residual = max_abs(&mut self.partials, self.r.as_slice());
            debug!("pcg iteration {iterations}: residual {residual:.3e}");
            if residual < self.tolerance {
                converged = true;
                break;
            }

            apply_preconditioner(
                &mut self.z,
                &mut self.aux,
                &self.r,
                &self.pc,
                cell_type,
            );
            let sigma_next = dot(&mut self.partials, self.z.as_slice(), self.r.as_slice());
            let beta = sigma_next / sigma;
            xpay(&mut self.s, &self.z, beta, cell_type);
            sigma = sigma_next;
        }

        if !converged {
            warn!(
                "pressure solve stopped after {iterations} iterations with residual {residual:.3e}"
            );
        }
        SolveStats {
            iterations,
            residual,
            converged,
        }
    }
}

fn negate(grid: &mut Grid3<f32>) {
    grid.as_mut_slice().par_iter_mut().for_each(|v| *v = -*v);
}

/// `target = source` on FLUID cells, zero elsewhere.
fn restrict_to_fluid(target: &mut Grid3<f32>, source: &Grid3<f32>, cell_type: &Grid3<CellType>) {
    target
        .as_mut_slice()
        .par_iter_mut()
        .zip(source.as_slice().par_iter())
        .zip(cell_type.as_slice().par_iter())
        .for_each(|((t, &v), &ct)| {
            *t = if ct == CellType::Fluid { v } else { 0.0 };
        });
}

/// `target += alpha * y` on FLUID cells.
fn scaled_add(target: &mut Grid3<f32>, y: &Grid3<f32>, alpha: f32, cell_type: &Grid3<CellType>) {
    target
        .as_mut_slice()
        .par_iter_mut()
        .zip(y.as_slice().par_iter())
        .zip(cell_type.as_slice().par_iter())
        .for_each(|((t, &yv), &ct)| {
            if ct == CellType::Fluid {
                *t += alpha * yv;
            }
        });
}

/// `target = x + beta * target` on FLUID cells.
fn xpay(target: &mut Grid3<f32>, x: &Grid3<f32>, beta: f32, cell_type: &Grid3<CellType>) {
    target
        .as_mut_slice()
        .par_iter_mut()
        .zip(x.as_slice().par_iter())
        .zip(cell_type.as_slice().par_iter())
        .for_each(|((t, &xv), &ct)| {
            if ct == CellType::Fluid {
                *t = xv + beta * *t;
            }
        });
}

/// Deterministic parallel dot product (both vectors are zero off-fluid).
fn dot(partials: &mut Vec<f32>, a: &[f32], b: &[f32]) -> f32 {
    a.par_chunks(REDUCE_CHUNK)
        .zip(b.par_chunks(REDUCE_CHUNK))
        .map(|(ca, cb)| ca.iter().zip(cb).map(|(x, y)| x * y).sum::<f32>())
        .collect_into_vec(partials);
    partials.iter().sum()
}

/// Deterministic parallel infinity norm.
fn max_abs(partials: &mut Vec<f32>, a: &[f32]) -> f32 {
    a.par_chunks(REDUCE_CHUNK)
        .map(|chunk| chunk.iter().fold(0.0f32, |m, v| m.max(v.abs())))
        .collect_into_vec(partials);
    partials.iter().copied().fold(0.0, f32::max)
}

/// Matrix coefficient between FLUID cells, `-1` when both are fluid.
#[inline]
fn off_diag(cell_type: &Grid3<CellType>, a: IVec3, b: IVec3) -> f32 {
    if cell_type.get(a.x, a.y, a.z) == CellType::Fluid
        && cell_type.get(b.x, b.y, b.z) == CellType::Fluid
    {
        -1.0
    } else {
        0.0
    }
}

/// Diagonal coefficient: non-SOLID neighbor count, reduced toward AIR
/// neighbors by the ghost-fluid level-set ratio when `subcell` is on.
fn diag(
    cell_type: &Grid3<CellType>,
    liquid_sdf: &Grid3<f32>,
    c: IVec3,
    subcell: bool,
) -> f32 {
    let mut d = 6.0;
    for n in neighbors(c) {
        if !cell_type.in_bounds(n.x, n.y, n.z)
            || cell_type.get(n.x, n.y, n.z) == CellType::Solid
        {
            d -= 1.0;
        } else if cell_type.get(n.x, n.y, n.z) == CellType::Air && subcell {
            d -= liquid_sdf.get(n.x, n.y, n.z) / GHOST_EPS.min(liquid_sdf.get(c.x, c.y, c.z));
        }
    }
    d
}

#[inline]
fn neighbors(c: IVec3) -> [IVec3; 6] {
    [
        c - IVec3::X,
        c + IVec3::X,
        c - IVec3::Y,
        c + IVec3::Y,
        c - IVec3::Z,
        c + IVec3::Z,
    ]
}

/// MIC(0) factor build. Single-threaded by design; the sweeps read
/// previously written entries in flat order.
fn build_preconditioner(
    pc: &mut Grid3<f32>,
    cell_type: &Grid3<CellType>,
    liquid_sdf: &Grid3<f32>,
    subcell: bool,
) {
    let a = 0.25;
    let len = cell_type.as_slice().len();
    for idx in 0..len {
        if cell_type.as_slice()[idx] != CellType::Fluid {
            continue;
        }
        let (i, j, k) = cell_type.coords(idx);
        let c = IVec3::new(i as i32, j as i32, k as i32);

        let left = off_diag(cell_type, c - IVec3::X, c) * pc.get(c.x - 1, c.y, c.z);
        let bottom = off_diag(cell_type, c - IVec3::Y, c) * pc.get(c.x, c.y - 1, c.z);
        let back = off_diag(cell_type, c - IVec3::Z, c) * pc.get(c.x, c.y, c.z - 1);
        let d = diag(cell_type, liquid_sdf, c, subcell);
        if d <= 0.0 {
            continue;
        }
        let mut e = d - left * left - bottom * bottom - back * back;
        if e < a * d {
            e = d;
        }
        pc.set(c.x, c.y, c.z, 1.0 / e.sqrt());
    }
}

/// Read of the pressure iterate at a neighbor, encoding the boundary
/// conditions: Neumann at SOLID (mirror the center value), Dirichlet at
/// AIR, and the ghost-fluid extrapolated value when `subcell` is on.
#[inline]
fn x_ref(
    cell_type: &Grid3<CellType>,
    liquid_sdf: &Grid3<f32>,
    x: &Grid3<f32>,
    center: IVec3,
    neighbor: IVec3,
    subcell: bool,
) -> f32 {
    let dims = cell_type.dims();
    let n = neighbor.clamp(IVec3::ZERO, dims.as_ivec3() - IVec3::ONE);
    match cell_type.get(n.x, n.y, n.z) {
        CellType::Fluid => x.get(n.x, n.y, n.z),
        CellType::Solid => x.get(center.x, center.y, center.z),
        CellType::Air => {
            if subcell {
                liquid_sdf.get(n.x, n.y, n.z)
                    / GHOST_EPS.min(liquid_sdf.get(center.x, center.y, center.z))
                    * x.get(center.x, center.y, center.z)
            } else {
                0.0
            }
        }
    }
}

/// `target = A x` over FLUID cells, zero elsewhere.
fn apply_laplacian(
    target: &mut Grid3<f32>,
    x: &Grid3<f32>,
    cell_type: &Grid3<CellType>,
    liquid_sdf: &Grid3<f32>,
    subcell: bool,
    max_dim: f32,
) {
    let dims = cell_type.dims();
    let slab = (dims.x * dims.y) as usize;
    let scale = max_dim * max_dim;

    target
        .as_mut_slice()
        .par_chunks_mut(slab)
        .enumerate()
        .for_each(|(k, plane)| {
            let k = k as i32;
            for j in 0..dims.y as i32 {
                for i in 0..dims.x as i32 {
                    let flat = (j * dims.x as i32 + i) as usize;
                    if cell_type.get(i, j, k) != CellType::Fluid {
                        plane[flat] = 0.0;
                        continue;
                    }
                    let c = IVec3::new(i, j, k);
                    let mut acc = 6.0 * x.get(i, j, k);
                    for n in neighbors(c) {
                        acc -= x_ref(cell_type, liquid_sdf, x, c, n, subcell);
                    }
                    plane[flat] = acc * scale;
                }
            }
        });
}

/// Apply `M^-1` by forward/backward substitution with the MIC(0) factor.
/// Sequential in flat index order, which respects the dependency pattern.
fn apply_preconditioner(
    z: &mut Grid3<f32>,
    aux: &mut Grid3<f32>,
    r: &Grid3<f32>,
    pc: &Grid3<f32>,
    cell_type: &Grid3<CellType>,
) {
    aux.fill(0.0);
    z.fill(0.0);
    let len = cell_type.as_slice().len();

    // Forward sweep: L q = r.
    for idx in 0..len {
        if cell_type.as_slice()[idx] != CellType::Fluid {
            continue;
        }
        let (i, j, k) = cell_type.coords(idx);
        let c = IVec3::new(i as i32, j as i32, k as i32);
        let left =
            off_diag(cell_type, c - IVec3::X, c) * pc.get(c.x - 1, c.y, c.z) * aux.get(c.x - 1, c.y, c.z);
        let bottom =
            off_diag(cell_type, c - IVec3::Y, c) * pc.get(c.x, c.y - 1, c.z) * aux.get(c.x, c.y - 1, c.z);
        let back =
            off_diag(cell_type, c - IVec3::Z, c) * pc.get(c.x, c.y, c.z - 1) * aux.get(c.x, c.y, c.z - 1);
        let t = r.get(c.x, c.y, c.z) - left - bottom - back;
        aux.set(c.x, c.y, c.z, t * pc.get(c.x, c.y, c.z));
    }

    // Backward sweep: L^T z = q.
    for idx in (0..len).rev() {
        if cell_type.as_slice()[idx] != CellType::Fluid {
            continue;
        }
        let (i, j, k) = cell_type.coords(idx);
        let c = IVec3::new(i as i32, j as i32, k as i32);
        let right =
            off_diag(cell_type, c + IVec3::X, c) * pc.get(c.x, c.y, c.z) * z.get(c.x + 1, c.y, c.z);
        let top =
            off_diag(cell_type, c + IVec3::Y, c) * pc.get(c.x, c.y, c.z) * z.get(c.x, c.y + 1, c.z);
        let front =
            off_diag(cell_type, c + IVec3::Z, c) * pc.get(c.x, c.y, c.z) * z.get(c.x, c.y, c.z + 1);
        let t = aux.get(c.x, c.y, c.z) - right - top - front;
        z.set(c.x, c.y, c.z, t * pc.get(c.x, c.y, c.z));
    }
}

/// Zero the normal velocity on every face adjacent to a SOLID cell.
///
/// Off-domain neighbors count as SOLID here: the outer walls are closed.
/// Obstacles are static, so the enforced normal velocity is zero.
pub fn enforce_boundary_velocity(mac: &mut MacGrid) {
    let MacGrid {
        u_x,
        u_y,
        u_z,
        cell_type,
        ..
    } = mac;
    boundary_axis(u_x, IVec3::X, cell_type);
    boundary_axis(u_y, IVec3::Y, cell_type);
    boundary_axis(u_z, IVec3::Z, cell_type);
}

fn boundary_axis(faces: &mut Grid3<f32>, axis: IVec3, cell_type: &Grid3<CellType>) {
    let face_dims = faces.dims();
    let slab = (face_dims.x * face_dims.y) as usize;

    faces
        .as_mut_slice()
        .par_chunks_mut(slab)
        .enumerate()
        .for_each(|(k, plane)| {
            let k = k as i32;
            for j in 0..face_dims.y as i32 {
                for i in 0..face_dims.x as i32 {
                    let front = IVec3::new(i, j, k);
                    let back = front - axis;
                    let front_solid = !cell_type.in_bounds(front.x, front.y, front.z)
                        || cell_type.get(front.x, front.y, front.z) == CellType::Solid;
                    let back_solid = !cell_type.in_bounds(back.x, back.y, back.z)
                        || cell_type.get(back.x, back.y, back.z) == CellType::Solid;
                    if front_solid || back_solid {
                        plane[(j * face_dims.x as i32 + i) as usize] = 0.0;
                    }
                }
            }
        });
}

/// Subtract the pressure gradient from every face touching fluid, with the
/// ghost-fluid correction across the free surface.
pub fn subtract_pressure_gradient(mac: &mut MacGrid, subcell: bool) {
    let dims = mac.dims;
    let max_dim = mac.max_dim();
    let MacGrid {
        u_x,
        u_y,
        u_z,
        pressure,
        liquid_sdf,
        cell_type,
        ..
    } = mac;

    gradient_axis(u_x, IVec3::X, dims, max_dim, pressure, liquid_sdf, cell_type, subcell);
    gradient_axis(u_y, IVec3::Y, dims, max_dim, pressure, liquid_sdf, cell_type, subcell);
    gradient_axis(u_z, IVec3::Z, dims, max_dim, pressure, liquid_sdf, cell_type, subcell);
}

#[allow(clippy::too_many_arguments)]
fn gradient_axis(
    faces: &mut Grid3<f32>,
    axis: IVec3,
    dims: UVec3,
    max_dim: f32,
    pressure: &Grid3<f32>,
    liquid_sdf: &Grid3<f32>,
    cell_type: &Grid3<CellType>,
    subcell: bool,
) {
    let face_dims = faces.dims();
    let slab = (face_dims.x * face_dims.y) as usize;
    let interior_max = IVec3::new(dims.x as i32, dims.y as i32, dims.z as i32);

    faces
        .as_mut_slice()
        .par_chunks_mut(slab)
        .enumerate()
        .for_each(|(k, plane)| {
            let k = k as i32;
            for j in 0..face_dims.y as i32 {
                for i in 0..face_dims.x as i32 {
                    let face = IVec3::new(i, j, k);
                    // Interior faces only: the face's axis coordinate runs
                    // strictly between 0 and the cell count.
                    let along = (face * axis).element_sum();
                    if along <= 0 || along >= (interior_max * axis).element_sum() {
                        continue;
                    }
                    let front = face;
                    let back = face - axis;
                    let front_type = cell_type.get(front.x, front.y, front.z);
                    let back_type = cell_type.get(back.x, back.y, back.z);
                    if front_type == CellType::Solid || back_type == CellType::Solid {
                        continue;
                    }
                    if front_type != CellType::Fluid && back_type != CellType::Fluid {
                        continue;
                    }

                    let l_front = liquid_sdf.get(front.x, front.y, front.z);
                    let l_back = liquid_sdf.get(back.x, back.y, back.z);
                    let mut p_front = pressure.get(front.x, front.y, front.z);
                    let mut p_back = pressure.get(back.x, back.y, back.z);
                    if subcell && l_front * l_back < 0.0 {
                        // Replace the air-side pressure with the ghost value
                        // extrapolated from the fluid side.
                        if l_front >= 0.0 {
                            p_front = l_front / GHOST_EPS.min(l_back)
                                * pressure.get(back.x, back.y, back.z);
                        }
                        if l_back >= 0.0 {
                            p_back = l_back / GHOST_EPS.min(l_front)
                                * pressure.get(front.x, front.y, front.z);
                        }
                    }
                    plane[(j * face_dims.x as i32 + i) as usize] -=
                        (p_front - p_back) * max_dim;
                }
            }
        });
}
