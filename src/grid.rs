//! Dense 3D grids and the staggered MAC grid.
//!
//! Velocity components live on cell faces, everything else at cell centers:
//! - `u_x` on YZ faces at x = i * h
//! - `u_y` on XZ faces at y = j * h
//! - `u_z` on XY faces at z = k * h
//!
//! with `h = 1 / max_dim` over the normalized `[0,1]^3` domain.

use glam::UVec3;
use rayon::prelude::*;

/// Cell classification for the pressure solve.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CellType {
    /// Solid obstacle or closed domain boundary (no flow).
    Solid,
    /// Contains at least one fluid particle.
    Fluid,
    /// Empty space.
    #[default]
    Air,
}

/// Dense 3D grid with a fixed out-of-bounds default.
///
/// Reads outside the grid return the default supplied at construction;
/// writes outside the grid are dropped. This is how the ghost values at the
/// domain edge are expressed everywhere in the solver.
#[derive(Clone)]
pub struct Grid3<T> {
    dims: UVec3,
    default: T,
    data: Vec<T>,
}

impl<T: Copy> Grid3<T> {
    pub fn new(dims: UVec3, default: T) -> Self {
        let len = (dims.x * dims.y * dims.z) as usize;
        Self {
            dims,
            default,
            data: vec![default; len],
        }
    }

    #[inline]
    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    /// Flat index, `i` fastest. Callers must pass in-bounds indices.
    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.dims.y as usize + j) * self.dims.x as usize + i
    }

    #[inline]
    pub fn in_bounds(&self, i: i32, j: i32, k: i32) -> bool {
        i >= 0
            && j >= 0
            && k >= 0
            && i < self.dims.x as i32
            && j < self.dims.y as i32
            && k < self.dims.z as i32
    }

    #[inline]
    pub fn get(&self, i: i32, j: i32, k: i32) -> T {
        if self.in_bounds(i, j, k) {
            self.data[self.index(i as usize, j as usize, k as usize)]
        } else {
            self.default
        }
    }

    #[inline]
    pub fn set(&mut self, i: i32, j: i32, k: i32, value: T) {
        if self.in_bounds(i, j, k) {
            let idx = self.index(i as usize, j as usize, k as usize);
            self.data[idx] = value;
        }
    }

    /// Reset every cell to `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Reset every cell to the construction default.
    pub fn clear(&mut self) {
        let d = self.default;
        self.data.fill(d);
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Recover `(i, j, k)` from a flat index.
    #[inline]
    pub fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let x = self.dims.x as usize;
        let y = self.dims.y as usize;
        (idx % x, (idx / x) % y, idx / (x * y))
    }

    pub fn copy_from(&mut self, other: &Grid3<T>) {
        debug_assert_eq!(self.dims, other.dims);
        self.data.copy_from_slice(&other.data);
    }
}

/// Staggered MAC grid: face velocities plus the cell-centered fields the
/// pressure solve needs.
pub struct MacGrid {
    pub dims: UVec3,
    /// X-velocity on YZ faces, `(X+1) * Y * Z`.
    pub u_x: Grid3<f32>,
    /// Y-velocity on XZ faces, `X * (Y+1) * Z`.
    pub u_y: Grid3<f32>,
    /// Z-velocity on XY faces, `X * Y * (Z+1)`.
    pub u_z: Grid3<f32>,
    /// Pressure at cell centers.
    pub pressure: Grid3<f32>,
    /// Velocity divergence at cell centers.
    pub divergence: Grid3<f32>,
    /// Liquid signed distance at cell centers, negative inside the liquid.
    pub liquid_sdf: Grid3<f32>,
    /// Cell classification.
    pub cell_type: Grid3<CellType>,
}

/// "No liquid anywhere near" level-set value; the domain diagonal is < 2.
pub const SDF_FAR: f32 = 1.0e3;

impl MacGrid {
    pub fn new(dims: UVec3) -> Self {
        Self {
            dims,
            u_x: Grid3::new(dims + UVec3::X, 0.0),
            u_y: Grid3::new(dims + UVec3::Y, 0.0),
            u_z: Grid3::new(dims + UVec3::Z, 0.0),
            pressure: Grid3::new(dims, 0.0),
            divergence: Grid3::new(dims, 0.0),
            liquid_sdf: Grid3::new(dims, SDF_FAR),
            cell_type: Grid3::new(dims, CellType::Air),
        }
    }

    /// Reset all fields to their construction defaults.
    pub fn clear(&mut self) {
        self.u_x.clear();
        self.u_y.clear();
        self.u_z.clear();
        self.pressure.clear();
        self.divergence.clear();
        self.liquid_sdf.clear();
        self.cell_type.clear();
    }

    /// Longest axis, the resolution that fixes the cell width `1 / max_dim`.
    #[inline]
    pub fn max_dim(&self) -> f32 {
        self.dims.max_element() as f32
    }

    /// Copy all six face arrays from `other`. Cell-centered fields are not
    /// touched; the snapshot exists for the FLIP velocity delta.
    pub fn copy_faces_from(&mut self, other: &MacGrid) {
        self.u_x.copy_from(&other.u_x);
        self.u_y.copy_from(&other.u_y);
        self.u_z.copy_from(&other.u_z);
    }

    /// Overwrite each face with `current - self`, leaving the per-step
    /// velocity change the FLIP gather samples.
    pub fn form_delta_from(&mut self, current: &MacGrid) {
        for (prev, cur) in [
            (&mut self.u_x, &current.u_x),
            (&mut self.u_y, &current.u_y),
            (&mut self.u_z, &current.u_z),
        ] {
            prev.as_mut_slice()
                .par_iter_mut()
                .zip(cur.as_slice().par_iter())
                .for_each(|(p, &c)| *p = c - *p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_outside_bounds() {
        let mut grid = Grid3::new(UVec3::new(4, 5, 6), 7.5f32);
        grid.set(1, 2, 3, 1.0);
        assert_eq!(grid.get(1, 2, 3), 1.0);
        assert_eq!(grid.get(-1, 2, 3), 7.5);
        assert_eq!(grid.get(4, 0, 0), 7.5);
        assert_eq!(grid.get(0, 0, 6), 7.5);
    }

    #[test]
    fn out_of_bounds_writes_dropped() {
        let mut grid = Grid3::new(UVec3::splat(4), 0.0f32);
        grid.set(-1, 0, 0, 9.0);
        grid.set(0, 4, 0, 9.0);
        assert!(grid.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn index_layout_i_fastest() {
        let grid = Grid3::new(UVec3::new(4, 5, 6), 0.0f32);
        assert_eq!(grid.index(0, 0, 0), 0);
        assert_eq!(grid.index(1, 0, 0), 1);
        assert_eq!(grid.index(0, 1, 0), 4);
        assert_eq!(grid.index(0, 0, 1), 20);
        assert_eq!(grid.coords(grid.index(3, 4, 5)), (3, 4, 5));
    }

    #[test]
    fn mac_face_array_sizes() {
        let mac = MacGrid::new(UVec3::new(4, 5, 6));
        assert_eq!(mac.u_x.as_slice().len(), 5 * 5 * 6);
        assert_eq!(mac.u_y.as_slice().len(), 4 * 6 * 6);
        assert_eq!(mac.u_z.as_slice().len(), 4 * 5 * 7);
        assert_eq!(mac.pressure.as_slice().len(), 4 * 5 * 6);
    }

    #[test]
    fn clear_matches_fresh_grid() {
        let dims = UVec3::splat(5);
        let mut mac = MacGrid::new(dims);
        mac.u_x.fill(3.0);
        mac.pressure.fill(1.0);
        mac.liquid_sdf.fill(-2.0);
        mac.cell_type.fill(CellType::Fluid);
        mac.clear();

        let fresh = MacGrid::new(dims);
        assert_eq!(mac.u_x.as_slice(), fresh.u_x.as_slice());
        assert_eq!(mac.pressure.as_slice(), fresh.pressure.as_slice());
        assert_eq!(mac.liquid_sdf.as_slice(), fresh.liquid_sdf.as_slice());
        assert!(mac
            .cell_type
            .as_slice()
            .iter()
            .all(|&t| t == CellType::Air));
        // Idempotent
        mac.clear();
        assert_eq!(mac.u_x.as_slice(), fresh.u_x.as_slice());
    }

    #[test]
    fn delta_is_current_minus_snapshot() {
        let dims = UVec3::splat(4);
        let mut current = MacGrid::new(dims);
        let mut prev = MacGrid::new(dims);
        current.u_x.fill(3.0);
        prev.copy_faces_from(&current);
        current.u_x.fill(5.0);
        current.u_y.fill(-1.0);
        prev.form_delta_from(&current);
        assert!(prev.u_x.as_slice().iter().all(|&v| v == 2.0));
        assert!(prev.u_y.as_slice().iter().all(|&v| v == -1.0));
    }
}
