//! Velocity extrapolation into the air shell around the liquid.
//!
//! After projection only fluid-adjacent faces carry meaningful velocities.
//! One sweep fills each walled-off face from the mean of its fluid-adjacent
//! face neighbors so the PIC gather near the surface samples defined
//! values.

use glam::{IVec3, UVec3};
use rayon::prelude::*;

use crate::grid::{CellType, Grid3, MacGrid};

/// Scratch marks for the three face lattices, allocated once.
pub struct Extrapolator {
    fluid_adjacent: [Grid3<bool>; 3],
    wall: [Grid3<bool>; 3],
    scratch: [Grid3<f32>; 3],
}

impl Extrapolator {
    pub fn new(dims: UVec3) -> Self {
        let face_dims = [dims + UVec3::X, dims + UVec3::Y, dims + UVec3::Z];
        Self {
            fluid_adjacent: face_dims.map(|d| Grid3::new(d, false)),
            wall: face_dims.map(|d| Grid3::new(d, false)),
            scratch: face_dims.map(|d| Grid3::new(d, 0.0)),
        }
    }

    pub fn extrapolate(&mut self, mac: &mut MacGrid) {
        let axes = [IVec3::X, IVec3::Y, IVec3::Z];
        for (n, axis) in axes.into_iter().enumerate() {
            let faces = match n {
                0 => &mut mac.u_x,
                1 => &mut mac.u_y,
                _ => &mut mac.u_z,
            };
            mark_faces(
                &mut self.fluid_adjacent[n],
                &mut self.wall[n],
                &mac.cell_type,
                axis,
            );
            sweep_axis(
                faces,
                &self.fluid_adjacent[n],
                &self.wall[n],
                &mut self.scratch[n],
            );
        }
    }
}

/// Classify every face of one lattice: fluid-adjacent if either cell along
/// the axis is FLUID, wall if both are SOLID or off-domain.
fn mark_faces(
    fluid_adjacent: &mut Grid3<bool>,
    wall: &mut Grid3<bool>,
    cell_type: &Grid3<CellType>,
    axis: IVec3,
) {
    let face_dims = fluid_adjacent.dims();
    let slab = (face_dims.x * face_dims.y) as usize;

    let classify = |face: IVec3| -> (bool, bool) {
        let back = face - axis;
        let front = face;
        let back_in = cell_type.in_bounds(back.x, back.y, back.z);
        let front_in = cell_type.in_bounds(front.x, front.y, front.z);
        let adjacent = (back_in && cell_type.get(back.x, back.y, back.z) == CellType::Fluid)
            || (front_in && cell_type.get(front.x, front.y, front.z) == CellType::Fluid);
        let walled = (!back_in || cell_type.get(back.x, back.y, back.z) == CellType::Solid)
            && (!front_in || cell_type.get(front.x, front.y, front.z) == CellType::Solid);
        (adjacent, walled)
    };

    fluid_adjacent
        .as_mut_slice()
        .par_chunks_mut(slab)
        .zip(wall.as_mut_slice().par_chunks_mut(slab))
        .enumerate()
        .for_each(|(k, (adj_plane, wall_plane))| {
            for j in 0..face_dims.y as i32 {
                for i in 0..face_dims.x as i32 {
                    let (adjacent, walled) = classify(IVec3::new(i, j, k as i32));
                    let flat = (j * face_dims.x as i32 + i) as usize;
                    adj_plane[flat] = adjacent;
                    wall_plane[flat] = walled;
                }
            }
        });
}

/// One extrapolation sweep. Written faces are exactly the walled,
/// non-fluid-adjacent ones; sources are exactly the fluid-adjacent ones, so
/// reading the pre-sweep values through `scratch` keeps the pass
/// order-independent.
fn sweep_axis(
    faces: &mut Grid3<f32>,
    fluid_adjacent: &Grid3<bool>,
    wall: &Grid3<bool>,
    scratch: &mut Grid3<f32>,
) {
    let face_dims = faces.dims();
    let slab = (face_dims.x * face_dims.y) as usize;
    scratch.copy_from(faces);

    let source: &Grid3<f32> = faces;
    scratch
        .as_mut_slice()
        .par_chunks_mut(slab)
        .enumerate()
        .for_each(|(k, plane)| {
            let k = k as i32;
            for j in 0..face_dims.y as i32 {
                for i in 0..face_dims.x as i32 {
                    let face = IVec3::new(i, j, k);
                    if fluid_adjacent.get(i, j, k) || !wall.get(i, j, k) {
                        continue;
                    }
                    let mut sum = 0.0;
                    let mut count = 0u32;
                    for n in [
                        face - IVec3::X,
                        face + IVec3::X,
                        face - IVec3::Y,
                        face + IVec3::Y,
                        face - IVec3::Z,
                        face + IVec3::Z,
                    ] {
                        if fluid_adjacent.in_bounds(n.x, n.y, n.z)
                            && fluid_adjacent.get(n.x, n.y, n.z)
                        {
                            sum += source.get(n.x, n.y, n.z);
                            count += 1;
                        }
                    }
                    if count > 0 {
                        plane[(j * face_dims.x as i32 + i) as usize] = sum / count as f32;
                    }
                }
            }
        });

    faces.copy_from(scratch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_face_takes_fluid_neighbor_mean() {
        let dims = UVec3::splat(6);
        let mut mac = MacGrid::new(dims);
        // Everything solid except one fluid cell at (2,2,2).
        mac.cell_type.fill(CellType::Solid);
        mac.cell_type.set(2, 2, 2, CellType::Fluid);

        // Faces of the fluid cell carry velocity 2.0.
        mac.u_x.set(2, 2, 2, 2.0);
        mac.u_x.set(3, 2, 2, 2.0);

        let mut ex = Extrapolator::new(dims);
        ex.extrapolate(&mut mac);

        // Face (2,3,2) is wall (both cells solid); its only fluid-adjacent
        // face neighbor is (2,2,2), so it takes that value.
        assert_eq!(mac.u_x.get(2, 3, 2), 2.0);
        // A face far from any fluid stays untouched.
        assert_eq!(mac.u_x.get(5, 5, 5), 0.0);
    }

    #[test]
    fn fluid_adjacent_faces_are_preserved() {
        let dims = UVec3::splat(6);
        let mut mac = MacGrid::new(dims);
        mac.cell_type.fill(CellType::Solid);
        mac.cell_type.set(2, 2, 2, CellType::Fluid);
        mac.u_x.set(2, 2, 2, 7.0);

        let mut ex = Extrapolator::new(dims);
        ex.extrapolate(&mut mac);

        assert_eq!(mac.u_x.get(2, 2, 2), 7.0);
    }
}
