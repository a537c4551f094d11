use crate::cell::{Cell, CellId};
use crate::population::Population;
use multicell_common::{SimParams, Vec3};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// Calculates the 1D mechanics voxel index for a given position, clamped to the grid.
#[inline(always)]
pub fn get_grid_cell_idx(pos: Vec3, params: &SimParams) -> usize {
    let [nx, ny, nz] = params.mechanics_dims;
    if nx == 0 || ny == 0 || nz == 0 {
        return 0;
    }
    let axis = |coord: f64, min: f64, n: usize| -> usize {
        let i = ((coord - min) * params.inv_mechanics_voxel_size).floor();
        if i <= 0.0 {
            0
        } else {
            (i as usize).min(n - 1)
        }
    };
    let gx = axis(pos.x, params.x_min, nx);
    let gy = axis(pos.y, params.y_min, ny);
    let gz = if nz > 1 { axis(pos.z, params.z_min, nz) } else { 0 };
    (gz * ny + gy) * nx + gx
}

/// Uniform bucket grid over the domain, rebuilt before every mechanics step.
/// Stores indices into the population's cell slice, bucketed by voxel.
#[derive(Debug)]
pub struct MechanicsGrid {
    params: SimParams,
    /// Voxel of each cell, by cell index.
    particle_grid_indices: Vec<usize>,
    cell_counts: Vec<u32>,
    cell_starts: Vec<u32>,
    /// Cell indices sorted by voxel, ascending within a voxel.
    cell_particle_indices: Vec<u32>,
    atomic_cell_write_offsets: Vec<AtomicU32>,
}

impl MechanicsGrid {
    pub fn new(params: &SimParams) -> Self {
        let n = params.num_mechanics_voxels;
        MechanicsGrid {
            params: params.clone(),
            particle_grid_indices: Vec::new(),
            cell_counts: vec![0; n],
            cell_starts: vec![0; n],
            cell_particle_indices: Vec::new(),
            atomic_cell_write_offsets: (0..n).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn num_voxels(&self) -> usize {
        self.cell_counts.len()
    }

    /// Rebuilds the buckets from current positions with a parallel counting sort.
    pub fn build_parallel(&mut self, cells: &[Cell]) {
        let num_particles = cells.len();
        let num_grid_cells = self.num_voxels();
        let params = &self.params;

        // Phase 1: voxel of each cell (parallel).
        self.particle_grid_indices.resize(num_particles, 0);
        self.particle_grid_indices
            .par_iter_mut()
            .zip(cells.par_iter())
            .for_each(|(grid_idx_out, cell)| {
                *grid_idx_out = get_grid_cell_idx(cell.position, params);
            });

        // Phase 2: count cells per voxel (serial).
        self.cell_counts.iter_mut().for_each(|c| *c = 0);
        for &grid_idx in &self.particle_grid_indices {
            self.cell_counts[grid_idx] += 1;
        }

        // Phase 3: prefix sum for bucket starts (serial).
        let mut total_sum = 0;
        for i in 0..num_grid_cells {
            self.cell_starts[i] = total_sum;
            total_sum += self.cell_counts[i];
        }
        debug_assert_eq!(total_sum as usize, num_particles);

        // Phase 4: write positions from atomic offsets (parallel), then serial write.
        self.atomic_cell_write_offsets.par_iter().for_each(|a| a.store(0, Ordering::Relaxed));
        let grid_indices = &self.particle_grid_indices;
        let starts = &self.cell_starts;
        let offsets = &self.atomic_cell_write_offsets;
        let write_data: Vec<(usize, u32)> = (0..num_particles)
            .into_par_iter()
            .map(|particle_idx| {
                let grid_idx = grid_indices[particle_idx];
                let offset = offsets[grid_idx].fetch_add(1, Ordering::Relaxed);
                ((starts[grid_idx] + offset) as usize, particle_idx as u32)
            })
            .collect();

        self.cell_particle_indices.resize(num_particles, 0);
        for (write_idx, particle_idx) in write_data {
            self.cell_particle_indices[write_idx] = particle_idx;
        }

        // Atomic offsets hand out slots in thread order; sort buckets so neighbor
        // iteration order does not depend on scheduling.
        for i in 0..num_grid_cells {
            let start = self.cell_starts[i] as usize;
            let end = start + self.cell_counts[i] as usize;
            self.cell_particle_indices[start..end].sort_unstable();
        }
    }

    /// Cell indices bucketed in `voxel`.
    pub fn cells_in_voxel(&self, voxel: usize) -> &[u32] {
        match (self.cell_starts.get(voxel), self.cell_counts.get(voxel)) {
            (Some(&start), Some(&count)) => {
                let start = start as usize;
                let end = (start + count as usize).min(self.cell_particle_indices.len());
                &self.cell_particle_indices[start.min(end)..end]
            }
            _ => &[],
        }
    }

    /// Voxel a cell was bucketed into at the last build.
    pub fn voxel_of(&self, cell_index: usize) -> Option<usize> {
        self.particle_grid_indices.get(cell_index).copied()
    }

    /// Calls `f` with the index of every other cell in the 3x3x3 voxel block around
    /// `cell_index` that lies within `max_dist_sq`. Stops early when `f` returns false.
    pub fn for_each_neighbor<F>(&self, cell_index: usize, cells: &[Cell], max_dist_sq: f64, mut f: F)
    where
        F: FnMut(usize) -> bool,
    {
        let Some(center) = self.voxel_of(cell_index) else {
            return;
        };
        let pos = cells[cell_index].position;
        let [nx, ny, nz] = self.params.mechanics_dims;
        let cx = (center % nx) as i64;
        let cy = ((center / nx) % ny) as i64;
        let cz = (center / (nx * ny)) as i64;

        for dz in -1..=1i64 {
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    let (gx, gy, gz) = (cx + dx, cy + dy, cz + dz);
                    if gx < 0 || gy < 0 || gz < 0 || gx >= nx as i64 || gy >= ny as i64 || gz >= nz as i64 {
                        continue;
                    }
                    let grid_idx = (gz as usize * ny + gy as usize) * nx + gx as usize;
                    for &neighbor in self.cells_in_voxel(grid_idx) {
                        let neighbor = neighbor as usize;
                        if neighbor == cell_index || neighbor >= cells.len() {
                            continue;
                        }
                        if pos.distance_squared(cells[neighbor].position) < max_dist_sq && !f(neighbor) {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Every agent bucketed in the same mechanics voxel as `cell_index`, itself
/// included. Approximate: voxel membership, not a radius search.
pub fn cells_in_my_container(cell_index: usize, population: &Population, grid: &MechanicsGrid) -> Vec<CellId> {
    let Some(voxel) = grid.voxel_of(cell_index) else {
        return Vec::new();
    };
    let cells = population.cells();
    grid.cells_in_voxel(voxel)
        .iter()
        .filter_map(|&i| cells.get(i as usize).map(|c| c.id))
        .collect()
}
