//! Voxel diffusion-reaction field.
//!
//! Densities are stored voxel-major (`voxel * n_substrates + substrate`) so that
//! `nearest_density_vector` is a plain slice. Diffusion is explicit with a
//! seven-point stencil; secretion and uptake use an implicit per-voxel update.

use multicell_common::{ConfigError, SimParams, SubstrateConfig, Vec3};
use rayon::prelude::*;

/// Mild negative round-off tolerated before the clamp in a debug build.
const NEGATIVE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Field {
    names: Vec<String>,
    diffusion: Vec<f64>,
    decay: Vec<f64>,
    dirichlet: Vec<Option<f64>>,
    origin: Vec3,
    dx: f64,
    dims: [usize; 3],
    voxel_volume: f64,
    densities: Vec<f64>,
    scratch: Vec<f64>,
}

impl Field {
    /// Creates the mesh and fills it with each substrate's initial condition.
    /// Fails when `dt_diffusion` is beyond the explicit stability limit.
    pub fn new(params: &SimParams, substrates: &[SubstrateConfig]) -> Result<Self, ConfigError> {
        let dims = params.voxel_dims;
        let num_voxels = dims[0] * dims[1] * dims[2];
        let n = substrates.len();
        let active_axes = dims.iter().filter(|d| **d > 1).count().max(1) as f64;

        for s in substrates {
            let limit = params.dx * params.dx / (2.0 * active_axes * s.diffusion_coefficient.max(1e-300));
            if params.dt_diffusion > limit {
                return Err(ConfigError::Invalid(format!(
                    "dt_diffusion {} exceeds the stability limit {:.4e} for substrate '{}'",
                    params.dt_diffusion, limit, s.name
                )));
            }
            if s.decay_rate * params.dt_diffusion >= 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "decay_rate * dt_diffusion must be below 1 for substrate '{}'",
                    s.name
                )));
            }
        }

        let mut densities = vec![0.0; num_voxels * n];
        for voxel in densities.chunks_mut(n.max(1)).take(num_voxels) {
            for (i, s) in substrates.iter().enumerate() {
                voxel[i] = s.initial_condition;
            }
        }

        let mut field = Field {
            names: substrates.iter().map(|s| s.name.clone()).collect(),
            diffusion: substrates.iter().map(|s| s.diffusion_coefficient).collect(),
            decay: substrates.iter().map(|s| s.decay_rate).collect(),
            dirichlet: substrates.iter().map(|s| s.dirichlet_boundary).collect(),
            origin: Vec3::new(params.x_min, params.y_min, params.z_min),
            dx: params.dx,
            dims,
            voxel_volume: params.voxel_volume,
            scratch: vec![0.0; densities.len()],
            densities,
        };
        field.apply_dirichlet();
        Ok(field)
    }

    pub fn num_substrates(&self) -> usize {
        self.names.len()
    }

    pub fn num_voxels(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn substrate_names(&self) -> &[String] {
        &self.names
    }

    pub fn substrate_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn voxel_volume(&self) -> f64 {
        self.voxel_volume
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    #[inline(always)]
    fn axis_index(&self, coord: f64, origin: f64, n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        let i = ((coord - origin) / self.dx).floor();
        if i <= 0.0 {
            0
        } else {
            (i as usize).min(n - 1)
        }
    }

    fn voxel_coords(&self, index: usize) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    #[inline(always)]
    fn linear_index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.dims[1] + j) * self.dims[0] + i
    }

    /// Voxel containing `position`, clamped to the mesh.
    #[inline(always)]
    pub fn voxel_index(&self, position: Vec3) -> usize {
        let i = self.axis_index(position.x, self.origin.x, self.dims[0]);
        let j = self.axis_index(position.y, self.origin.y, self.dims[1]);
        let k = self.axis_index(position.z, self.origin.z, self.dims[2]);
        self.linear_index(i, j, k)
    }

    pub fn voxel_center(&self, index: usize) -> Vec3 {
        let [i, j, k] = self.voxel_coords(index);
        let h = 0.5 * self.dx;
        Vec3::new(
            self.origin.x + i as f64 * self.dx + h,
            self.origin.y + j as f64 * self.dx + h,
            if self.dims[2] > 1 { self.origin.z + k as f64 * self.dx + h } else { self.origin.z },
        )
    }

    pub fn density_at(&self, voxel: usize) -> &[f64] {
        let n = self.num_substrates();
        &self.densities[voxel * n..(voxel + 1) * n]
    }

    pub fn density_at_mut(&mut self, voxel: usize) -> &mut [f64] {
        let n = self.num_substrates();
        &mut self.densities[voxel * n..(voxel + 1) * n]
    }

    /// One concentration per substrate at the voxel containing `position`.
    pub fn nearest_density_vector(&self, position: Vec3) -> &[f64] {
        self.density_at(self.voxel_index(position))
    }

    /// Central-difference gradient at the voxel containing `position`.
    /// One-sided at the mesh edge, zero along a collapsed axis.
    pub fn nearest_gradient(&self, substrate: usize, position: Vec3) -> Vec3 {
        let n = self.num_substrates();
        if substrate >= n {
            return Vec3::zero();
        }
        let [i, j, k] = self.voxel_coords(self.voxel_index(position));
        let value = |i: usize, j: usize, k: usize| self.densities[self.linear_index(i, j, k) * n + substrate];

        let axis = |idx: usize, len: usize, at: &dyn Fn(usize) -> f64| -> f64 {
            if len <= 1 {
                0.0
            } else if idx == 0 {
                (at(1) - at(0)) / self.dx
            } else if idx == len - 1 {
                (at(len - 1) - at(len - 2)) / self.dx
            } else {
                (at(idx + 1) - at(idx - 1)) / (2.0 * self.dx)
            }
        };

        Vec3::new(
            axis(i, self.dims[0], &|a| value(a, j, k)),
            axis(j, self.dims[1], &|b| value(i, b, k)),
            axis(k, self.dims[2], &|c| value(i, j, c)),
        )
    }

    /// One explicit diffusion-decay substep with no-flux (or Dirichlet) boundaries.
    pub fn diffuse(&mut self, dt: f64) {
        let n = self.num_substrates();
        if n == 0 {
            return;
        }
        let [nx, ny, nz] = self.dims;
        let inv_dx2 = 1.0 / (self.dx * self.dx);
        let densities = &self.densities;
        let diffusion = &self.diffusion;
        let decay = &self.decay;

        self.scratch
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(voxel, out)| {
                let i = voxel % nx;
                let j = (voxel / nx) % ny;
                let k = voxel / (nx * ny);
                let base = voxel * n;

                // Missing neighbors behave like a mirror, which is zero flux.
                let mut neighbors = [usize::MAX; 6];
                if i > 0 { neighbors[0] = voxel - 1; }
                if i + 1 < nx { neighbors[1] = voxel + 1; }
                if j > 0 { neighbors[2] = voxel - nx; }
                if j + 1 < ny { neighbors[3] = voxel + nx; }
                if k > 0 { neighbors[4] = voxel - nx * ny; }
                if k + 1 < nz { neighbors[5] = voxel + nx * ny; }

                for s in 0..n {
                    let c = densities[base + s];
                    let mut laplacian = 0.0;
                    for &nb in neighbors.iter().filter(|nb| **nb != usize::MAX) {
                        laplacian += densities[nb * n + s] - c;
                    }
                    let next = c + dt * (diffusion[s] * laplacian * inv_dx2 - decay[s] * c);
                    debug_assert!(
                        next > -NEGATIVE_TOLERANCE * (1.0 + c.abs()),
                        "diffusion produced a negative density {} in voxel {}",
                        next,
                        voxel
                    );
                    out[s] = next.max(0.0);
                }
            });

        std::mem::swap(&mut self.densities, &mut self.scratch);
        self.apply_dirichlet();
    }

    fn apply_dirichlet(&mut self) {
        let n = self.num_substrates();
        if self.dirichlet.iter().all(Option::is_none) {
            return;
        }
        let [nx, ny, nz] = self.dims;
        for voxel in 0..self.num_voxels() {
            let i = voxel % nx;
            let j = (voxel / nx) % ny;
            let k = voxel / (nx * ny);
            let on_boundary = i == 0
                || i + 1 == nx
                || j == 0
                || j + 1 == ny
                || (nz > 1 && (k == 0 || k + 1 == nz));
            if !on_boundary {
                continue;
            }
            for (s, value) in self.dirichlet.iter().enumerate() {
                if let Some(v) = value {
                    self.densities[voxel * n + s] = *v;
                }
            }
        }
    }

    /// Implicit source/sink update for one agent in one voxel:
    /// `rho = (rho + c1) / c2` with `c1 = dt (V/Vvox) S T`, `c2 = 1 + dt (V/Vvox)(S + U)`,
    /// followed by net export `rho += dt E / Vvox`. Secretion never overshoots `T`.
    #[allow(clippy::too_many_arguments)]
    pub fn secrete_uptake(
        &mut self,
        voxel: usize,
        cell_volume: f64,
        secretion_rates: &[f64],
        saturation_densities: &[f64],
        uptake_rates: &[f64],
        net_export_rates: &[f64],
        dt: f64,
    ) {
        let volume_ratio = cell_volume / self.voxel_volume;
        let inv_voxel_volume = 1.0 / self.voxel_volume;
        let rho = self.density_at_mut(voxel);
        for s in 0..rho.len().min(secretion_rates.len()) {
            let secretion = secretion_rates[s];
            let uptake = uptake_rates[s];
            let export = net_export_rates[s];
            if secretion == 0.0 && uptake == 0.0 && export == 0.0 {
                continue;
            }
            let c1 = dt * volume_ratio * secretion * saturation_densities[s];
            let c2 = 1.0 + dt * volume_ratio * (secretion + uptake);
            let mut value = (rho[s] + c1) / c2;
            value += dt * export * inv_voxel_volume;
            debug_assert!(value > -NEGATIVE_TOLERANCE, "net export drove density negative");
            rho[s] = value.max(0.0);
        }
    }

    pub fn total(&self, substrate: usize) -> f64 {
        let n = self.num_substrates();
        self.densities.iter().skip(substrate).step_by(n.max(1)).sum::<f64>() * self.voxel_volume
    }

    pub fn mean(&self, substrate: usize) -> f64 {
        self.summary(substrate).0
    }

    /// (mean, min, max) over all voxels.
    pub fn summary(&self, substrate: usize) -> (f64, f64, f64) {
        let n = self.num_substrates();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for v in self.densities.iter().skip(substrate).step_by(n.max(1)) {
            sum += v;
            min = min.min(*v);
            max = max.max(*v);
        }
        let count = self.num_voxels().max(1) as f64;
        (sum / count, min, max)
    }
}
