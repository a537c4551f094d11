use serde::{Deserialize, Serialize};

/// Runtime parameters derived from the configuration, read every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    // Domain
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub z_min: f64,
    pub z_max: f64,
    pub two_dimensional: bool,

    // Diffusion mesh
    pub dx: f64,
    pub voxel_dims: [usize; 3],
    pub voxel_volume: f64,

    // Mechanics grid
    pub mechanics_voxel_size: f64,
    pub inv_mechanics_voxel_size: f64,
    pub mechanics_dims: [usize; 3],
    pub num_mechanics_voxels: usize,

    // Time
    pub dt_diffusion: f64,
    pub dt_mechanics: f64,
    pub dt_phenotype: f64,
    pub mechanics_every: u64, // in diffusion substeps
    pub phenotype_every: u64, // in diffusion substeps
    pub time_step: u64,       // Current diffusion substep number

    pub seed: u64,
}

impl SimParams {
    /// True when the position lies inside the domain box.
    pub fn contains(&self, p: crate::Vec3) -> bool {
        p.x >= self.x_min
            && p.x <= self.x_max
            && p.y >= self.y_min
            && p.y <= self.y_max
            && (self.two_dimensional || (p.z >= self.z_min && p.z <= self.z_max))
    }
}
