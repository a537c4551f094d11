use crate::error::ConfigError;
use crate::parameters::Parameters;
use crate::sim_params::SimParams;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// Simulation domain (microns) and mesh resolution
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DomainConfig {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    #[serde(default = "default_z_min")]
    pub z_min: f64,
    #[serde(default = "default_z_max")]
    pub z_max: f64,
    /// Edge length of a diffusion voxel.
    pub dx: f64,
    /// Edge length of a mechanics (neighbor search) voxel.
    #[serde(default = "default_mechanics_voxel_size")]
    pub mechanics_voxel_size: f64,
    /// Collapse the z axis to a single voxel and keep agents at z = 0.
    #[serde(default)]
    pub two_dimensional: bool,
}

fn default_z_min() -> f64 {
    -10.0
}

fn default_z_max() -> f64 {
    10.0
}

fn default_mechanics_voxel_size() -> f64 {
    30.0
}

// One diffusing chemical species
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SubstrateConfig {
    pub name: String,
    /// micron^2 / min
    pub diffusion_coefficient: f64,
    /// 1 / min
    pub decay_rate: f64,
    #[serde(default)]
    pub initial_condition: f64,
    /// When set, boundary voxels are held at this value.
    #[serde(default)]
    pub dirichlet_boundary: Option<f64>,
}

// Time increments (minutes)
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_dt_diffusion")]
    pub dt_diffusion: f64,
    #[serde(default = "default_dt_mechanics")]
    pub dt_mechanics: f64,
    #[serde(default = "default_dt_phenotype")]
    pub dt_phenotype: f64,
    pub total_time: f64,
    pub record_interval: f64,
}

fn default_dt_diffusion() -> f64 {
    0.01
}

fn default_dt_mechanics() -> f64 {
    0.1
}

fn default_dt_phenotype() -> f64 {
    6.0
}

/// Which built-in behavior rule a cell type runs.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    Inert,
    OxygenTumor,
    ImmuneAttacker,
    Worker,
    Cargo,
    Director,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CycleModelKind {
    /// A single live phase that divides at a constant rate.
    #[default]
    Live,
    /// Ki67- (stochastic exit) then Ki67+ (fixed duration, divides at exit).
    Ki67Basic,
    /// Never divides.
    Arrested,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CycleConfig {
    #[serde(default)]
    pub model: CycleModelKind,
    /// Exit rate of the first phase (1 / min).
    #[serde(default = "default_cycle_rate")]
    pub rate: f64,
    #[serde(default = "default_ki67_positive_duration")]
    pub ki67_positive_duration: f64,
}

fn default_cycle_rate() -> f64 {
    0.00072
}

fn default_ki67_positive_duration() -> f64 {
    15.5 * 60.0
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            model: CycleModelKind::default(),
            rate: default_cycle_rate(),
            ki67_positive_duration: default_ki67_positive_duration(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeathConfig {
    #[serde(default = "default_apoptosis_rate")]
    pub apoptosis_rate: f64,
    #[serde(default)]
    pub necrosis_rate: f64,
    #[serde(default = "default_apoptosis_duration")]
    pub apoptosis_duration: f64,
}

fn default_apoptosis_rate() -> f64 {
    5.31667e-5
}

fn default_apoptosis_duration() -> f64 {
    516.0
}

impl Default for DeathConfig {
    fn default() -> Self {
        DeathConfig {
            apoptosis_rate: default_apoptosis_rate(),
            necrosis_rate: 0.0,
            apoptosis_duration: default_apoptosis_duration(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct VolumeConfig {
    #[serde(default = "default_total_volume")]
    pub total: f64,
    #[serde(default = "default_nuclear_volume")]
    pub nuclear: f64,
    #[serde(default = "default_fluid_fraction")]
    pub fluid_fraction: f64,
}

fn default_total_volume() -> f64 {
    2494.0
}

fn default_nuclear_volume() -> f64 {
    540.0
}

fn default_fluid_fraction() -> f64 {
    0.75
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            total: default_total_volume(),
            nuclear: default_nuclear_volume(),
            fluid_fraction: default_fluid_fraction(),
        }
    }
}

// Secretion parameters for one substrate, referenced by name
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SecretionConfig {
    pub substrate: String,
    #[serde(default)]
    pub secretion_rate: f64,
    #[serde(default)]
    pub saturation_density: f64,
    #[serde(default)]
    pub uptake_rate: f64,
    #[serde(default)]
    pub net_export_rate: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MotilityConfig {
    #[serde(default)]
    pub is_motile: bool,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_persistence_time")]
    pub persistence_time: f64,
    #[serde(default)]
    pub bias: f64,
    /// Substrate whose gradient sets the bias direction.
    #[serde(default)]
    pub chemotaxis_substrate: Option<String>,
}

fn default_speed() -> f64 {
    1.0
}

fn default_persistence_time() -> f64 {
    1.0
}

impl Default for MotilityConfig {
    fn default() -> Self {
        MotilityConfig {
            is_motile: false,
            speed: default_speed(),
            persistence_time: default_persistence_time(),
            bias: 0.0,
            chemotaxis_substrate: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MechanicsConfig {
    #[serde(default = "default_adhesion_strength")]
    pub cell_cell_adhesion_strength: f64,
    #[serde(default = "default_repulsion_strength")]
    pub cell_cell_repulsion_strength: f64,
    #[serde(default = "default_relative_distance")]
    pub relative_maximum_adhesion_distance: f64,
    #[serde(default = "default_elastic_constant")]
    pub attachment_elastic_constant: f64,
    #[serde(default = "default_relative_distance")]
    pub relative_maximum_attachment_distance: f64,
    #[serde(default = "default_relative_distance")]
    pub relative_detachment_distance: f64,
    #[serde(default = "default_max_attachments")]
    pub maximum_number_of_attachments: usize,
}

fn default_adhesion_strength() -> f64 {
    0.4
}

fn default_repulsion_strength() -> f64 {
    10.0
}

fn default_relative_distance() -> f64 {
    1.25
}

fn default_elastic_constant() -> f64 {
    0.01
}

fn default_max_attachments() -> usize {
    12
}

impl Default for MechanicsConfig {
    fn default() -> Self {
        MechanicsConfig {
            cell_cell_adhesion_strength: default_adhesion_strength(),
            cell_cell_repulsion_strength: default_repulsion_strength(),
            relative_maximum_adhesion_distance: default_relative_distance(),
            attachment_elastic_constant: default_elastic_constant(),
            relative_maximum_attachment_distance: default_relative_distance(),
            relative_detachment_distance: default_relative_distance(),
            maximum_number_of_attachments: default_max_attachments(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct IntegrityConfig {
    #[serde(default)]
    pub damage_rate: f64,
    #[serde(default)]
    pub repair_rate: f64,
}

// Phenotype template for a cell type; every section is optional
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PhenotypeConfig {
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub death: DeathConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub secretion: Vec<SecretionConfig>,
    #[serde(default)]
    pub motility: MotilityConfig,
    #[serde(default)]
    pub mechanics: MechanicsConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
}

// Maps a substrate onto an exchange reaction of the metabolic model
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ExchangeConfig {
    pub substrate: String,
    pub reaction: String,
    pub vmax: f64,
    pub km: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProductConfig {
    pub reaction: String,
    pub yield_factor: f64,
}

/// Metabolic coupling for cells carrying a flux-balance model.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MetabolismConfig {
    pub exchanges: Vec<ExchangeConfig>,
    /// Uptake reaction that limits all products.
    pub limiting_reaction: String,
    #[serde(default)]
    pub products: Vec<ProductConfig>,
    #[serde(default)]
    pub growth_reaction: Option<String>,
    #[serde(default)]
    pub growth_yield: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// Uniformly inside the domain.
    #[default]
    Uniform,
    /// Normally distributed around a center.
    Cluster { center: [f64; 3], std_dev: f64 },
    /// Exactly at the listed points.
    Points { positions: Vec<[f64; 3]> },
}

// One cell type, its behavior rule and its initial population
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CellTypeConfig {
    pub name: String,
    pub behavior: BehaviorKind,
    #[serde(default)]
    pub initial_count: u32,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub phenotype: PhenotypeConfig,
    /// Initial per-cell custom variables.
    #[serde(default)]
    pub custom_data: BTreeMap<String, f64>,
    /// Named rule parameters, read by the behavior at setup.
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub metabolism: Option<MetabolismConfig>,
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    #[serde(default = "default_true")]
    pub save_snapshots: bool,
    #[serde(default = "default_true")]
    pub save_final_state: bool,
    #[serde(default)]
    pub save_positions_in_snapshot: bool,
    /// Output format: "json", "bincode", "messagepack".
    pub format: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RunConfig {
    #[serde(default)]
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig { seed: 0 }
    }
}

// Main simulation configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimulationConfig {
    pub domain: DomainConfig,
    #[serde(default)]
    pub substrates: Vec<SubstrateConfig>,
    pub timing: TimingConfig,
    #[serde(default)]
    pub cell_types: Vec<CellTypeConfig>,
    pub output: OutputConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl SimulationConfig {
    /// Loads and validates the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: SimulationConfig =
            toml::from_str(&config_str).map_err(|source| ConfigError::Parse {
                path: path_ref.display().to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross references that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.domain;
        if d.dx <= 0.0 || d.mechanics_voxel_size <= 0.0 {
            return Err(ConfigError::Invalid("dx and mechanics_voxel_size must be positive".into()));
        }
        if d.x_max <= d.x_min || d.y_max <= d.y_min || (!d.two_dimensional && d.z_max <= d.z_min) {
            return Err(ConfigError::Invalid("domain bounds must have max > min".into()));
        }

        let t = &self.timing;
        if t.dt_diffusion <= 0.0 || t.dt_mechanics <= 0.0 || t.dt_phenotype <= 0.0 {
            return Err(ConfigError::Invalid("all time steps must be positive".into()));
        }
        for (name, dt) in [("dt_mechanics", t.dt_mechanics), ("dt_phenotype", t.dt_phenotype)] {
            let ratio = dt / t.dt_diffusion;
            if ratio < 1.0 - 1e-9 || (ratio - ratio.round()).abs() > 1e-6 {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) must be an integer multiple of dt_diffusion ({})",
                    name, dt, t.dt_diffusion
                )));
            }
        }
        if t.total_time < 0.0 {
            return Err(ConfigError::Invalid("total_time must not be negative".into()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for s in &self.substrates {
            if !seen.insert(s.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate substrate '{}'", s.name)));
            }
            if s.diffusion_coefficient < 0.0 || s.decay_rate < 0.0 || s.initial_condition < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "substrate '{}' has a negative coefficient or initial value",
                    s.name
                )));
            }
        }

        for ct in &self.cell_types {
            for sec in &ct.phenotype.secretion {
                if self.substrate_index(&sec.substrate).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "cell type '{}' secretes unknown substrate '{}'",
                        ct.name, sec.substrate
                    )));
                }
            }
            if let Some(chemo) = &ct.phenotype.motility.chemotaxis_substrate {
                if self.substrate_index(chemo).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "cell type '{}' follows unknown substrate '{}'",
                        ct.name, chemo
                    )));
                }
            }
            if let Some(m) = &ct.metabolism {
                for ex in &m.exchanges {
                    if self.substrate_index(&ex.substrate).is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "cell type '{}' exchanges unknown substrate '{}'",
                            ct.name, ex.substrate
                        )));
                    }
                }
            }
            if ct.phenotype.volume.total <= 0.0 || ct.phenotype.volume.nuclear > ct.phenotype.volume.total {
                return Err(ConfigError::Invalid(format!(
                    "cell type '{}' needs 0 < nuclear <= total volume",
                    ct.name
                )));
            }
        }

        Ok(())
    }

    /// Index of a substrate by name.
    pub fn substrate_index(&self, name: &str) -> Option<usize> {
        self.substrates.iter().position(|s| s.name == name)
    }

    /// Converts the configuration into parameters used at runtime.
    pub fn get_sim_params(&self) -> SimParams {
        let d = &self.domain;
        let t = &self.timing;

        let axis = |min: f64, max: f64, h: f64| ((max - min) / h).ceil().max(1.0) as usize;
        let nx = axis(d.x_min, d.x_max, d.dx);
        let ny = axis(d.y_min, d.y_max, d.dx);
        let nz = if d.two_dimensional { 1 } else { axis(d.z_min, d.z_max, d.dx) };

        let mx = axis(d.x_min, d.x_max, d.mechanics_voxel_size);
        let my = axis(d.y_min, d.y_max, d.mechanics_voxel_size);
        let mz = if d.two_dimensional { 1 } else { axis(d.z_min, d.z_max, d.mechanics_voxel_size) };

        // A collapsed axis still has unit thickness in dx so voxel volumes stay meaningful.
        let voxel_volume = d.dx * d.dx * d.dx;

        SimParams {
            x_min: d.x_min,
            x_max: d.x_max,
            y_min: d.y_min,
            y_max: d.y_max,
            z_min: if d.two_dimensional { 0.0 } else { d.z_min },
            z_max: if d.two_dimensional { 0.0 } else { d.z_max },
            two_dimensional: d.two_dimensional,
            dx: d.dx,
            voxel_dims: [nx, ny, nz],
            voxel_volume,
            mechanics_voxel_size: d.mechanics_voxel_size,
            inv_mechanics_voxel_size: 1.0 / d.mechanics_voxel_size,
            mechanics_dims: [mx, my, mz],
            num_mechanics_voxels: mx * my * mz,
            dt_diffusion: t.dt_diffusion,
            dt_mechanics: t.dt_mechanics,
            dt_phenotype: t.dt_phenotype,
            mechanics_every: (t.dt_mechanics / t.dt_diffusion).round().max(1.0) as u64,
            phenotype_every: (t.dt_phenotype / t.dt_diffusion).round().max(1.0) as u64,
            time_step: 0,
            seed: self.run.seed,
        }
    }
}
