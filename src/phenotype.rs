//! The phenotype bundle owned by every agent, and the standard cycle, death
//! and volume models that advance it.
//!
//! Rates are per minute, volumes in cubic microns. Per-substrate vectors in
//! [`Secretion`] always have one entry per field substrate.

use multicell_common::{ConfigError, CycleModelKind, PhenotypeConfig, Vec3};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Cells lysing below this total volume are removed.
pub const CELL_REMOVAL_THRESHOLD_VOLUME: f64 = 20.0;

const FOUR_THIRDS_PI: f64 = 4.188790204786391;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Live,
    Ki67Negative,
    Ki67Positive,
    Arrested,
    Apoptotic,
    NecroticSwelling,
    NecroticLysed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeathModel {
    Apoptosis,
    Necrosis,
}

/// Outcome of one cycle/death advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    None,
    Divide,
    Died(DeathModel),
    Remove,
}

#[derive(Debug, Clone)]
pub struct Cycle {
    pub model: CycleModelKind,
    pub phase: CyclePhase,
    pub elapsed_time_in_phase: f64,
    /// Exit rate of the first phase; the division rate for the live model.
    pub rate: f64,
    pub ki67_positive_duration: f64,
}

impl Cycle {
    fn starting_phase(model: CycleModelKind) -> CyclePhase {
        match model {
            CycleModelKind::Live => CyclePhase::Live,
            CycleModelKind::Ki67Basic => CyclePhase::Ki67Negative,
            CycleModelKind::Arrested => CyclePhase::Arrested,
        }
    }

    /// Advances a living cycle. Returns true when the cell should divide.
    pub fn advance<R: Rng>(&mut self, dt: f64, rng: &mut R) -> bool {
        match self.phase {
            CyclePhase::Live => {
                if rng.random::<f64>() < self.rate * dt {
                    self.elapsed_time_in_phase = 0.0;
                    return true;
                }
                self.elapsed_time_in_phase += dt;
            }
            CyclePhase::Ki67Negative => {
                self.elapsed_time_in_phase += dt;
                if rng.random::<f64>() < self.rate * dt {
                    self.phase = CyclePhase::Ki67Positive;
                    self.elapsed_time_in_phase = 0.0;
                }
            }
            CyclePhase::Ki67Positive => {
                self.elapsed_time_in_phase += dt;
                // fixed duration, divides at exit
                if self.elapsed_time_in_phase > self.ki67_positive_duration - 0.5 * dt {
                    self.phase = CyclePhase::Ki67Negative;
                    self.elapsed_time_in_phase = 0.0;
                    return true;
                }
            }
            _ => self.elapsed_time_in_phase += dt,
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct Death {
    pub apoptosis_rate: f64,
    pub necrosis_rate: f64,
    pub apoptosis_duration: f64,
    pub dead: bool,
    pub model: Option<DeathModel>,
}

impl Death {
    /// Draws against each death hazard, apoptosis first.
    pub fn check_for_death<R: Rng>(&self, dt: f64, rng: &mut R) -> Option<DeathModel> {
        if self.dead {
            return None;
        }
        if rng.random::<f64>() < self.apoptosis_rate * dt {
            return Some(DeathModel::Apoptosis);
        }
        if rng.random::<f64>() < self.necrosis_rate * dt {
            return Some(DeathModel::Necrosis);
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub total: f64,
    pub fluid: f64,
    pub solid: f64,
    pub nuclear: f64,
    pub nuclear_fluid: f64,
    pub nuclear_solid: f64,
    pub cytoplasmic: f64,
    pub cytoplasmic_fluid: f64,
    pub cytoplasmic_solid: f64,
    pub fluid_fraction: f64,
    pub calcified_fraction: f64,

    pub target_solid_nuclear: f64,
    pub target_solid_cytoplasmic: f64,
    pub target_fluid_fraction: f64,
    pub target_cytoplasmic_to_nuclear_ratio: f64,

    pub fluid_change_rate: f64,
    pub nuclear_biomass_change_rate: f64,
    pub cytoplasmic_biomass_change_rate: f64,
    pub calcification_rate: f64,

    pub rupture_volume: f64,
}

impl Volume {
    pub fn new(total: f64, nuclear: f64, fluid_fraction: f64) -> Self {
        let fluid = fluid_fraction * total;
        let nuclear_fluid = fluid_fraction * nuclear;
        let cytoplasmic = total - nuclear;
        let cytoplasmic_fluid = fluid_fraction * cytoplasmic;
        let mut v = Volume {
            total,
            fluid,
            solid: total - fluid,
            nuclear,
            nuclear_fluid,
            nuclear_solid: nuclear - nuclear_fluid,
            cytoplasmic,
            cytoplasmic_fluid,
            cytoplasmic_solid: cytoplasmic - cytoplasmic_fluid,
            fluid_fraction,
            calcified_fraction: 0.0,
            target_solid_nuclear: nuclear - nuclear_fluid,
            target_solid_cytoplasmic: cytoplasmic - cytoplasmic_fluid,
            target_fluid_fraction: fluid_fraction,
            target_cytoplasmic_to_nuclear_ratio: cytoplasmic / (1e-16 + nuclear),
            fluid_change_rate: 0.0,
            nuclear_biomass_change_rate: 0.0,
            cytoplasmic_biomass_change_rate: 0.0,
            calcification_rate: 0.0,
            rupture_volume: 2.0 * total,
        };
        v.set_live_rates();
        v
    }

    pub fn set_live_rates(&mut self) {
        self.fluid_change_rate = 3.0 / 60.0;
        self.nuclear_biomass_change_rate = 0.33 / 60.0;
        self.cytoplasmic_biomass_change_rate = 0.27 / 60.0;
        self.calcification_rate = 0.0;
    }

    /// Relaxes every compartment toward its target, then recomputes totals.
    pub fn update(&mut self, dt: f64) {
        self.fluid += dt * self.fluid_change_rate * (self.target_fluid_fraction * self.total - self.fluid);
        self.fluid = self.fluid.max(0.0);
        self.nuclear_fluid = (self.nuclear / self.total.max(1e-16)) * self.fluid;
        self.cytoplasmic_fluid = self.fluid - self.nuclear_fluid;

        self.nuclear_solid += dt * self.nuclear_biomass_change_rate * (self.target_solid_nuclear - self.nuclear_solid);
        self.nuclear_solid = self.nuclear_solid.max(0.0);

        self.target_solid_cytoplasmic = self.target_cytoplasmic_to_nuclear_ratio * self.target_solid_nuclear;
        self.cytoplasmic_solid +=
            dt * self.cytoplasmic_biomass_change_rate * (self.target_solid_cytoplasmic - self.cytoplasmic_solid);
        self.cytoplasmic_solid = self.cytoplasmic_solid.max(0.0);

        self.solid = self.nuclear_solid + self.cytoplasmic_solid;
        self.nuclear = self.nuclear_solid + self.nuclear_fluid;
        self.cytoplasmic = self.cytoplasmic_solid + self.cytoplasmic_fluid;
        self.calcified_fraction += dt * self.calcification_rate * (1.0 - self.calcified_fraction);
        self.total = self.cytoplasmic + self.nuclear;
        self.fluid_fraction = self.fluid / (1e-16 + self.total);
    }

    /// Halves the current compartments. Targets are kept so daughters regrow.
    pub fn divide(&mut self) {
        self.total *= 0.5;
        self.solid *= 0.5;
        self.fluid *= 0.5;
        self.nuclear *= 0.5;
        self.nuclear_fluid *= 0.5;
        self.nuclear_solid *= 0.5;
        self.cytoplasmic *= 0.5;
        self.cytoplasmic_fluid *= 0.5;
        self.cytoplasmic_solid *= 0.5;
        self.rupture_volume *= 0.5;
    }
}

#[derive(Debug, Clone)]
pub struct Geometry {
    pub radius: f64,
    pub nuclear_radius: f64,
    pub surface_area: f64,
}

impl Geometry {
    pub fn from_volume(volume: &Volume) -> Self {
        let mut g = Geometry { radius: 0.0, nuclear_radius: 0.0, surface_area: 0.0 };
        g.update(volume);
        g
    }

    pub fn update(&mut self, volume: &Volume) {
        self.radius = (volume.total / FOUR_THIRDS_PI).cbrt();
        self.nuclear_radius = (volume.nuclear / FOUR_THIRDS_PI).cbrt();
        // 4 pi r^2 = 3 V / r
        self.surface_area = if self.radius > 0.0 { 3.0 * volume.total / self.radius } else { 0.0 };
    }
}

/// Per-substrate secretion parameters, indexed like the field's substrates.
#[derive(Debug, Clone, Default)]
pub struct Secretion {
    pub secretion_rates: Vec<f64>,
    pub uptake_rates: Vec<f64>,
    pub saturation_densities: Vec<f64>,
    pub net_export_rates: Vec<f64>,
}

impl Secretion {
    pub fn with_substrates(n: usize) -> Self {
        Secretion {
            secretion_rates: vec![0.0; n],
            uptake_rates: vec![0.0; n],
            saturation_densities: vec![0.0; n],
            net_export_rates: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.secretion_rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secretion_rates.is_empty()
    }

    pub fn set_all_secretion_to_zero(&mut self) {
        self.secretion_rates.iter_mut().for_each(|r| *r = 0.0);
        self.net_export_rates.iter_mut().for_each(|r| *r = 0.0);
    }

    pub fn scale_all_uptake_by_factor(&mut self, factor: f64) {
        self.uptake_rates.iter_mut().for_each(|r| *r *= factor);
    }
}

#[derive(Debug, Clone)]
pub struct Motility {
    pub is_motile: bool,
    pub speed: f64,
    pub persistence_time: f64,
    /// 0 is a pure random walk, 1 follows `bias_direction` exactly.
    pub bias: f64,
    pub bias_direction: Vec3,
    pub motility_vector: Vec3,
    pub chemotaxis_index: Option<usize>,
}

impl Motility {
    /// Resamples the motility vector with probability `dt / persistence_time`.
    pub fn update_motility_vector<R: Rng>(&mut self, dt: f64, two_dimensional: bool, rng: &mut R) {
        if !self.is_motile {
            self.motility_vector = Vec3::zero();
            return;
        }
        if rng.random::<f64>() >= dt / self.persistence_time.max(1e-12) {
            return;
        }
        let random = random_unit_vector(two_dimensional, rng);
        let combined = random * (1.0 - self.bias) + self.bias_direction * self.bias;
        let direction = combined.normalize_or_zero();
        self.motility_vector = direction * self.speed;
    }
}

/// Uniform direction on the unit sphere, or on the unit circle in 2D.
pub fn random_unit_vector<R: Rng>(two_dimensional: bool, rng: &mut R) -> Vec3 {
    let theta = std::f64::consts::TAU * rng.random::<f64>();
    if two_dimensional {
        return Vec3::new(theta.cos(), theta.sin(), 0.0);
    }
    let z = 2.0 * rng.random::<f64>() - 1.0;
    let r = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(r * theta.cos(), r * theta.sin(), z)
}

#[derive(Debug, Clone)]
pub struct Mechanics {
    pub cell_cell_adhesion_strength: f64,
    pub cell_cell_repulsion_strength: f64,
    pub relative_maximum_adhesion_distance: f64,
    pub attachment_elastic_constant: f64,
    pub relative_maximum_attachment_distance: f64,
    pub relative_detachment_distance: f64,
    pub maximum_number_of_attachments: usize,
}

/// Accumulated damage with first-order repair.
#[derive(Debug, Clone, Default)]
pub struct Integrity {
    pub damage: f64,
    pub damage_rate: f64,
    pub repair_rate: f64,
}

impl Integrity {
    /// Implicit update `d' = (d + dt * drive * damage_rate) / (1 + dt * repair_rate)`.
    /// The steady state for constant `drive` is `drive * damage_rate / repair_rate`.
    pub fn advance_damage(&mut self, dt: f64, drive: f64) {
        if self.damage_rate <= 1e-8 && self.repair_rate <= 1e-8 {
            return;
        }
        self.damage = (self.damage + dt * drive * self.damage_rate) / (1.0 + dt * self.repair_rate);
    }
}

#[derive(Debug, Clone)]
pub struct Phenotype {
    pub cycle: Cycle,
    pub death: Death,
    pub volume: Volume,
    pub geometry: Geometry,
    pub secretion: Secretion,
    pub motility: Motility,
    pub mechanics: Mechanics,
    pub integrity: Integrity,
    pub flagged_for_division: bool,
    pub flagged_for_removal: bool,
}

impl Phenotype {
    /// Builds a phenotype template, resolving substrate names against `substrates`.
    pub fn from_config(cfg: &PhenotypeConfig, substrates: &[String]) -> Result<Self, ConfigError> {
        let find = |name: &str| {
            substrates
                .iter()
                .position(|s| s == name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown substrate '{}'", name)))
        };

        let mut secretion = Secretion::with_substrates(substrates.len());
        for s in &cfg.secretion {
            let i = find(&s.substrate)?;
            secretion.secretion_rates[i] = s.secretion_rate;
            secretion.uptake_rates[i] = s.uptake_rate;
            secretion.saturation_densities[i] = s.saturation_density;
            secretion.net_export_rates[i] = s.net_export_rate;
        }

        let chemotaxis_index = match &cfg.motility.chemotaxis_substrate {
            Some(name) => Some(find(name)?),
            None => None,
        };

        let volume = Volume::new(cfg.volume.total, cfg.volume.nuclear, cfg.volume.fluid_fraction);
        let geometry = Geometry::from_volume(&volume);
        let m = &cfg.mechanics;

        Ok(Phenotype {
            cycle: Cycle {
                model: cfg.cycle.model,
                phase: Cycle::starting_phase(cfg.cycle.model),
                elapsed_time_in_phase: 0.0,
                rate: cfg.cycle.rate,
                ki67_positive_duration: cfg.cycle.ki67_positive_duration,
            },
            death: Death {
                apoptosis_rate: cfg.death.apoptosis_rate,
                necrosis_rate: cfg.death.necrosis_rate,
                apoptosis_duration: cfg.death.apoptosis_duration,
                dead: false,
                model: None,
            },
            volume,
            geometry,
            secretion,
            motility: Motility {
                is_motile: cfg.motility.is_motile,
                speed: cfg.motility.speed,
                persistence_time: cfg.motility.persistence_time,
                bias: cfg.motility.bias,
                bias_direction: Vec3::zero(),
                motility_vector: Vec3::zero(),
                chemotaxis_index,
            },
            mechanics: Mechanics {
                cell_cell_adhesion_strength: m.cell_cell_adhesion_strength,
                cell_cell_repulsion_strength: m.cell_cell_repulsion_strength,
                relative_maximum_adhesion_distance: m.relative_maximum_adhesion_distance,
                attachment_elastic_constant: m.attachment_elastic_constant,
                relative_maximum_attachment_distance: m.relative_maximum_attachment_distance,
                relative_detachment_distance: m.relative_detachment_distance,
                maximum_number_of_attachments: m.maximum_number_of_attachments,
            },
            integrity: Integrity {
                damage: 0.0,
                damage_rate: cfg.integrity.damage_rate,
                repair_rate: cfg.integrity.repair_rate,
            },
            flagged_for_division: false,
            flagged_for_removal: false,
        })
    }

    /// Marks the cell dead and switches it onto the given death model:
    /// motility stops, secretion stops and uptake drops tenfold.
    pub fn trigger_death(&mut self, model: DeathModel) {
        if self.death.model.is_some() {
            return;
        }
        self.death.dead = true;
        self.death.model = Some(model);
        self.flagged_for_division = false;

        self.motility.is_motile = false;
        self.motility.motility_vector = Vec3::zero();
        self.secretion.set_all_secretion_to_zero();
        self.secretion.scale_all_uptake_by_factor(0.1);

        self.cycle.elapsed_time_in_phase = 0.0;
        let v = &mut self.volume;
        match model {
            DeathModel::Apoptosis => {
                self.cycle.phase = CyclePhase::Apoptotic;
                v.target_fluid_fraction = 0.0;
                v.target_solid_nuclear = 0.0;
                v.target_cytoplasmic_to_nuclear_ratio = 0.0;
                v.fluid_change_rate = 3.0 / 60.0;
                v.cytoplasmic_biomass_change_rate = 1.0 / 60.0;
                v.nuclear_biomass_change_rate = 0.35 / 60.0;
            }
            DeathModel::Necrosis => {
                self.cycle.phase = CyclePhase::NecroticSwelling;
                v.target_fluid_fraction = 1.0;
                v.target_solid_nuclear = 0.0;
                v.target_cytoplasmic_to_nuclear_ratio = 0.0;
                v.fluid_change_rate = 0.67 / 60.0;
                v.cytoplasmic_biomass_change_rate = 0.0032 / 60.0;
                v.nuclear_biomass_change_rate = 0.013 / 60.0;
                v.calcification_rate = 0.0042 / 60.0;
                v.rupture_volume = 2.0 * v.total;
            }
        }
    }

    /// Advances cycle or death model by one phenotype step, then volume and geometry.
    pub fn advance_lifecycle<R: Rng>(&mut self, dt: f64, rng: &mut R) -> LifecycleEvent {
        let mut event = LifecycleEvent::None;

        if !self.death.dead {
            if let Some(model) = self.death.check_for_death(dt, rng) {
                self.trigger_death(model);
                event = LifecycleEvent::Died(model);
            } else if self.cycle.advance(dt, rng) {
                self.flagged_for_division = true;
                event = LifecycleEvent::Divide;
            }
        } else {
            self.cycle.elapsed_time_in_phase += dt;
            match self.cycle.phase {
                CyclePhase::Apoptotic => {
                    if self.cycle.elapsed_time_in_phase >= self.death.apoptosis_duration - 0.001 {
                        self.flagged_for_removal = true;
                        event = LifecycleEvent::Remove;
                    }
                }
                CyclePhase::NecroticSwelling => {
                    if self.volume.total > self.volume.rupture_volume {
                        self.cycle.phase = CyclePhase::NecroticLysed;
                        self.cycle.elapsed_time_in_phase = 0.0;
                        self.volume.target_fluid_fraction = 0.0;
                        self.volume.fluid_change_rate = 0.05 / 60.0;
                    }
                }
                CyclePhase::NecroticLysed => {
                    if self.volume.total < CELL_REMOVAL_THRESHOLD_VOLUME {
                        self.flagged_for_removal = true;
                        event = LifecycleEvent::Remove;
                    }
                }
                _ => {}
            }
        }

        self.volume.update(dt);
        self.geometry.update(&self.volume);
        event
    }
}
