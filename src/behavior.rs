//! Per-type behavior rules and the cell definition table.
//!
//! Rules see the population only through a [`RuleContext`], which holds the
//! read-only in-buffer of the current phase. Anything a rule wants to change on
//! another agent goes through `ctx.log`.

use crate::attachment::InteractionLog;
use crate::cell::{Cell, CellId, LifeState};
use crate::error::RuleError;
use crate::field::Field;
use crate::grid::{cells_in_my_container, MechanicsGrid};
use crate::intracellular::MetabolicCoupling;
use crate::mechanics::{attempt_attachment, standard_elastic_contact, AttachmentRamp};
use crate::phenotype::{DeathModel, Phenotype};
use crate::population::Population;
use crate::response::{hill_response_function, linear_response_function};
use multicell_common::{BehaviorKind, CellTypeConfig, ConfigError, Parameters, SimParams, SimulationConfig, Vec3};
use rand::prelude::*;
use rand_distr::Normal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Read-only view handed to rules during a parallel phase.
pub struct RuleContext<'a> {
    pub field: &'a Field,
    pub population: &'a Population,
    /// Buckets built at the start of the current phase; `None` outside a step.
    pub grid: Option<&'a MechanicsGrid>,
    pub definitions: &'a CellDefinitions,
    pub params: &'a SimParams,
    pub log: &'a InteractionLog,
    pub time: f64,
}

impl<'a> RuleContext<'a> {
    pub fn cell(&self, id: CellId) -> Option<&'a Cell> {
        self.population.get(id)
    }

    /// Other agents sharing `cell`'s mechanics voxel, in id order.
    pub fn nearby_cells(&self, cell: &Cell) -> Vec<&'a Cell> {
        let (Some(grid), Some(index)) = (self.grid, self.population.index_of(cell.id)) else {
            return Vec::new();
        };
        cells_in_my_container(index, self.population, grid)
            .into_iter()
            .filter(|id| *id != cell.id)
            .filter_map(|id| self.population.get(id))
            .collect()
    }

    pub fn density(&self, cell: &Cell, substrate: usize) -> f64 {
        cell.nearest_density_vector(self.field).get(substrate).copied().unwrap_or(0.0)
    }
}

/// Behavior of one cell type. Every method has a no-op or standard default.
pub trait CellBehavior: Send + Sync + fmt::Debug {
    /// Called once when an agent of this type is placed at setup.
    fn initialize(&self, _cell: &mut Cell, _rng: &mut StdRng) {}

    /// Phenotype tick. Only ever called for `Alive` agents.
    fn update_phenotype(
        &self,
        _cell: &mut Cell,
        _ctx: &RuleContext,
        _rng: &mut StdRng,
        _dt: f64,
    ) -> Result<(), RuleError> {
        Ok(())
    }

    /// Mechanics tick, before velocities are accumulated.
    fn custom_rule(&self, _cell: &mut Cell, _ctx: &RuleContext, _rng: &mut StdRng, _dt: f64) -> Result<(), RuleError> {
        Ok(())
    }

    /// Sets the motility bias direction. Defaults to chemotaxis up the gradient
    /// of the phenotype's chemotaxis substrate, if it has one.
    fn update_migration_bias(&self, cell: &mut Cell, ctx: &RuleContext) {
        if let Some(s) = cell.phenotype.motility.chemotaxis_index {
            cell.phenotype.motility.bias_direction = cell.nearest_gradient(ctx.field, s).normalize_or_zero();
        }
    }

    /// Contact with an attached partner. Defaults to the elastic spring with
    /// automatic detachment.
    fn contact(&self, me: &Cell, other: &Cell, ctx: &RuleContext, velocity: &mut Vec3) {
        standard_elastic_contact(me, other, ctx.log, velocity);
    }

    /// Runs once when the agent turns from Alive to Dying.
    fn on_death(&self, _cell: &mut Cell) {}

    fn is_movable(&self) -> bool {
        true
    }
}

fn require_substrate(substrates: &[String], name: &str) -> Result<usize, RuleError> {
    substrates
        .iter()
        .position(|s| s == name)
        .ok_or_else(|| RuleError::MissingSubstrate(name.to_string()))
}

fn optional_substrate(substrates: &[String], name: &str) -> Option<usize> {
    substrates.iter().position(|s| s == name)
}

/// Standard phenotype with no rule changes.
#[derive(Debug, Default)]
pub struct Inert;

impl CellBehavior for Inert {}

/// Oxygen-dependent proliferation and necrosis, oncoprotein-scaled division,
/// an immune signal, and drug damage leading to apoptosis.
#[derive(Debug, Clone)]
pub struct OxygenTumor {
    oxygen: usize,
    immune_signal: Option<usize>,
    drug: Option<usize>,
    base_cycle_rate: f64,
    o2_proliferation_saturation: f64,
    o2_proliferation_threshold: f64,
    o2_reference: f64,
    o2_necrosis_threshold: f64,
    o2_necrosis_max: f64,
    max_necrosis_rate: f64,
    immune_signal_secretion: f64,
    drug_death_rate: f64,
    damage_half_max: f64,
    damage_hill_power: f64,
    oncoprotein_mean: f64,
    oncoprotein_sd: f64,
}

impl OxygenTumor {
    pub fn from_parameters(p: &Parameters, template: &Phenotype, substrates: &[String]) -> Result<Self, RuleError> {
        Ok(OxygenTumor {
            oxygen: require_substrate(substrates, "oxygen")?,
            immune_signal: optional_substrate(substrates, "immune_signal"),
            drug: optional_substrate(substrates, "drug"),
            base_cycle_rate: template.cycle.rate,
            o2_proliferation_saturation: p.double_or("o2_proliferation_saturation", 38.0)?,
            o2_proliferation_threshold: p.double_or("o2_proliferation_threshold", 5.0)?,
            o2_reference: p.double_or("o2_reference", 38.0)?,
            o2_necrosis_threshold: p.double_or("o2_necrosis_threshold", 5.0)?,
            o2_necrosis_max: p.double_or("o2_necrosis_max", 2.5)?,
            max_necrosis_rate: p.double_or("max_necrosis_rate", 1.0 / (6.0 * 60.0))?,
            immune_signal_secretion: p.double_or("immune_signal_secretion", 10.0)?,
            drug_death_rate: p.double_or("drug_death_rate", 0.0)?,
            damage_half_max: p.double_or("damage_half_max", 0.5)?,
            damage_hill_power: p.double_or("damage_hill_power", 2.0)?,
            oncoprotein_mean: p.double_or("oncoprotein_mean", 1.0)?,
            oncoprotein_sd: p.double_or("oncoprotein_sd", 0.25)?,
        })
    }

    /// Proliferation multiplier: 0 below the threshold, rising linearly to the
    /// reference and flat beyond the saturation.
    fn proliferation_multiplier(&self, o2: f64) -> f64 {
        let o2 = o2.min(self.o2_proliferation_saturation);
        let span = (self.o2_reference - self.o2_proliferation_threshold).max(1e-16);
        ((o2 - self.o2_proliferation_threshold) / span).max(0.0)
    }

    fn necrosis_rate(&self, o2: f64) -> f64 {
        if o2 >= self.o2_necrosis_threshold {
            return 0.0;
        }
        let span = (self.o2_necrosis_threshold - self.o2_necrosis_max).max(1e-16);
        let multiplier = ((self.o2_necrosis_threshold - o2) / span).min(1.0);
        self.max_necrosis_rate * multiplier
    }
}

impl CellBehavior for OxygenTumor {
    fn initialize(&self, cell: &mut Cell, rng: &mut StdRng) {
        if cell.custom_data.contains_key("oncoprotein") {
            return;
        }
        let value = match Normal::new(self.oncoprotein_mean, self.oncoprotein_sd) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.oncoprotein_mean,
        };
        cell.set_custom("oncoprotein", value.max(0.0));
    }

    fn update_phenotype(&self, cell: &mut Cell, ctx: &RuleContext, rng: &mut StdRng, dt: f64) -> Result<(), RuleError> {
        let densities = cell.nearest_density_vector(ctx.field);
        let o2 = densities[self.oxygen];
        let drug = self.drug.map_or(0.0, |d| densities[d]);

        if let Some(s) = self.immune_signal {
            cell.phenotype.secretion.secretion_rates[s] = self.immune_signal_secretion;
        }

        let oncoprotein = cell.custom("oncoprotein");
        cell.phenotype.cycle.rate = self.base_cycle_rate * self.proliferation_multiplier(o2) * oncoprotein;
        cell.phenotype.death.necrosis_rate = self.necrosis_rate(o2);

        cell.phenotype.integrity.advance_damage(dt, drug);
        let damage = cell.phenotype.integrity.damage;
        if !damage.is_finite() {
            return Err(RuleError::Numerical(format!("damage became {}", damage)));
        }
        let p_death = dt * self.drug_death_rate * hill_response_function(damage, self.damage_half_max, self.damage_hill_power);
        if p_death > 0.0 && rng.random::<f64>() < p_death {
            cell.phenotype.trigger_death(DeathModel::Apoptosis);
        }
        Ok(())
    }

    fn on_death(&self, cell: &mut Cell) {
        if let Some(s) = self.immune_signal {
            cell.phenotype.secretion.secretion_rates[s] = self.immune_signal_secretion;
        }
    }
}

/// Seeks the immune signal, docks to oncoprotein-expressing targets, and
/// kills them with a probability scaled by their oncoprotein level.
#[derive(Debug, Clone)]
pub struct ImmuneAttacker {
    immune_signal: Option<usize>,
    kill_rate: f64,
    attachment_lifetime: f64,
    oncoprotein_threshold: f64,
    oncoprotein_saturation: f64,
    ramp: AttachmentRamp,
}

impl ImmuneAttacker {
    pub fn from_parameters(p: &Parameters, substrates: &[String]) -> Result<Self, RuleError> {
        let oncoprotein_threshold = p.double_or("oncoprotein_threshold", 0.5)?;
        let oncoprotein_saturation = p.double_or("oncoprotein_saturation", 2.0)?;
        Ok(ImmuneAttacker {
            immune_signal: optional_substrate(substrates, "immune_signal"),
            kill_rate: p.double_or("kill_rate", 1.0 / 15.0)?,
            attachment_lifetime: p.double_or("attachment_lifetime", 60.0)?,
            oncoprotein_threshold,
            oncoprotein_saturation,
            ramp: AttachmentRamp {
                rate: p.double_or("attachment_rate", 0.2)?,
                signal_threshold: oncoprotein_threshold,
                signal_saturation: oncoprotein_saturation,
                min_distance: p.double_or("min_attachment_distance", 14.0)?,
                max_distance: p.double_or("max_attachment_distance", 18.0)?,
            },
        })
    }

    fn is_target(&self, other: &Cell) -> bool {
        other.custom("oncoprotein") > self.oncoprotein_threshold && !other.phenotype.death.dead
    }

    fn kill_probability(&self, target: &Cell, dt: f64) -> f64 {
        let oncoprotein = target.custom("oncoprotein");
        if oncoprotein < self.oncoprotein_threshold {
            return 0.0;
        }
        let scale = linear_response_function(oncoprotein, self.oncoprotein_threshold, self.oncoprotein_saturation);
        self.kill_rate * scale * dt
    }
}

impl CellBehavior for ImmuneAttacker {
    fn custom_rule(&self, cell: &mut Cell, ctx: &RuleContext, rng: &mut StdRng, dt: f64) -> Result<(), RuleError> {
        if let Some(&target_id) = cell.attached_cells.first() {
            let mut detach = false;
            if let Some(target) = ctx.cell(target_id) {
                if !target.phenotype.death.dead && rng.random::<f64>() < self.kill_probability(target, dt) {
                    ctx.log.request_death(target_id, DeathModel::Apoptosis);
                    detach = true;
                }
            }
            if rng.random::<f64>() < dt / (self.attachment_lifetime + 1e-15) {
                detach = true;
            }
            if detach {
                ctx.log.request_detach(cell.id, target_id);
                cell.phenotype.motility.is_motile = true;
            }
            return Ok(());
        }

        // The first eligible target in reach ends the search, docked or not.
        let mut engaged = false;
        for other in ctx.nearby_cells(cell) {
            if !self.is_target(other) || cell.position.distance(other.position) > self.ramp.max_distance {
                continue;
            }
            attempt_attachment(cell, other, other.custom("oncoprotein"), &self.ramp, dt, rng, ctx.log);
            engaged = true;
            break;
        }
        cell.phenotype.motility.is_motile = !engaged;
        Ok(())
    }

    fn update_migration_bias(&self, cell: &mut Cell, ctx: &RuleContext) {
        if !cell.attached_cells.is_empty() {
            cell.phenotype.motility.is_motile = false;
            return;
        }
        cell.phenotype.motility.is_motile = true;
        if let Some(s) = self.immune_signal {
            cell.phenotype.motility.bias_direction = cell.nearest_gradient(ctx.field, s).normalize_or_zero();
        }
    }
}

/// Picks up receptor-expressing cargo and hauls it up the director signal,
/// releasing it once the director signal passes the drop threshold.
#[derive(Debug, Clone)]
pub struct Worker {
    director_signal: usize,
    cargo_signal: usize,
    drop_threshold: f64,
    receptor_threshold: f64,
    attached_migration_bias: f64,
    unattached_migration_bias: f64,
}

impl Worker {
    pub fn from_parameters(p: &Parameters, substrates: &[String]) -> Result<Self, RuleError> {
        Ok(Worker {
            director_signal: require_substrate(substrates, "director_signal")?,
            cargo_signal: require_substrate(substrates, "cargo_signal")?,
            drop_threshold: p.double_or("drop_threshold", 0.4)?,
            receptor_threshold: p.double_or("receptor_threshold", 0.5)?,
            attached_migration_bias: p.double_or("attached_worker_migration_bias", 1.0)?,
            unattached_migration_bias: p.double_or("unattached_worker_migration_bias", 0.5)?,
        })
    }
}

impl CellBehavior for Worker {
    fn custom_rule(&self, cell: &mut Cell, ctx: &RuleContext, _rng: &mut StdRng, _dt: f64) -> Result<(), RuleError> {
        let mut carrying = !cell.attached_cells.is_empty();
        if carrying && ctx.density(cell, self.director_signal) > self.drop_threshold {
            for &partner in &cell.attached_cells {
                ctx.log.request_custom_data(partner, "receptor", 0.0);
                ctx.log.request_detach(cell.id, partner);
            }
            carrying = false;
        }

        if !carrying {
            for other in ctx.nearby_cells(cell) {
                if other.custom("receptor") > self.receptor_threshold && other.state != LifeState::Dead {
                    ctx.log.request_attach(cell.id, other.id);
                    ctx.log.request_custom_data(other.id, "receptor", 0.0);
                }
            }
        }
        Ok(())
    }

    fn update_migration_bias(&self, cell: &mut Cell, ctx: &RuleContext) {
        let motility = &mut cell.phenotype.motility;
        let (bias, substrate) = if cell.attached_cells.is_empty() {
            (self.unattached_migration_bias, self.cargo_signal)
        } else {
            (self.attached_migration_bias, self.director_signal)
        };
        motility.bias = bias;
        motility.bias_direction = ctx.field.nearest_gradient(substrate, cell.position).normalize_or_zero();
    }
}

/// Advertises itself with the cargo signal until a worker picks it up.
#[derive(Debug, Clone)]
pub struct Cargo {
    cargo_signal: usize,
    receptor_threshold: f64,
}

impl Cargo {
    pub fn from_parameters(p: &Parameters, substrates: &[String]) -> Result<Self, RuleError> {
        Ok(Cargo {
            cargo_signal: require_substrate(substrates, "cargo_signal")?,
            receptor_threshold: p.double_or("receptor_threshold", 0.5)?,
        })
    }
}

impl CellBehavior for Cargo {
    fn initialize(&self, cell: &mut Cell, _rng: &mut StdRng) {
        if !cell.custom_data.contains_key("receptor") {
            cell.set_custom("receptor", 1.0);
        }
    }

    fn custom_rule(&self, cell: &mut Cell, _ctx: &RuleContext, _rng: &mut StdRng, _dt: f64) -> Result<(), RuleError> {
        if cell.custom("receptor") <= self.receptor_threshold {
            cell.phenotype.secretion.secretion_rates[self.cargo_signal] = 0.0;
        }
        if !cell.attached_cells.is_empty() {
            cell.phenotype.motility.is_motile = false;
        }
        Ok(())
    }
}

/// Fixed beacon secreting the director signal.
#[derive(Debug, Default)]
pub struct Director;

impl CellBehavior for Director {
    fn is_movable(&self) -> bool {
        false
    }
}

/// Everything the engine knows about one cell type.
#[derive(Debug, Clone)]
pub struct CellDefinition {
    pub name: String,
    pub behavior: Arc<dyn CellBehavior>,
    pub phenotype: Phenotype,
    pub custom_data: BTreeMap<String, f64>,
    pub metabolism: Option<MetabolicCoupling>,
}

impl CellDefinition {
    pub fn new(name: impl Into<String>, behavior: Arc<dyn CellBehavior>, phenotype: Phenotype) -> Self {
        CellDefinition {
            name: name.into(),
            behavior,
            phenotype,
            custom_data: BTreeMap::new(),
            metabolism: None,
        }
    }

    pub fn from_config(cfg: &CellTypeConfig, substrates: &[String]) -> Result<Self, RuleError> {
        let phenotype = Phenotype::from_config(&cfg.phenotype, substrates)?;
        let p = &cfg.parameters;
        let behavior: Arc<dyn CellBehavior> = match cfg.behavior {
            BehaviorKind::Inert => Arc::new(Inert),
            BehaviorKind::OxygenTumor => Arc::new(OxygenTumor::from_parameters(p, &phenotype, substrates)?),
            BehaviorKind::ImmuneAttacker => Arc::new(ImmuneAttacker::from_parameters(p, substrates)?),
            BehaviorKind::Worker => Arc::new(Worker::from_parameters(p, substrates)?),
            BehaviorKind::Cargo => Arc::new(Cargo::from_parameters(p, substrates)?),
            BehaviorKind::Director => Arc::new(Director),
        };
        let metabolism = match &cfg.metabolism {
            Some(m) => Some(MetabolicCoupling::from_config(m, substrates)?),
            None => None,
        };
        Ok(CellDefinition {
            name: cfg.name.clone(),
            behavior,
            phenotype,
            custom_data: cfg.custom_data.clone(),
            metabolism,
        })
    }
}

/// Cell definitions indexed by type id. Built once at setup.
#[derive(Debug, Clone, Default)]
pub struct CellDefinitions {
    definitions: Vec<CellDefinition>,
}

impl CellDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SimulationConfig) -> Result<Self, RuleError> {
        let substrates: Vec<String> = config.substrates.iter().map(|s| s.name.clone()).collect();
        let definitions = config
            .cell_types
            .iter()
            .map(|ct| CellDefinition::from_config(ct, &substrates))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CellDefinitions { definitions })
    }

    /// Appends a definition and returns its type id.
    pub fn push(&mut self, definition: CellDefinition) -> usize {
        self.definitions.push(definition);
        self.definitions.len() - 1
    }

    pub fn get(&self, type_id: usize) -> Option<&CellDefinition> {
        self.definitions.get(type_id)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.definitions.iter().position(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellDefinition> {
        self.definitions.iter()
    }

    pub fn name(&self, type_id: usize) -> &str {
        self.get(type_id).map_or("unknown", |d| d.name.as_str())
    }

    /// Checks every definition's phenotype against the field's substrate count.
    pub fn validate(&self, num_substrates: usize) -> Result<(), ConfigError> {
        for d in &self.definitions {
            if d.phenotype.secretion.len() != num_substrates {
                return Err(ConfigError::Invalid(format!(
                    "cell type '{}' has {} secretion entries for {} substrates",
                    d.name,
                    d.phenotype.secretion.len(),
                    num_substrates
                )));
            }
        }
        Ok(())
    }
}
