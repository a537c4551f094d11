use crate::attachment::{apply_interactions, detach_all, InteractionLog};
use crate::behavior::{CellDefinition, CellDefinitions, RuleContext};
use crate::cell::{Cell, CellId, LifeState};
use crate::error::RuleError;
use crate::field::Field;
use crate::grid::MechanicsGrid;
use crate::mechanics::{add_potentials, integrate_position};
use crate::phenotype::{random_unit_vector, DeathModel, LifecycleEvent};
use crate::population::Population;
use anyhow::Result;
use log::{debug, info, trace, warn};
use multicell_common::{
    clamp, AgentRecord, Placement, SimParams, SimulationConfig, Snapshot, SubstrateSummary, Vec3,
};
use rand::prelude::*;
use rand_distr::Normal;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

/// Tries per division to find a daughter position inside the domain.
const MAX_PLACEMENT_ATTEMPTS: usize = 10;

/// Keep per-agent random streams of different phases apart.
const PHENOTYPE_SALT: u64 = 0x5048_454e;
const LIFECYCLE_SALT: u64 = 0x4c49_4645;
const DIVISION_SALT: u64 = 0x4449_5649;
const MECHANICS_SALT: u64 = 0x4d45_4348;

/// Random stream for one agent in one phase of one step. Independent of
/// thread count and iteration order.
fn agent_rng(seed: u64, id: CellId, step: u64, salt: u64) -> StdRng {
    let s = seed
        .wrapping_add(id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(step.wrapping_mul(0xBF58_476D_1CE4_E5B9))
        .wrapping_add(salt);
    StdRng::seed_from_u64(s)
}

fn run_phenotype_rule(
    definition: &CellDefinition,
    cell: &Cell,
    next: &mut Cell,
    ctx: &RuleContext,
    rng: &mut StdRng,
    dt: f64,
) -> Result<(), RuleError> {
    if let Some(coupling) = &definition.metabolism {
        coupling.apply(next, cell.nearest_density_vector(ctx.field))?;
    }
    definition.behavior.update_phenotype(next, ctx, rng, dt)
}

/// Owns the field, the agents and their definitions, and advances them together.
pub struct Simulation {
    config: SimulationConfig,
    params: SimParams,
    field: Field,
    population: Population,
    definitions: CellDefinitions,
    grid: MechanicsGrid,
    log: InteractionLog,
    /// Setup RNG: initial placement and `initialize` hooks.
    rng: StdRng,
    current_step: u64,
    recorded_snapshots: Vec<Snapshot>,
    /// Agents whose rule failed this step; they sit out the remaining phases.
    skipped: HashSet<CellId>,
    debris: Option<usize>,
}

impl Simulation {
    /// Builds definitions from the config's cell types and places the initial agents.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let definitions = CellDefinitions::from_config(&config)?;
        Self::with_definitions(config, definitions)
    }

    /// Like [`Simulation::new`] with a caller-supplied definition table. Initial
    /// counts of `config.cell_types[i]` are placed as type `i`.
    pub fn with_definitions(config: SimulationConfig, definitions: CellDefinitions) -> Result<Self> {
        config.validate()?;
        let params = config.get_sim_params();
        let field = Field::new(&params, &config.substrates)?;
        definitions.validate(field.num_substrates())?;

        let interaction_range = definitions
            .iter()
            .map(|d| 2.0 * d.phenotype.geometry.radius * d.phenotype.mechanics.relative_maximum_adhesion_distance)
            .fold(0.0, f64::max);
        if interaction_range > params.mechanics_voxel_size {
            warn!(
                "Mechanics voxel ({:.2} um) is smaller than the interaction range ({:.2} um); distant contacts will be missed.",
                params.mechanics_voxel_size, interaction_range
            );
        }

        let mut sim = Simulation {
            grid: MechanicsGrid::new(&params),
            rng: StdRng::seed_from_u64(params.seed),
            debris: field.substrate_index("debris"),
            config,
            params,
            field,
            population: Population::new(),
            definitions,
            log: InteractionLog::new(),
            current_step: 0,
            recorded_snapshots: Vec::new(),
            skipped: HashSet::new(),
        };
        sim.place_initial_cells()?;
        info!(
            "Initialized {} agents of {} types on a {:?} voxel mesh.",
            sim.population.len(),
            sim.definitions.len(),
            sim.field.dims()
        );
        Ok(sim)
    }

    fn place_initial_cells(&mut self) -> Result<()> {
        let cell_types = self.config.cell_types.clone();
        for (type_id, ct) in cell_types.iter().enumerate() {
            if type_id >= self.definitions.len() {
                warn!("Cell type '{}' has no definition; skipping its placement.", ct.name);
                continue;
            }
            let positions: Vec<Vec3> = match &ct.placement {
                Placement::Uniform => (0..ct.initial_count).map(|_| self.random_domain_position()).collect(),
                Placement::Cluster { center, std_dev } => {
                    let center = Vec3::from_array(*center);
                    (0..ct.initial_count).map(|_| self.cluster_position(center, *std_dev)).collect()
                }
                Placement::Points { positions } => positions.iter().map(|p| Vec3::from_array(*p)).collect(),
            };
            for position in positions {
                self.spawn_cell(type_id, position)?;
            }
            debug!("Placed initial agents of type '{}'.", ct.name);
        }
        Ok(())
    }

    fn random_domain_position(&mut self) -> Vec3 {
        let p = &self.params;
        let x = self.rng.random_range(p.x_min..p.x_max);
        let y = self.rng.random_range(p.y_min..p.y_max);
        let z = if p.two_dimensional { 0.0 } else { self.rng.random_range(p.z_min..p.z_max) };
        Vec3::new(x, y, z)
    }

    fn cluster_position(&mut self, center: Vec3, std_dev: f64) -> Vec3 {
        let Ok(normal) = Normal::new(0.0, std_dev.max(0.0)) else {
            return center;
        };
        let p = &self.params;
        let x = clamp(center.x + normal.sample(&mut self.rng), p.x_min, p.x_max);
        let y = clamp(center.y + normal.sample(&mut self.rng), p.y_min, p.y_max);
        let z = if p.two_dimensional {
            0.0
        } else {
            clamp(center.z + normal.sample(&mut self.rng), p.z_min, p.z_max)
        };
        Vec3::new(x, y, z)
    }

    /// Places a new agent of `type_id` and runs its type's `initialize` hook.
    pub fn spawn_cell(&mut self, type_id: usize, mut position: Vec3) -> Result<CellId> {
        if self.params.two_dimensional {
            position.z = 0.0;
        }
        if !self.params.contains(position) {
            anyhow::bail!("position {:?} lies outside the domain", position);
        }
        let id = self.population.spawn_cell(type_id, position, &self.definitions)?;
        let behavior = self.definitions.get(type_id).map(|d| Arc::clone(&d.behavior));
        if let (Some(behavior), Some(cell)) = (behavior, self.population.get_mut(id)) {
            behavior.initialize(cell, &mut self.rng);
        }
        Ok(id)
    }

    /// Advances every process by one diffusion substep, running the phenotype
    /// and mechanics phases when their increments are due.
    pub fn step(&mut self) -> Result<()> {
        self.params.time_step = self.current_step;
        self.skipped.clear();

        // --- 1. Diffusion ---
        self.field.diffuse(self.params.dt_diffusion);

        // --- 2. Phenotype (parallel rules, serial lifecycle) ---
        if self.current_step % self.params.phenotype_every == 0 {
            self.grid.build_parallel(self.population.cells());
            self.update_phenotypes_parallel();
            self.tombstone_new_deaths();
            self.advance_lifecycles();
        }

        // --- 3. Mechanics ---
        if self.current_step % self.params.mechanics_every == 0 {
            self.update_mechanics_parallel();
        }

        // --- 4. Agent sources and sinks ---
        self.secrete_and_uptake();

        self.current_step += 1;
        Ok(())
    }

    /// Steps until simulated time reaches `t` minutes.
    pub fn run_until(&mut self, t: f64) -> Result<()> {
        let dt = self.params.dt_diffusion;
        while self.time() + 0.5 * dt < t {
            self.step()?;
        }
        Ok(())
    }

    fn update_phenotypes_parallel(&mut self) {
        let dt = self.params.dt_phenotype;
        let seed = self.params.seed;
        let step = self.current_step;

        let results: Vec<(Cell, Option<RuleError>)> = {
            let ctx = RuleContext {
                field: &self.field,
                population: &self.population,
                grid: Some(&self.grid),
                definitions: &self.definitions,
                params: &self.params,
                log: &self.log,
                time: self.time(),
            };
            self.population
                .cells()
                .par_iter()
                .map(|cell| {
                    let mut next = cell.clone();
                    if cell.state != LifeState::Alive {
                        return (next, None);
                    }
                    let Some(definition) = ctx.definitions.get(cell.type_id) else {
                        return (next, None);
                    };
                    let mut rng = agent_rng(seed, cell.id, step, PHENOTYPE_SALT);
                    match run_phenotype_rule(definition, cell, &mut next, &ctx, &mut rng, dt) {
                        Ok(()) => (next, None),
                        Err(e) => (cell.clone(), Some(e)),
                    }
                })
                .collect()
        };

        let mut next_cells = Vec::with_capacity(results.len());
        for (cell, error) in results {
            if let Some(e) = error {
                warn!("Phenotype rule failed for cell {}: {}. Skipping it this step.", cell.id, e);
                self.skipped.insert(cell.id);
            }
            next_cells.push(cell);
        }
        self.population.swap_buffers(&mut next_cells);
    }

    /// Moves every agent whose death flag was raised while Alive onto Dying.
    fn tombstone_new_deaths(&mut self) {
        let newly_dead: Vec<(CellId, DeathModel)> = self
            .population
            .iter()
            .filter(|c| c.state == LifeState::Alive && c.phenotype.death.dead)
            .map(|c| (c.id, c.phenotype.death.model.unwrap_or(DeathModel::Apoptosis)))
            .collect();
        for (id, model) in newly_dead {
            self.enter_dying(id, model);
        }
    }

    /// Alive to Dying: starts the death model, runs the type's death hook, and
    /// releases debris when the field carries a debris substrate. No-op otherwise.
    fn enter_dying(&mut self, id: CellId, model: DeathModel) {
        let debris = self.debris;
        let Some(cell) = self.population.get_mut(id) else {
            return;
        };
        if cell.state != LifeState::Alive {
            return;
        }
        cell.phenotype.trigger_death(model);
        cell.state = LifeState::Dying;
        if let Some(definition) = self.definitions.get(cell.type_id) {
            definition.behavior.on_death(cell);
        }
        if let Some(d) = debris {
            cell.phenotype.secretion.secretion_rates[d] = 1.0;
            cell.phenotype.secretion.saturation_densities[d] = 1.0;
        }
        trace!("Cell {} is dying ({:?}).", id, model);
    }

    /// Serial cycle/death advance: removes finished agents, then divides.
    fn advance_lifecycles(&mut self) {
        let dt = self.params.dt_phenotype;
        let seed = self.params.seed;
        let step = self.current_step;

        let mut to_remove = Vec::new();
        let mut finished = Vec::new();
        let mut dividing = Vec::new();
        let mut died = Vec::new();

        for cell in self.population.cells_mut() {
            if self.skipped.contains(&cell.id) {
                continue;
            }
            if cell.state == LifeState::Dead {
                to_remove.push(cell.id);
                continue;
            }
            let mut rng = agent_rng(seed, cell.id, step, LIFECYCLE_SALT);
            match cell.phenotype.advance_lifecycle(dt, &mut rng) {
                LifecycleEvent::Divide if cell.state == LifeState::Alive => dividing.push(cell.id),
                LifecycleEvent::Died(model) => died.push((cell.id, model)),
                LifecycleEvent::Remove => {
                    cell.state = LifeState::Dead;
                    finished.push(cell.id);
                }
                _ => {}
            }
        }

        for (id, model) in died {
            self.enter_dying(id, model);
        }
        for &id in &finished {
            detach_all(&mut self.population, id);
        }
        for &id in &to_remove {
            self.population.remove_cell(id);
        }

        let mut divisions = 0;
        for id in dividing {
            if self.divide_cell(id).is_some() {
                divisions += 1;
            }
        }

        if divisions > 0 || !to_remove.is_empty() || !finished.is_empty() {
            debug!(
                "Lifecycle at step {}: {} divisions, {} finished death, {} removed. Total: {}",
                step,
                divisions,
                finished.len(),
                to_remove.len(),
                self.population.len()
            );
        }
    }

    /// Splits `parent_id` in two. The daughter is offset by half a radius along a
    /// random direction and the parent by the same amount the other way.
    fn divide_cell(&mut self, parent_id: CellId) -> Option<CellId> {
        let parent = self.population.get(parent_id)?.clone();
        let radius = parent.radius();
        let mut rng = agent_rng(self.params.seed, parent_id, self.current_step, DIVISION_SALT);

        let mut placement = None;
        for _attempt in 0..MAX_PLACEMENT_ATTEMPTS {
            let offset = random_unit_vector(self.params.two_dimensional, &mut rng) * (0.5 * radius);
            let daughter_pos = parent.position + offset;
            let parent_pos = parent.position - offset;
            if self.params.contains(daughter_pos) && self.params.contains(parent_pos) {
                placement = Some((daughter_pos, parent_pos));
                break;
            }
        }

        let Some((daughter_pos, parent_pos)) = placement else {
            debug!(
                "Could not place daughter of cell {} inside the domain after {} attempts. Skipping division.",
                parent_id, MAX_PLACEMENT_ATTEMPTS
            );
            if let Some(p) = self.population.get_mut(parent_id) {
                p.phenotype.flagged_for_division = false;
            }
            return None;
        };

        let daughter_id = self.population.allocate_id();
        let mut daughter = parent;
        daughter.id = daughter_id;
        daughter.position = daughter_pos;
        daughter.velocity = Vec3::zero();
        daughter.previous_velocity = Vec3::zero();
        daughter.attached_cells.clear();
        daughter.phenotype.flagged_for_division = false;
        daughter.phenotype.cycle.elapsed_time_in_phase = 0.0;
        daughter.phenotype.volume.divide();
        daughter.phenotype.geometry.update(&daughter.phenotype.volume);

        let p = self.population.get_mut(parent_id)?;
        p.position = parent_pos;
        p.phenotype.flagged_for_division = false;
        p.phenotype.volume.divide();
        let volume = p.phenotype.volume.clone();
        p.phenotype.geometry.update(&volume);

        self.population.insert(daughter);
        Some(daughter_id)
    }

    fn update_mechanics_parallel(&mut self) {
        let dt = self.params.dt_mechanics;
        let seed = self.params.seed;
        let step = self.current_step;
        let two_dimensional = self.params.two_dimensional;

        self.grid.build_parallel(self.population.cells());

        // Largest pair distance at which any potential is nonzero.
        let max_reach = self
            .population
            .iter()
            .map(|c| c.radius() * c.phenotype.mechanics.relative_maximum_adhesion_distance.max(1.0))
            .fold(0.0, f64::max);
        let max_dist_sq = (2.0 * max_reach) * (2.0 * max_reach);

        let results: Vec<(Cell, Option<RuleError>)> = {
            let ctx = RuleContext {
                field: &self.field,
                population: &self.population,
                grid: Some(&self.grid),
                definitions: &self.definitions,
                params: &self.params,
                log: &self.log,
                time: self.time(),
            };
            let cells = self.population.cells();
            let grid = &self.grid;
            let skipped = &self.skipped;

            cells
                .par_iter()
                .enumerate()
                .map(|(i, cell)| {
                    let mut next = cell.clone();
                    if cell.state == LifeState::Dead || skipped.contains(&cell.id) {
                        return (next, None);
                    }
                    let Some(definition) = ctx.definitions.get(cell.type_id) else {
                        return (next, None);
                    };
                    let behavior = &definition.behavior;
                    let mut rng = agent_rng(seed, cell.id, step, MECHANICS_SALT);

                    if cell.state == LifeState::Alive {
                        if let Err(e) = behavior.custom_rule(&mut next, &ctx, &mut rng, dt) {
                            return (cell.clone(), Some(e));
                        }
                    }

                    let mut velocity = Vec3::zero();
                    grid.for_each_neighbor(i, cells, max_dist_sq, |j| {
                        if cells[j].state != LifeState::Dead {
                            velocity += add_potentials(cell, &cells[j]);
                        }
                        true
                    });
                    for partner in &cell.attached_cells {
                        if let Some(other) = ctx.cell(*partner) {
                            behavior.contact(cell, other, &ctx, &mut velocity);
                        }
                    }

                    if cell.state == LifeState::Alive {
                        behavior.update_migration_bias(&mut next, &ctx);
                        next.phenotype.motility.update_motility_vector(dt, two_dimensional, &mut rng);
                        velocity += next.phenotype.motility.motility_vector;
                    }

                    next.velocity += velocity;
                    (next, None)
                })
                .collect()
        };

        let mut next_cells = Vec::with_capacity(results.len());
        for (cell, error) in results {
            if let Some(e) = error {
                warn!("Custom rule failed for cell {}: {}. Skipping it this step.", cell.id, e);
                self.skipped.insert(cell.id);
            }
            next_cells.push(cell);
        }

        // Integrate positions (parallel).
        {
            let definitions = &self.definitions;
            let skipped = &self.skipped;
            next_cells.par_iter_mut().for_each(|cell| {
                if cell.state == LifeState::Dead || skipped.contains(&cell.id) {
                    return;
                }
                let movable = definitions.get(cell.type_id).map_or(true, |d| d.behavior.is_movable());
                if !movable {
                    cell.velocity = Vec3::zero();
                    cell.previous_velocity = Vec3::zero();
                    return;
                }
                integrate_position(cell, dt, two_dimensional);
            });
        }
        self.population.swap_buffers(&mut next_cells);

        // Serial barrier: apply cross-agent requests in a fixed order.
        let requests = self.log.drain_sorted();
        let applied = apply_interactions(&mut self.population, requests);
        for &(id, model) in &applied.deaths {
            self.enter_dying(id, model);
        }

        let escaped: Vec<CellId> = self
            .population
            .iter()
            .filter(|c| !self.params.contains(c.position))
            .map(|c| c.id)
            .collect();
        for &id in &escaped {
            self.population.remove_cell(id);
        }

        if applied.attached + applied.detached + applied.deaths.len() + escaped.len() > 0 {
            debug!(
                "Mechanics at step {}: {} attached, {} detached, {} killed, {} left the domain.",
                step,
                applied.attached,
                applied.detached,
                applied.deaths.len(),
                escaped.len()
            );
        }
        debug_assert!(self.population.attachments_are_symmetric());
    }

    /// The only agent-to-field path: implicit secretion and uptake per agent.
    fn secrete_and_uptake(&mut self) {
        let dt = self.params.dt_diffusion;
        for cell in self.population.iter() {
            if cell.state == LifeState::Dead || self.skipped.contains(&cell.id) {
                continue;
            }
            let voxel = self.field.voxel_index(cell.position);
            let s = &cell.phenotype.secretion;
            self.field.secrete_uptake(
                voxel,
                cell.phenotype.volume.total,
                &s.secretion_rates,
                &s.saturation_densities,
                &s.uptake_rates,
                &s.net_export_rates,
                dt,
            );
        }
    }

    pub fn agent_records(&self) -> Vec<AgentRecord> {
        self.population
            .iter()
            .map(|c| AgentRecord {
                id: c.id.0,
                type_name: self.definitions.name(c.type_id).to_string(),
                x: c.position.x,
                y: c.position.y,
                z: c.position.z,
                radius: c.radius(),
                total_volume: c.phenotype.volume.total,
                state: c.state.as_str().to_string(),
                damage: c.phenotype.integrity.damage,
                attached: c.attached_cells.len(),
            })
            .collect()
    }

    /// Summarizes the current state without storing it.
    pub fn snapshot(&self) -> Snapshot {
        let count = |state: LifeState| self.population.iter().filter(|c| c.state == state).count() as u32;
        let counts_by_type = self
            .definitions
            .iter()
            .enumerate()
            .map(|(type_id, d)| {
                let n = self.population.iter().filter(|c| c.type_id == type_id).count() as u32;
                (d.name.clone(), n)
            })
            .collect();
        let substrates = self
            .field
            .substrate_names()
            .iter()
            .enumerate()
            .map(|(s, name)| {
                let (mean, min, max) = self.field.summary(s);
                SubstrateSummary { name: name.clone(), mean, min, max }
            })
            .collect();

        Snapshot {
            time: self.time(),
            total_agents: self.population.len() as u32,
            alive: count(LifeState::Alive),
            dying: count(LifeState::Dying),
            dead: count(LifeState::Dead),
            counts_by_type,
            attached_pairs: self.population.attached_pair_count() as u32,
            substrates,
            agents: self.config.output.save_positions_in_snapshot.then(|| self.agent_records()),
        }
    }

    pub fn record_snapshot(&mut self) {
        let snapshot = self.snapshot();
        debug!(
            "Recording snapshot at {:.2} min: {} agents ({} alive, {} dying).",
            snapshot.time, snapshot.total_agents, snapshot.alive, snapshot.dying
        );
        self.recorded_snapshots.push(snapshot);
    }

    pub fn recorded_snapshots(&self) -> &[Snapshot] {
        &self.recorded_snapshots
    }

    /// Simulated minutes elapsed.
    pub fn time(&self) -> f64 {
        self.current_step as f64 * self.params.dt_diffusion
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn field_mut(&mut self) -> &mut Field {
        &mut self.field
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    pub fn definitions(&self) -> &CellDefinitions {
        &self.definitions
    }

    pub fn cell_count(&self) -> usize {
        self.population.len()
    }
}
