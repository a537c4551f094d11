use multicell_common::{CycleModelKind, PhenotypeConfig, SimulationConfig, Vec3};
use multicell_engine::behavior::{CellBehavior, CellDefinition, CellDefinitions, Inert, RuleContext};
use multicell_engine::output::{write_final_state, write_snapshots, SnapshotFormat};
use multicell_engine::phenotype::{DeathModel, Phenotype};
use multicell_engine::{attach_cells, Cell, LifeState, RuleError, Simulation};
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BASE: &str = r#"
[domain]
x_min = -200.0
x_max = 200.0
y_min = -200.0
y_max = 200.0
dx = 20.0
mechanics_voxel_size = 30.0
two_dimensional = true

[[substrates]]
name = "signal"
diffusion_coefficient = 0.0
decay_rate = 0.0

[timing]
dt_diffusion = 0.01
dt_mechanics = 0.1
dt_phenotype = 6.0
total_time = 10.0
record_interval = 1.0

[output]
base_filename = "test"

[run]
seed = 7
"#;

fn config(extra: &str) -> SimulationConfig {
    toml::from_str(&format!("{}{}", BASE, extra)).unwrap()
}

fn quiet_phenotype() -> Phenotype {
    let mut pc = PhenotypeConfig::default();
    pc.cycle.model = CycleModelKind::Arrested;
    pc.death.apoptosis_rate = 0.0;
    Phenotype::from_config(&pc, &["signal".to_string()]).unwrap()
}

fn definitions(behaviors: Vec<Arc<dyn CellBehavior>>) -> CellDefinitions {
    let mut defs = CellDefinitions::new();
    for (i, behavior) in behaviors.into_iter().enumerate() {
        defs.push(CellDefinition::new(format!("type{}", i), behavior, quiet_phenotype()));
    }
    defs
}

/// Kills its agent on the first phenotype call and counts every call.
#[derive(Debug, Default)]
struct SelfDestruct {
    phenotype_calls: AtomicUsize,
    contact_calls: AtomicUsize,
}

impl CellBehavior for SelfDestruct {
    fn update_phenotype(&self, cell: &mut Cell, _: &RuleContext, _: &mut StdRng, _: f64) -> Result<(), RuleError> {
        self.phenotype_calls.fetch_add(1, Ordering::SeqCst);
        cell.phenotype.trigger_death(DeathModel::Apoptosis);
        Ok(())
    }

    fn contact(&self, _: &Cell, _: &Cell, _: &RuleContext, _: &mut Vec3) {
        self.contact_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sums how many neighbors each agent sees during its phenotype tick.
#[derive(Debug, Default)]
struct NeighborCounter {
    seen: AtomicUsize,
}

impl CellBehavior for NeighborCounter {
    fn update_phenotype(&self, cell: &mut Cell, ctx: &RuleContext, _: &mut StdRng, _: f64) -> Result<(), RuleError> {
        self.seen.fetch_add(ctx.nearby_cells(cell).len(), Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct AlwaysFails;

impl CellBehavior for AlwaysFails {
    fn update_phenotype(&self, _: &mut Cell, _: &RuleContext, _: &mut StdRng, _: f64) -> Result<(), RuleError> {
        Err(RuleError::Numerical("test failure".into()))
    }
}

#[test]
fn same_seed_gives_identical_runs() {
    let extra = r#"
[[cell_types]]
name = "wanderer"
behavior = "inert"
initial_count = 30
placement = { kind = "cluster", center = [0.0, 0.0, 0.0], std_dev = 30.0 }

[cell_types.phenotype.motility]
is_motile = true
speed = 2.0
persistence_time = 1.0
"#;
    let run = || {
        let mut sim = Simulation::new(config(extra)).unwrap();
        sim.run_until(12.0).unwrap();
        sim.agent_records()
    };
    let a = run();
    let b = run();
    assert_eq!(a.len(), 30);
    assert_eq!(a, b);
}

#[test]
fn run_until_advances_whole_steps() {
    let mut sim = Simulation::new(config("")).unwrap();
    sim.run_until(1.0).unwrap();
    assert_eq!(sim.current_step(), 100);
    assert!((sim.time() - 1.0).abs() < 1e-9);
}

#[test]
fn dying_agent_rule_is_never_called_again_but_contact_runs() {
    let killer = Arc::new(SelfDestruct::default());
    let defs = definitions(vec![killer.clone() as Arc<dyn CellBehavior>, Arc::new(Inert)]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    let victim = sim.spawn_cell(0, Vec3::new(0.0, 0.0, 0.0)).unwrap();
    let partner = sim.spawn_cell(1, Vec3::new(10.0, 0.0, 0.0)).unwrap();
    assert!(attach_cells(sim.population_mut(), victim, partner));

    sim.step().unwrap();
    assert_eq!(killer.phenotype_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.population().get(victim).unwrap().state, LifeState::Dying);
    assert!(killer.contact_calls.load(Ordering::SeqCst) >= 1);

    // Two more phenotype ticks.
    sim.run_until(12.5).unwrap();
    assert_eq!(killer.phenotype_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.population().get(victim).unwrap().state, LifeState::Dying);
}

#[test]
fn stretched_pair_detaches_after_one_mechanics_step() {
    let defs = definitions(vec![Arc::new(Inert)]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    let a = sim.spawn_cell(0, Vec3::new(0.0, 0.0, 0.0)).unwrap();
    let b = sim.spawn_cell(0, Vec3::new(20.0, 0.0, 0.0)).unwrap();
    attach_cells(sim.population_mut(), a, b);
    assert_eq!(sim.population().attached_pair_count(), 1);

    sim.step().unwrap();
    assert_eq!(sim.population().attached_pair_count(), 0);
    assert!(sim.population().get(a).unwrap().attached_cells.is_empty());
    assert!(sim.population().get(b).unwrap().attached_cells.is_empty());
}

#[test]
fn close_pair_stays_attached() {
    let defs = definitions(vec![Arc::new(Inert)]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    let a = sim.spawn_cell(0, Vec3::new(0.0, 0.0, 0.0)).unwrap();
    let b = sim.spawn_cell(0, Vec3::new(8.0, 0.0, 0.0)).unwrap();
    attach_cells(sim.population_mut(), a, b);
    sim.step().unwrap();
    assert!(sim.population().get(a).unwrap().is_attached_to(b));
    assert!(sim.population().attachments_are_symmetric());
}

#[test]
fn certain_division_halves_volume() {
    let extra = r#"
[[cell_types]]
name = "dividing"
behavior = "inert"
initial_count = 1
placement = { kind = "points", positions = [[0.0, 0.0, 0.0]] }

[cell_types.phenotype.cycle]
model = "live"
rate = 1000.0

[cell_types.phenotype.death]
apoptosis_rate = 0.0
"#;
    let mut sim = Simulation::new(config(extra)).unwrap();
    let full = sim.population().cells()[0].phenotype.volume.total;
    sim.step().unwrap();

    assert_eq!(sim.cell_count(), 2);
    for cell in sim.population().iter() {
        assert!((cell.phenotype.volume.total - 0.5 * full).abs() < 1.0);
        assert!(cell.attached_cells.is_empty());
    }
    let cells = sim.population().cells();
    assert_ne!(cells[0].id, cells[1].id);
    assert!(cells[0].position.distance(cells[1].position) > 0.0);
}

#[test]
fn single_secreting_agent_saturates_its_voxel() {
    let extra = r#"
[[cell_types]]
name = "source"
behavior = "inert"
initial_count = 1
placement = { kind = "points", positions = [[5.0, 5.0, 0.0]] }

[cell_types.phenotype.cycle]
model = "arrested"

[cell_types.phenotype.death]
apoptosis_rate = 0.0

[[cell_types.phenotype.secretion]]
substrate = "signal"
secretion_rate = 10.0
saturation_density = 1.0
"#;
    let mut sim = Simulation::new(config(extra)).unwrap();
    let voxel = sim.field().voxel_index(Vec3::new(5.0, 5.0, 0.0));
    assert_eq!(sim.field().density_at(voxel)[0], 0.0);

    let mut previous = 0.0;
    for _ in 0..500 {
        sim.step().unwrap();
        let rho = sim.field().density_at(voxel)[0];
        assert!(rho >= previous);
        assert!(rho <= 1.0 + 1e-12);
        previous = rho;
    }
    assert!(previous > 0.0);
}

#[test]
fn failing_rule_skips_agent_for_the_step() {
    let defs = definitions(vec![Arc::new(AlwaysFails)]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    let id = sim.spawn_cell(0, Vec3::new(0.0, 0.0, 0.0)).unwrap();
    sim.population_mut().get_mut(id).unwrap().velocity = Vec3::new(1.0, 0.0, 0.0);

    sim.step().unwrap();
    let cell = sim.population().get(id).unwrap();
    assert_eq!(cell.state, LifeState::Alive);
    assert_eq!(cell.position, Vec3::zero());
}

#[test]
fn agents_leaving_the_domain_are_removed() {
    let defs = definitions(vec![Arc::new(Inert)]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    let id = sim.spawn_cell(0, Vec3::new(190.0, 0.0, 0.0)).unwrap();
    sim.population_mut().get_mut(id).unwrap().velocity = Vec3::new(1.0e4, 0.0, 0.0);
    sim.step().unwrap();
    assert!(sim.population().get(id).is_none());
    assert!(sim.spawn_cell(0, Vec3::new(500.0, 0.0, 0.0)).is_err());
}

#[test]
fn snapshots_track_counts_and_are_written() {
    let extra = r#"
[[cell_types]]
name = "tumor"
behavior = "inert"
initial_count = 5

[cell_types.phenotype.cycle]
model = "arrested"

[cell_types.phenotype.death]
apoptosis_rate = 0.0
"#;
    let mut cfg = config(extra);
    cfg.output.save_positions_in_snapshot = true;
    let mut sim = Simulation::new(cfg).unwrap();
    sim.record_snapshot();
    sim.run_until(1.0).unwrap();
    sim.record_snapshot();

    let snapshots = sim.recorded_snapshots();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].counts_by_type, vec![("tumor".to_string(), 5)]);
    assert_eq!(snapshots[1].alive, 5);
    assert_eq!(snapshots[1].agents.as_ref().map(Vec::len), Some(5));
    assert_eq!(snapshots[1].substrates[0].name, "signal");

    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let base = base.to_str().unwrap();
    let path = write_snapshots(snapshots, base, SnapshotFormat::Json).unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    let back: Vec<multicell_common::Snapshot> = serde_json::from_str(&text).unwrap();
    assert_eq!(back.len(), 2);

    let path = write_final_state(&sim.agent_records(), base).unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap().lines().count(), 6);
}

#[test]
fn phenotype_rules_see_voxel_neighbors() {
    let counter = Arc::new(NeighborCounter::default());
    let defs = definitions(vec![counter.clone() as Arc<dyn CellBehavior>]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    sim.spawn_cell(0, Vec3::new(5.0, 5.0, 0.0)).unwrap();
    sim.spawn_cell(0, Vec3::new(7.0, 5.0, 0.0)).unwrap();
    sim.spawn_cell(0, Vec3::new(150.0, 150.0, 0.0)).unwrap();

    sim.step().unwrap();
    assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
}

#[test]
fn dead_neighbors_exert_no_force() {
    let defs = definitions(vec![Arc::new(Inert)]);
    let mut sim = Simulation::with_definitions(config(""), defs).unwrap();
    // Step 10 is a mechanics tick without a phenotype tick.
    sim.run_until(0.1).unwrap();
    assert_eq!(sim.current_step(), 10);

    let live = sim.spawn_cell(0, Vec3::new(0.0, 0.0, 0.0)).unwrap();
    let corpse = sim.spawn_cell(0, Vec3::new(5.0, 0.0, 0.0)).unwrap();
    let pushed = sim.spawn_cell(0, Vec3::new(100.0, 0.0, 0.0)).unwrap();
    sim.spawn_cell(0, Vec3::new(105.0, 0.0, 0.0)).unwrap();
    sim.population_mut().get_mut(corpse).unwrap().state = LifeState::Dead;

    sim.step().unwrap();
    assert_eq!(sim.population().get(live).unwrap().position, Vec3::zero());
    assert!(sim.population().get(pushed).unwrap().position.x < 100.0);
}
