use multicell_common::SimulationConfig;
use multicell_engine::{CellId, LifeState, Simulation};

const DOMAIN: &str = r#"
[domain]
x_min = -200.0
x_max = 200.0
y_min = -200.0
y_max = 200.0
dx = 20.0
mechanics_voxel_size = 30.0
two_dimensional = true

[timing]
dt_diffusion = 0.1
dt_mechanics = 0.1
dt_phenotype = 6.0
total_time = 10.0
record_interval = 1.0

[output]
base_filename = "test"

[run]
seed = 3
"#;

fn config(body: &str) -> SimulationConfig {
    toml::from_str(&format!("{}{}", DOMAIN, body)).unwrap()
}

/// Id of the first agent of the named type.
fn first_of(sim: &Simulation, type_name: &str) -> CellId {
    let type_id = sim.definitions().index_of(type_name).unwrap();
    sim.population().iter().find(|c| c.type_id == type_id).unwrap().id
}

const IMMUNE: &str = r#"
[[substrates]]
name = "signal"
diffusion_coefficient = 0.0
decay_rate = 0.0

[[cell_types]]
name = "immune"
behavior = "immune_attacker"
initial_count = 1
placement = { kind = "points", positions = [[20.0, 15.0, 0.0]] }

[cell_types.phenotype.cycle]
model = "arrested"

[cell_types.phenotype.death]
apoptosis_rate = 0.0

[cell_types.phenotype.mechanics]
cell_cell_adhesion_strength = 0.0
cell_cell_repulsion_strength = 0.0

[[cell_types]]
name = "target"
behavior = "inert"
initial_count = 1
placement = { kind = "points", positions = [[32.0, 15.0, 0.0]] }
custom_data = { oncoprotein = 2.0 }

[cell_types.phenotype.cycle]
model = "arrested"

[cell_types.phenotype.death]
apoptosis_rate = 0.0

[cell_types.phenotype.mechanics]
cell_cell_adhesion_strength = 0.0
cell_cell_repulsion_strength = 0.0
"#;

fn immune_config(kill_rate: f64, attachment_rate: f64, attachment_lifetime: f64) -> SimulationConfig {
    let mut cfg = config(IMMUNE);
    let parameters = &mut cfg.cell_types[0].parameters;
    parameters.insert("kill_rate", multicell_common::ParameterValue::Double(kill_rate));
    parameters.insert("attachment_rate", multicell_common::ParameterValue::Double(attachment_rate));
    parameters.insert("attachment_lifetime", multicell_common::ParameterValue::Double(attachment_lifetime));
    cfg
}

#[test]
fn immune_attachment_frequency_matches_per_tick_probability() {
    // Full signal and contact: p = 0.2 / min * 0.1 min per mechanics tick.
    let base = immune_config(0.0, 0.2, 1.0e9);
    let ticks = 10;
    let trials = 1000;
    let mut docked = 0;
    for trial in 0..trials {
        let mut cfg = base.clone();
        cfg.run.seed = trial;
        let mut sim = Simulation::new(cfg).unwrap();
        for _ in 0..ticks {
            sim.step().unwrap();
        }
        if sim.population().attached_pair_count() > 0 {
            docked += 1;
        }
        assert!(sim.population().attachments_are_symmetric());
    }
    let expected = 1.0 - (1.0f64 - 0.02).powi(ticks);
    let observed = docked as f64 / trials as f64;
    assert!((observed - expected).abs() < 0.05, "observed {} expected {}", observed, expected);
}

#[test]
fn immune_cell_kills_docked_target() {
    let mut sim = Simulation::new(immune_config(100.0, 100.0, 1.0e9)).unwrap();
    let immune = first_of(&sim, "immune");
    let target = first_of(&sim, "target");

    sim.step().unwrap();
    assert!(sim.population().get(immune).unwrap().is_attached_to(target));
    assert!(sim.population().get(target).unwrap().is_attached_to(immune));

    sim.step().unwrap();
    let victim = sim.population().get(target).unwrap();
    assert_eq!(victim.state, LifeState::Dying);
    assert!(victim.attached_cells.is_empty());
    assert!(sim.population().get(immune).unwrap().attached_cells.is_empty());
}

#[test]
fn immune_cell_ignores_low_oncoprotein_target() {
    let mut cfg = immune_config(100.0, 100.0, 1.0e9);
    cfg.cell_types[1].custom_data.insert("oncoprotein".into(), 0.1);
    let mut sim = Simulation::new(cfg).unwrap();
    for _ in 0..5 {
        sim.step().unwrap();
    }
    assert_eq!(sim.population().attached_pair_count(), 0);
    assert_eq!(sim.population().get(first_of(&sim, "target")).unwrap().state, LifeState::Alive);
}

const BIOROBOTS: &str = r#"
[[substrates]]
name = "director_signal"
diffusion_coefficient = 0.0
decay_rate = 0.0

[[substrates]]
name = "cargo_signal"
diffusion_coefficient = 0.0
decay_rate = 0.0

[[cell_types]]
name = "worker"
behavior = "worker"
initial_count = 1
placement = { kind = "points", positions = [[50.0, 50.0, 0.0]] }

[cell_types.phenotype.cycle]
model = "arrested"

[cell_types.phenotype.death]
apoptosis_rate = 0.0

[cell_types.phenotype.mechanics]
relative_detachment_distance = 3.0

[[cell_types]]
name = "cargo"
behavior = "cargo"
initial_count = 1
placement = { kind = "points", positions = [[59.0, 50.0, 0.0]] }

[cell_types.phenotype.cycle]
model = "arrested"

[cell_types.phenotype.death]
apoptosis_rate = 0.0

[cell_types.phenotype.mechanics]
relative_detachment_distance = 3.0

[[cell_types.phenotype.secretion]]
substrate = "cargo_signal"
secretion_rate = 1.0
saturation_density = 1.0
"#;

#[test]
fn worker_picks_up_and_drops_cargo() {
    let mut sim = Simulation::new(config(BIOROBOTS)).unwrap();
    let worker = first_of(&sim, "worker");
    let cargo = first_of(&sim, "cargo");
    assert_eq!(sim.population().get(cargo).unwrap().custom("receptor"), 1.0);

    sim.step().unwrap();
    assert!(sim.population().get(worker).unwrap().is_attached_to(cargo));
    assert!(sim.population().get(cargo).unwrap().is_attached_to(worker));
    assert!(sim.population().attachments_are_symmetric());
    assert_eq!(sim.population().get(cargo).unwrap().custom("receptor"), 0.0);

    // Cargo stops advertising once its receptor is spent.
    sim.step().unwrap();
    let signal = sim.field().substrate_index("cargo_signal").unwrap();
    let carried = sim.population().get(cargo).unwrap();
    assert_eq!(carried.phenotype.secretion.secretion_rates[signal], 0.0);
    assert!(!carried.phenotype.motility.is_motile);

    // Reaching the director signal releases the cargo for good.
    let director = sim.field().substrate_index("director_signal").unwrap();
    let voxel = sim.field().voxel_index(sim.population().get(worker).unwrap().position);
    sim.field_mut().density_at_mut(voxel)[director] = 1.0;
    sim.step().unwrap();
    assert_eq!(sim.population().attached_pair_count(), 0);
    assert_eq!(sim.population().get(cargo).unwrap().custom("receptor"), 0.0);

    sim.step().unwrap();
    assert_eq!(sim.population().attached_pair_count(), 0);
}

const TUMOR: &str = r#"
[[substrates]]
name = "oxygen"
diffusion_coefficient = 0.0
decay_rate = 0.0
initial_condition = OXYGEN

[[substrates]]
name = "immune_signal"
diffusion_coefficient = 0.0
decay_rate = 0.0

[[cell_types]]
name = "tumor"
behavior = "oxygen_tumor"
initial_count = 1
placement = { kind = "points", positions = [[0.0, 0.0, 0.0]] }
custom_data = { oncoprotein = 0.5 }

[cell_types.phenotype.cycle]
model = "live"
rate = 0.001

[cell_types.phenotype.death]
apoptosis_rate = 0.0
"#;

fn tumor_after_one_phenotype_tick(oxygen: f64) -> multicell_engine::Cell {
    let mut sim = Simulation::new(config(&TUMOR.replace("OXYGEN", &format!("{:.1}", oxygen)))).unwrap();
    let id = first_of(&sim, "tumor");
    sim.step().unwrap();
    sim.population().get(id).unwrap().clone()
}

#[test]
fn normoxic_tumor_proliferates_and_signals() {
    let cell = tumor_after_one_phenotype_tick(38.0);
    assert!((cell.phenotype.cycle.rate - 0.001 * 0.5).abs() < 1e-12);
    assert_eq!(cell.phenotype.death.necrosis_rate, 0.0);
    assert_eq!(cell.phenotype.secretion.secretion_rates[1], 10.0);
}

#[test]
fn hypoxic_tumor_arrests_and_turns_necrotic() {
    let cell = tumor_after_one_phenotype_tick(1.0);
    assert_eq!(cell.phenotype.cycle.rate, 0.0);
    assert!((cell.phenotype.death.necrosis_rate - 1.0 / 360.0).abs() < 1e-12);
}
