use anyhow::Result;
use log::{debug, error, info, trace, warn};
use multicell_common::SimulationConfig;
use multicell_engine::output::{write_final_state, write_snapshots, SnapshotFormat};
use multicell_engine::{EngineError, Simulation};
use std::time::Instant;

fn main() {
    // Initialize the logger
    env_logger::init();

    if let Err(e) = run() {
        error!("{:#}", e);
        let code = e.downcast_ref::<EngineError>().map_or(1, EngineError::exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    info!("Starting multicell engine...");

    // --- Load Configuration ---
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = SimulationConfig::load(&config_path).map_err(EngineError::from)?;
    info!("Loaded configuration from {}.", config_path);
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    // --- Initialize Simulation ---
    let mut sim = Simulation::new(config)?;
    info!("Simulation initialized with {} agents.", sim.cell_count());
    debug!("Simulation Parameters: {:#?}", sim.params());

    // --- Simulation Loop ---
    let params = sim.params().clone();
    let total_steps = (sim.config().timing.total_time / params.dt_diffusion).round() as u64;
    let record_interval = sim.config().timing.record_interval.max(0.0);
    let mut record_interval_steps = (record_interval / params.dt_diffusion).round() as u64;
    if record_interval_steps == 0 {
        warn!(
            "Record interval ({:.3} min) is smaller than the diffusion step ({:.3} min). Recording every step.",
            record_interval, params.dt_diffusion
        );
        record_interval_steps = 1;
    }
    info!(
        "Recording snapshot every {} steps ({:.2} minutes).",
        record_interval_steps,
        record_interval_steps as f64 * params.dt_diffusion
    );

    info!("Starting simulation loop for {} steps...", total_steps);
    let start_time = Instant::now();
    let mut previous_print_time = start_time;
    let print_interval_secs = 5.0;

    sim.record_snapshot();

    for step in 0..total_steps {
        let step_start_time = Instant::now();
        if let Err(e) = sim.step() {
            error!("Error during simulation step {}: {}", step + 1, e);
            return Err(e);
        }
        let step_duration = step_start_time.elapsed();

        let now = Instant::now();
        let is_record_step = (step + 1) % record_interval_steps == 0;
        let is_last_step = step + 1 == total_steps;

        if is_record_step || is_last_step {
            sim.record_snapshot();
        }

        if now.duration_since(previous_print_time).as_secs_f64() >= print_interval_secs || is_last_step {
            info!(
                "Step [{}/{}] ({:.2} min) | Agents: {} | Step Time: {:6.2} ms | Elapsed: {:.2} s",
                step + 1,
                total_steps,
                sim.time(),
                sim.cell_count(),
                step_duration.as_secs_f64() * 1000.0,
                start_time.elapsed().as_secs_f64()
            );
            previous_print_time = now;
        } else {
            trace!(
                "Step [{}/{}] completed in {:.2} ms",
                step + 1,
                total_steps,
                step_duration.as_secs_f64() * 1000.0
            );
        }
    }

    let total_duration = start_time.elapsed();
    info!(
        "Simulation finished in {:.3} seconds ({:.3} minutes).",
        total_duration.as_secs_f64(),
        total_duration.as_secs_f64() / 60.0
    );

    // --- Save Recorded Data ---
    let output = sim.config().output.clone();
    if output.save_snapshots {
        let format = SnapshotFormat::from_name(output.format.as_deref());
        write_snapshots(sim.recorded_snapshots(), &output.base_filename, format)?;
    } else {
        info!("Skipping saving snapshots as per config.");
    }

    if output.save_final_state {
        write_final_state(&sim.agent_records(), &output.base_filename)?;
    } else {
        info!("Skipping saving final state as per config.");
    }

    info!("Simulation Complete.");
    Ok(())
}
