pub mod config;
pub mod error;
pub mod parameters;
pub mod sim_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{
    BehaviorKind, CellTypeConfig, CycleConfig, CycleModelKind, DeathConfig, DomainConfig,
    ExchangeConfig, IntegrityConfig, MechanicsConfig, MetabolismConfig, MotilityConfig,
    OutputConfig, PhenotypeConfig, Placement, ProductConfig, RunConfig, SecretionConfig,
    SimulationConfig, SubstrateConfig, TimingConfig, VolumeConfig,
};
pub use error::ConfigError;
pub use parameters::{ParameterValue, Parameters};
pub use sim_params::SimParams;
pub use snapshot::{AgentRecord, Snapshot, SubstrateSummary};
pub use vecmath::{clamp, Vec3};
