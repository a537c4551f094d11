pub mod attachment;
pub mod behavior;
pub mod cell;
pub mod error;
pub mod field;
pub mod grid;
pub mod intracellular;
pub mod mechanics;
pub mod output;
pub mod phenotype;
pub mod population;
pub mod response;
pub mod simulation;

// Re-export key types for easier use by the binary and tests
pub use attachment::{attach_cells, detach_cells, Interaction, InteractionLog};
pub use behavior::{CellBehavior, CellDefinition, CellDefinitions, RuleContext};
pub use cell::{Cell, CellId, LifeState};
pub use error::{EngineError, RuleError};
pub use field::Field;
pub use intracellular::{FixedYieldModel, MetabolicCoupling, MetabolicModel};
pub use population::Population;
pub use simulation::Simulation;
