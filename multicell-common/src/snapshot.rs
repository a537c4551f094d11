use serde::{Deserialize, Serialize};

/// Summary of one substrate at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubstrateSummary {
    pub name: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// One agent as written into a snapshot or the final-state table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: u64,
    pub type_name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub radius: f64,
    pub total_volume: f64,
    pub state: String,
    pub damage: f64,
    pub attached: usize,
}

/// A snapshot of the simulation state and metrics at a specific time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Simulation time in minutes.
    pub time: f64,
    pub total_agents: u32,
    pub alive: u32,
    pub dying: u32,
    /// Agents whose death model finished and that await removal.
    pub dead: u32,
    /// Agent count per cell type, in definition order.
    pub counts_by_type: Vec<(String, u32)>,
    /// Number of distinct attached pairs.
    pub attached_pairs: u32,
    pub substrates: Vec<SubstrateSummary>,
    /// Per-agent records; `None` unless positions are saved in snapshots.
    #[serde(default)]
    pub agents: Option<Vec<AgentRecord>>,
}
