use crate::field::Field;
use crate::intracellular::MetabolicModel;
use crate::phenotype::Phenotype;
use multicell_common::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable agent identity. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which update phases still apply to an agent.
///
/// `Alive` agents run every phase. `Dying` agents have their phenotype rule
/// disabled but keep running the death model, mechanics and contacts.
/// `Dead` agents are waiting to be removed from the population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifeState {
    Alive,
    Dying,
    Dead,
}

impl LifeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifeState::Alive => "alive",
            LifeState::Dying => "dying",
            LifeState::Dead => "dead",
        }
    }
}

/// A simulated cell.
#[derive(Debug, Clone)]
pub struct Cell {
    pub id: CellId,
    /// Index into the cell definition table.
    pub type_id: usize,
    pub position: Vec3,
    pub velocity: Vec3,
    pub previous_velocity: Vec3,
    pub phenotype: Phenotype,
    pub state: LifeState,
    /// Back-references to attached partners; the population owns every cell.
    pub attached_cells: Vec<CellId>,
    pub custom_data: BTreeMap<String, f64>,
    pub metabolism: Option<Box<dyn MetabolicModel>>,
}

impl Cell {
    pub fn new(id: CellId, type_id: usize, position: Vec3, phenotype: Phenotype) -> Self {
        Cell {
            id,
            type_id,
            position,
            velocity: Vec3::zero(),
            previous_velocity: Vec3::zero(),
            phenotype,
            state: LifeState::Alive,
            attached_cells: Vec::new(),
            custom_data: BTreeMap::new(),
            metabolism: None,
        }
    }

    #[inline(always)]
    pub fn radius(&self) -> f64 {
        self.phenotype.geometry.radius
    }

    pub fn is_attached_to(&self, other: CellId) -> bool {
        self.attached_cells.contains(&other)
    }

    /// Custom variable, or 0 when it was never set.
    pub fn custom(&self, name: &str) -> f64 {
        self.custom_data.get(name).copied().unwrap_or(0.0)
    }

    pub fn set_custom(&mut self, name: &str, value: f64) {
        self.custom_data.insert(name.to_string(), value);
    }

    pub fn nearest_density_vector<'f>(&self, field: &'f Field) -> &'f [f64] {
        field.nearest_density_vector(self.position)
    }

    pub fn nearest_gradient(&self, field: &Field, substrate: usize) -> Vec3 {
        field.nearest_gradient(substrate, self.position)
    }
}
