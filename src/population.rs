use crate::attachment::detach_all;
use crate::behavior::CellDefinitions;
use crate::cell::{Cell, CellId};
use crate::phenotype::Phenotype;
use multicell_common::{ConfigError, Vec3};
use std::collections::HashMap;

/// Owns every agent. Agents are stored densely; `index` maps ids to slots.
#[derive(Debug, Default)]
pub struct Population {
    cells: Vec<Cell>,
    index: HashMap<CellId, usize>,
    next_id: u64,
}

impl Population {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new agent and returns its id.
    pub fn spawn(&mut self, type_id: usize, position: Vec3, phenotype: Phenotype) -> CellId {
        let id = CellId(self.next_id);
        self.next_id += 1;
        self.insert(Cell::new(id, type_id, position, phenotype));
        id
    }

    /// Spawns an agent of `type_id` from its definition: phenotype template,
    /// default custom data and a private copy of the metabolic model.
    pub fn spawn_cell(
        &mut self,
        type_id: usize,
        position: Vec3,
        definitions: &CellDefinitions,
    ) -> Result<CellId, ConfigError> {
        let definition = definitions
            .get(type_id)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown cell type index {}", type_id)))?;
        let id = self.spawn(type_id, position, definition.phenotype.clone());
        if let Some(cell) = self.get_mut(id) {
            cell.custom_data = definition.custom_data.clone();
            cell.metabolism = definition.metabolism.as_ref().map(|m| m.model.boxed_clone());
        }
        Ok(id)
    }

    /// Takes a fresh id for a cell built elsewhere (e.g. a daughter).
    pub fn allocate_id(&mut self) -> CellId {
        let id = CellId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, cell: Cell) {
        debug_assert!(!self.index.contains_key(&cell.id), "duplicate cell id {}", cell.id);
        self.next_id = self.next_id.max(cell.id.0 + 1);
        self.index.insert(cell.id, self.cells.len());
        self.cells.push(cell);
    }

    /// Removes an agent after clearing every attachment back-reference to it.
    pub fn remove_cell(&mut self, id: CellId) -> Option<Cell> {
        self.index.get(&id)?;
        detach_all(self, id);
        let slot = self.index.remove(&id)?;
        let cell = self.cells.swap_remove(slot);
        if slot < self.cells.len() {
            let moved = self.cells[slot].id;
            self.index.insert(moved, slot);
        }
        Some(cell)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn index_of(&self, id: CellId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn get(&self, id: CellId) -> Option<&Cell> {
        self.index_of(id).map(|i| &self.cells[i])
    }

    pub fn get_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        let i = self.index_of(id)?;
        Some(&mut self.cells[i])
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    /// Replaces all cells with the output buffer of a parallel phase.
    /// The buffer must hold the same ids in the same order.
    pub fn swap_buffers(&mut self, next: &mut Vec<Cell>) {
        debug_assert_eq!(next.len(), self.cells.len());
        debug_assert!(next.iter().zip(&self.cells).all(|(a, b)| a.id == b.id));
        std::mem::swap(&mut self.cells, next);
    }

    /// Number of distinct attached pairs.
    pub fn attached_pair_count(&self) -> usize {
        self.cells.iter().map(|c| c.attached_cells.len()).sum::<usize>() / 2
    }

    /// True when every attachment is mirrored by its partner.
    pub fn attachments_are_symmetric(&self) -> bool {
        self.cells.iter().all(|c| {
            c.attached_cells
                .iter()
                .all(|other| self.get(*other).is_some_and(|o| o.is_attached_to(c.id)))
        })
    }
}
