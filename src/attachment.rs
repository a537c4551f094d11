//! The symmetric attachment relation and the deferred interaction log.
//!
//! Parallel phases never touch another agent's state. Anything that does
//! (docking, undocking, killing a target, writing a partner's custom data)
//! is posted to an [`InteractionLog`] and applied serially after the phase
//! barrier, in a fixed order:
//!
//! 1. attaches, sorted by `(min id, max id)`
//! 2. detaches, sorted the same way
//! 3. custom data writes, sorted by `(target, name)`
//! 4. death triggers, sorted by target
//!
//! Because detaches follow attaches, a pair that is both attached and
//! detached in the same step ends up unattached.

use crate::cell::{CellId, LifeState};
use crate::phenotype::DeathModel;
use crate::population::Population;
use std::sync::Mutex;

/// Docks `a` and `b` to each other. Idempotent; returns true if anything changed.
/// Self pairs, unknown ids and dead agents are ignored.
pub fn attach_cells(population: &mut Population, a: CellId, b: CellId) -> bool {
    if a == b {
        return false;
    }
    let (Some(ia), Some(ib)) = (population.index_of(a), population.index_of(b)) else {
        return false;
    };
    let cells = population.cells_mut();
    if cells[ia].state == LifeState::Dead || cells[ib].state == LifeState::Dead {
        return false;
    }

    let mut changed = false;
    if !cells[ia].attached_cells.contains(&b) {
        cells[ia].attached_cells.push(b);
        changed = true;
    }
    if !cells[ib].attached_cells.contains(&a) {
        cells[ib].attached_cells.push(a);
        changed = true;
    }
    changed
}

/// Undocks `a` and `b` in both directions. Returns true if anything changed.
pub fn detach_cells(population: &mut Population, a: CellId, b: CellId) -> bool {
    let mut changed = false;
    if let Some(cell) = population.get_mut(a) {
        if let Some(pos) = cell.attached_cells.iter().position(|id| *id == b) {
            cell.attached_cells.swap_remove(pos);
            changed = true;
        }
    }
    if let Some(cell) = population.get_mut(b) {
        if let Some(pos) = cell.attached_cells.iter().position(|id| *id == a) {
            cell.attached_cells.swap_remove(pos);
            changed = true;
        }
    }
    changed
}

/// Undocks `id` from every partner.
pub fn detach_all(population: &mut Population, id: CellId) {
    let partners = match population.get(id) {
        Some(cell) => cell.attached_cells.clone(),
        None => return,
    };
    for other in partners {
        detach_cells(population, id, other);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Attach(CellId, CellId),
    Detach(CellId, CellId),
    SetCustomData { target: CellId, name: String, value: f64 },
    TriggerDeath { target: CellId, model: DeathModel },
}

impl Interaction {
    fn sort_key(&self) -> (u8, u64, u64) {
        let pair = |a: &CellId, b: &CellId| (a.0.min(b.0), a.0.max(b.0));
        match self {
            Interaction::Attach(a, b) => {
                let (lo, hi) = pair(a, b);
                (0, lo, hi)
            }
            Interaction::Detach(a, b) => {
                let (lo, hi) = pair(a, b);
                (1, lo, hi)
            }
            Interaction::SetCustomData { target, .. } => (2, target.0, 0),
            Interaction::TriggerDeath { target, .. } => (3, target.0, 0),
        }
    }
}

/// Cross-agent requests collected during a parallel phase.
#[derive(Debug, Default)]
pub struct InteractionLog {
    requests: Mutex<Vec<Interaction>>,
}

impl InteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, request: Interaction) {
        // A panicking rule thread must not lose other agents' requests.
        let mut guard = match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(request);
    }

    pub fn request_attach(&self, a: CellId, b: CellId) {
        self.push(Interaction::Attach(a, b));
    }

    pub fn request_detach(&self, a: CellId, b: CellId) {
        self.push(Interaction::Detach(a, b));
    }

    pub fn request_custom_data(&self, target: CellId, name: &str, value: f64) {
        self.push(Interaction::SetCustomData { target, name: name.to_string(), value });
    }

    pub fn request_death(&self, target: CellId, model: DeathModel) {
        self.push(Interaction::TriggerDeath { target, model });
    }

    pub fn len(&self) -> usize {
        match self.requests.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the log and returns the requests in application order.
    pub fn drain_sorted(&self) -> Vec<Interaction> {
        let mut requests = match self.requests.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        requests.sort_by(|x, y| {
            x.sort_key().cmp(&y.sort_key()).then_with(|| match (x, y) {
                (
                    Interaction::SetCustomData { name: na, value: va, .. },
                    Interaction::SetCustomData { name: nb, value: vb, .. },
                ) => na.cmp(nb).then(va.total_cmp(vb)),
                _ => std::cmp::Ordering::Equal,
            })
        });
        requests.dedup();
        requests
    }
}

/// What a serial apply pass changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppliedInteractions {
    pub attached: usize,
    pub detached: usize,
    pub custom_writes: usize,
    /// Death triggers for the caller to apply; they need the behavior table.
    pub deaths: Vec<(CellId, DeathModel)>,
}

/// Applies attach, detach and custom data requests in order. Attaches that
/// would exceed either partner's `maximum_number_of_attachments` are dropped.
pub fn apply_interactions(population: &mut Population, requests: Vec<Interaction>) -> AppliedInteractions {
    let mut applied = AppliedInteractions::default();
    for request in requests {
        match request {
            Interaction::Attach(a, b) => {
                let has_room = |id: CellId| {
                    population.get(id).is_some_and(|c| {
                        c.attached_cells.contains(&if id == a { b } else { a })
                            || c.attached_cells.len() < c.phenotype.mechanics.maximum_number_of_attachments
                    })
                };
                if has_room(a) && has_room(b) && attach_cells(population, a, b) {
                    applied.attached += 1;
                }
            }
            Interaction::Detach(a, b) => {
                if detach_cells(population, a, b) {
                    applied.detached += 1;
                }
            }
            Interaction::SetCustomData { target, name, value } => {
                if let Some(cell) = population.get_mut(target) {
                    cell.custom_data.insert(name, value);
                    applied.custom_writes += 1;
                }
            }
            Interaction::TriggerDeath { target, model } => {
                if applied.deaths.iter().all(|(id, _)| *id != target) {
                    applied.deaths.push((target, model));
                }
            }
        }
    }
    debug_assert!(population.attachments_are_symmetric(), "attachment relation lost symmetry");
    applied
}
