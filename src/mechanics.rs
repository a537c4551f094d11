//! Pairwise potentials, attachment springs and position integration.

use crate::attachment::InteractionLog;
use crate::cell::Cell;
use crate::response::{decreasing_linear_response_function, linear_response_function};
use multicell_common::Vec3;
use rand::Rng;

/// Below this separation the pair direction is numerically meaningless.
const MIN_SEPARATION: f64 = 1e-5;

/// Velocity contribution on `me` from repulsion and adhesion with `other`.
///
/// Repulsion acts when `d <= r_a + r_b`, attached or not. Adhesion acts within
/// the combined maximum adhesion distance, but only between unattached pairs;
/// attached pairs are held by the spring instead.
pub fn add_potentials(me: &Cell, other: &Cell) -> Vec3 {
    if me.id == other.id {
        return Vec3::zero();
    }
    let displacement = me.position - other.position;
    let distance = displacement.length().max(MIN_SEPARATION);

    let ma = &me.phenotype.mechanics;
    let mb = &other.phenotype.mechanics;

    let repulsion_distance = me.radius() + other.radius();
    let repulsion = if distance < repulsion_distance {
        let overlap = 1.0 - distance / repulsion_distance;
        overlap * overlap * (ma.cell_cell_repulsion_strength * mb.cell_cell_repulsion_strength).sqrt()
    } else {
        0.0
    };

    let adhesion_distance =
        ma.relative_maximum_adhesion_distance * me.radius() + mb.relative_maximum_adhesion_distance * other.radius();
    let adhesion = if distance < adhesion_distance && !me.is_attached_to(other.id) {
        let reach = 1.0 - distance / adhesion_distance;
        reach * reach * (ma.cell_cell_adhesion_strength * mb.cell_cell_adhesion_strength).sqrt()
    } else {
        0.0
    };

    let magnitude = repulsion - adhesion;
    if magnitude == 0.0 {
        return Vec3::zero();
    }
    displacement * (magnitude / distance)
}

/// Hookean pull of an attached partner: `k (x_other - x_me)`.
#[inline]
pub fn elastic_spring(me: &Cell, other: &Cell) -> Vec3 {
    (other.position - me.position) * me.phenotype.mechanics.attachment_elastic_constant
}

/// True once an attached pair has drifted beyond `radius * relative_detachment_distance`.
pub fn exceeds_detachment_distance(me: &Cell, other: &Cell) -> bool {
    let limit = me.radius() * me.phenotype.mechanics.relative_detachment_distance;
    me.position.distance_squared(other.position) > limit * limit
}

/// Default contact function for attached pairs: a detach request once the pair
/// is stretched too far, otherwise a spring toward the partner.
pub fn standard_elastic_contact(me: &Cell, other: &Cell, log: &InteractionLog, velocity: &mut Vec3) {
    if !me.is_attached_to(other.id) {
        return;
    }
    if exceeds_detachment_distance(me, other) {
        log.request_detach(me.id, other.id);
        return;
    }
    *velocity += elastic_spring(me, other);
}

/// Parameters of a contact-triggered attachment attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentRamp {
    /// Attachments per minute at full signal and contact.
    pub rate: f64,
    pub signal_threshold: f64,
    pub signal_saturation: f64,
    /// Full probability at or below this distance.
    pub min_distance: f64,
    /// No attachment at or beyond this distance.
    pub max_distance: f64,
}

impl AttachmentRamp {
    /// Probability of attaching within one step of `dt`:
    /// `rate * dt * signal_scale * distance_scale`, capped at 1.
    pub fn probability(&self, signal: f64, distance: f64, dt: f64) -> f64 {
        let signal_scale = linear_response_function(signal, self.signal_threshold, self.signal_saturation);
        let distance_scale = decreasing_linear_response_function(distance, self.min_distance, self.max_distance);
        (self.rate * dt * signal_scale * distance_scale).clamp(0.0, 1.0)
    }
}

/// Draws one attachment attempt of `me` on `target`; on success an `Attach`
/// request is posted to the log.
pub fn attempt_attachment<R: Rng>(
    me: &Cell,
    target: &Cell,
    signal: f64,
    ramp: &AttachmentRamp,
    dt: f64,
    rng: &mut R,
    log: &InteractionLog,
) -> bool {
    let distance = me.position.distance(target.position);
    let p = ramp.probability(signal, distance, dt);
    if p > 0.0 && rng.random::<f64>() < p {
        log.request_attach(me.id, target.id);
        return true;
    }
    false
}

/// Adams-Bashforth 2: `x += dt (1.5 v - 0.5 v_prev)`, then `v_prev = v`, `v = 0`.
pub fn integrate_position(cell: &mut Cell, dt: f64, two_dimensional: bool) {
    let step = cell.velocity * 1.5 - cell.previous_velocity * 0.5;
    cell.position += step * dt;
    if two_dimensional {
        cell.position.z = 0.0;
    }
    debug_assert!(cell.position.is_finite(), "non-finite position for cell {}", cell.id);
    cell.previous_velocity = cell.velocity;
    cell.velocity = Vec3::zero();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellId;
    use crate::phenotype::Phenotype;
    use multicell_common::PhenotypeConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cell(id: u64, x: f64) -> Cell {
        let phenotype = Phenotype::from_config(&PhenotypeConfig::default(), &[]).unwrap();
        Cell::new(CellId(id), 0, Vec3::new(x, 0.0, 0.0), phenotype)
    }

    #[test]
    fn overlapping_cells_repel() {
        let a = cell(0, 0.0);
        let b = cell(1, 10.0);
        let v = add_potentials(&a, &b);
        assert!(v.x < 0.0);
        assert_eq!(v.y, 0.0);
        let w = add_potentials(&b, &a);
        assert!((v.x + w.x).abs() < 1e-12);
    }

    #[test]
    fn nearby_cells_adhere_unless_attached() {
        let mut a = cell(0, 0.0);
        let b = cell(1, 18.0); // between 2r and 2.5r
        let v = add_potentials(&a, &b);
        assert!(v.x > 0.0);

        a.attached_cells.push(b.id);
        assert_eq!(add_potentials(&a, &b), Vec3::zero());
    }

    #[test]
    fn far_cells_do_not_interact() {
        let a = cell(0, 0.0);
        let b = cell(1, 100.0);
        assert_eq!(add_potentials(&a, &b), Vec3::zero());
    }

    #[test]
    fn coincident_cells_stay_finite() {
        let a = cell(0, 0.0);
        let b = cell(1, 0.0);
        assert!(add_potentials(&a, &b).is_finite());
    }

    #[test]
    fn stretched_attachment_requests_detach() {
        let mut a = cell(0, 0.0);
        let b = cell(1, 30.0);
        a.attached_cells.push(b.id);
        let log = InteractionLog::new();
        let mut v = Vec3::zero();
        standard_elastic_contact(&a, &b, &log, &mut v);
        assert_eq!(v, Vec3::zero());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn attached_pair_in_range_is_pulled_together() {
        let mut a = cell(0, 0.0);
        let b = cell(1, 10.0);
        a.attached_cells.push(b.id);
        let log = InteractionLog::new();
        let mut v = Vec3::zero();
        standard_elastic_contact(&a, &b, &log, &mut v);
        assert!((v.x - 0.1).abs() < 1e-12);
        assert!(log.is_empty());
    }

    #[test]
    fn ramp_probability_is_scaled_and_capped() {
        let ramp = AttachmentRamp {
            rate: 0.5,
            signal_threshold: 0.0,
            signal_saturation: 1.0,
            min_distance: 10.0,
            max_distance: 20.0,
        };
        assert_eq!(ramp.probability(2.0, 25.0, 1.0), 0.0);
        assert!((ramp.probability(2.0, 5.0, 1.0) - 0.5).abs() < 1e-12);
        assert!((ramp.probability(0.5, 15.0, 1.0) - 0.125).abs() < 1e-12);
        assert_eq!(ramp.probability(2.0, 5.0, 100.0), 1.0);
    }

    #[test]
    fn certain_attachment_posts_request() {
        let a = cell(0, 0.0);
        let b = cell(1, 5.0);
        let ramp = AttachmentRamp {
            rate: 10.0,
            signal_threshold: 0.0,
            signal_saturation: 1.0,
            min_distance: 10.0,
            max_distance: 20.0,
        };
        let log = InteractionLog::new();
        let mut rng = StdRng::seed_from_u64(5);
        assert!(attempt_attachment(&a, &b, 1.0, &ramp, 1.0, &mut rng, &log));
        assert_eq!(log.drain_sorted().len(), 1);
    }

    #[test]
    fn repeated_attempts_converge_to_compound_probability() {
        let a = cell(0, 0.0);
        let b = cell(1, 15.0);
        let ramp = AttachmentRamp {
            rate: 0.2,
            signal_threshold: 0.0,
            signal_saturation: 1.0,
            min_distance: 10.0,
            max_distance: 20.0,
        };
        let p = ramp.probability(1.0, 15.0, 1.0);
        assert!((p - 0.1).abs() < 1e-12);

        let attempts = 5;
        let trials = 20_000;
        let mut rng = StdRng::seed_from_u64(11);
        let mut attached = 0;
        for _ in 0..trials {
            let log = InteractionLog::new();
            if (0..attempts).any(|_| attempt_attachment(&a, &b, 1.0, &ramp, 1.0, &mut rng, &log)) {
                attached += 1;
            }
        }
        let expected = 1.0 - (1.0 - p).powi(attempts);
        let observed = attached as f64 / trials as f64;
        assert!((observed - expected).abs() < 0.015, "observed {} expected {}", observed, expected);
    }

    #[test]
    fn adams_bashforth_uses_previous_velocity() {
        let mut a = cell(0, 0.0);
        a.velocity = Vec3::new(2.0, 0.0, 1.0);
        a.previous_velocity = Vec3::new(1.0, 0.0, 0.0);
        integrate_position(&mut a, 0.1, true);
        assert!((a.position.x - 0.25).abs() < 1e-12);
        assert_eq!(a.position.z, 0.0);
        assert_eq!(a.previous_velocity, Vec3::new(2.0, 0.0, 1.0));
        assert_eq!(a.velocity, Vec3::zero());
    }
}
