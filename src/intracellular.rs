//! Coupling between a cell's metabolic (flux-balance) model and its secretion.
//!
//! The solver is behind [`MetabolicModel`]; the engine only sets exchange
//! bounds from local concentrations and turns solved fluxes into rates.

use crate::cell::Cell;
use crate::error::RuleError;
use multicell_common::{ConfigError, MetabolismConfig};
use std::collections::BTreeMap;
use std::fmt;

/// Concentrations below this produce no exchange.
const MIN_CONCENTRATION: f64 = 1e-12;

/// Upper bound applied to every coupled exchange reaction.
const DEFAULT_UPPER_BOUND: f64 = 1000.0;

pub trait MetabolicModel: Send + Sync + fmt::Debug {
    fn set_exchange_bounds(&mut self, reaction: &str, lower: f64, upper: f64) -> Result<(), RuleError>;

    fn solve(&mut self) -> Result<(), RuleError>;

    /// Solved flux of `reaction`; negative is uptake. `None` before a solve.
    fn exchange_flux(&self, reaction: &str) -> Option<f64>;

    fn boxed_clone(&self) -> Box<dyn MetabolicModel>;
}

impl Clone for Box<dyn MetabolicModel> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Stand-in model with fixed stoichiometry: one limiting uptake drives every
/// product and the growth reaction in proportion to their yields.
#[derive(Debug, Clone)]
pub struct FixedYieldModel {
    limiting_reaction: String,
    products: Vec<(String, f64)>,
    growth: Option<(String, f64)>,
    bounds: BTreeMap<String, (f64, f64)>,
    fluxes: BTreeMap<String, f64>,
}

impl FixedYieldModel {
    pub fn new(limiting_reaction: impl Into<String>) -> Self {
        FixedYieldModel {
            limiting_reaction: limiting_reaction.into(),
            products: Vec::new(),
            growth: None,
            bounds: BTreeMap::new(),
            fluxes: BTreeMap::new(),
        }
    }

    pub fn with_product(mut self, reaction: impl Into<String>, yield_factor: f64) -> Self {
        self.products.push((reaction.into(), yield_factor));
        self
    }

    pub fn with_growth(mut self, reaction: impl Into<String>, yield_factor: f64) -> Self {
        self.growth = Some((reaction.into(), yield_factor));
        self
    }

    pub fn from_config(cfg: &MetabolismConfig) -> Self {
        let mut model = FixedYieldModel::new(cfg.limiting_reaction.clone());
        for p in &cfg.products {
            model = model.with_product(p.reaction.clone(), p.yield_factor);
        }
        if let Some(growth) = &cfg.growth_reaction {
            model = model.with_growth(growth.clone(), cfg.growth_yield);
        }
        model
    }
}

impl MetabolicModel for FixedYieldModel {
    fn set_exchange_bounds(&mut self, reaction: &str, lower: f64, upper: f64) -> Result<(), RuleError> {
        if lower > upper || lower.is_nan() || upper.is_nan() {
            return Err(RuleError::Solver(format!(
                "infeasible bounds [{}, {}] on reaction '{}'",
                lower, upper, reaction
            )));
        }
        self.bounds.insert(reaction.to_string(), (lower, upper));
        Ok(())
    }

    fn solve(&mut self) -> Result<(), RuleError> {
        let &(lower, _) = self.bounds.get(&self.limiting_reaction).ok_or_else(|| {
            RuleError::Solver(format!("limiting reaction '{}' has no bounds", self.limiting_reaction))
        })?;

        self.fluxes.clear();
        // Take up as much as the bound allows; uptake is negative.
        let uptake = lower.min(0.0);
        for (reaction, &(lower, _)) in &self.bounds {
            self.fluxes.insert(reaction.clone(), lower);
        }
        self.fluxes.insert(self.limiting_reaction.clone(), uptake);

        for (reaction, yield_factor) in &self.products {
            let upper = self.bounds.get(reaction).map_or(DEFAULT_UPPER_BOUND, |b| b.1);
            self.fluxes.insert(reaction.clone(), (-yield_factor * uptake).min(upper));
        }
        if let Some((reaction, yield_factor)) = &self.growth {
            self.fluxes.insert(reaction.clone(), -yield_factor * uptake);
        }
        Ok(())
    }

    fn exchange_flux(&self, reaction: &str) -> Option<f64> {
        self.fluxes.get(reaction).copied()
    }

    fn boxed_clone(&self) -> Box<dyn MetabolicModel> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeCoupling {
    pub substrate: usize,
    pub reaction: String,
    pub vmax: f64,
    pub km: f64,
}

impl ExchangeCoupling {
    /// Michaelis-Menten uptake bound `-vmax c / (c + km)`.
    pub fn lower_bound(&self, concentration: f64) -> f64 {
        if concentration < MIN_CONCENTRATION {
            return 0.0;
        }
        -self.vmax * concentration / (concentration + self.km)
    }
}

/// Per cell type: which substrates feed which exchange reactions, plus the
/// model template every new agent of the type receives a copy of.
#[derive(Debug, Clone)]
pub struct MetabolicCoupling {
    pub model: Box<dyn MetabolicModel>,
    pub exchanges: Vec<ExchangeCoupling>,
    pub growth_reaction: Option<String>,
}

impl MetabolicCoupling {
    pub fn from_config(cfg: &MetabolismConfig, substrates: &[String]) -> Result<Self, ConfigError> {
        let exchanges = cfg
            .exchanges
            .iter()
            .map(|ex| {
                let substrate = substrates.iter().position(|s| *s == ex.substrate).ok_or_else(|| {
                    ConfigError::Invalid(format!("exchange '{}' uses unknown substrate '{}'", ex.reaction, ex.substrate))
                })?;
                if ex.vmax < 0.0 || ex.km <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "exchange '{}' needs vmax >= 0 and km > 0",
                        ex.reaction
                    )));
                }
                Ok(ExchangeCoupling {
                    substrate,
                    reaction: ex.reaction.clone(),
                    vmax: ex.vmax,
                    km: ex.km,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MetabolicCoupling {
            model: Box::new(FixedYieldModel::from_config(cfg)),
            exchanges,
            growth_reaction: cfg.growth_reaction.clone(),
        })
    }

    /// One metabolic update for `cell` at the local `densities`: bound the
    /// exchanges, solve, then convert fluxes to uptake or secretion rates.
    /// A negative flux `f` becomes uptake `|f / c|`; a positive one becomes
    /// secretion `|f / c|` with the saturation density left unchanged.
    pub fn apply(&self, cell: &mut Cell, densities: &[f64]) -> Result<(), RuleError> {
        let Some(model) = cell.metabolism.as_mut() else {
            return Ok(());
        };

        for ex in &self.exchanges {
            let c = densities.get(ex.substrate).copied().unwrap_or(0.0);
            model.set_exchange_bounds(&ex.reaction, ex.lower_bound(c), DEFAULT_UPPER_BOUND)?;
        }
        model.solve()?;

        let secretion = &mut cell.phenotype.secretion;
        for ex in &self.exchanges {
            let c = densities.get(ex.substrate).copied().unwrap_or(0.0);
            let flux = model.exchange_flux(&ex.reaction).unwrap_or(0.0);
            if !flux.is_finite() {
                return Err(RuleError::Numerical(format!("non-finite flux on '{}'", ex.reaction)));
            }
            secretion.uptake_rates[ex.substrate] = 0.0;
            secretion.secretion_rates[ex.substrate] = 0.0;
            if c < MIN_CONCENTRATION {
                continue;
            }
            if flux < 0.0 {
                secretion.uptake_rates[ex.substrate] = (flux / c).abs();
            } else if flux > 0.0 {
                secretion.secretion_rates[ex.substrate] = (flux / c).abs();
            }
        }

        if let Some(growth) = &self.growth_reaction {
            let flux = model.exchange_flux(growth).unwrap_or(0.0);
            cell.phenotype.cycle.rate = flux.max(0.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellId;
    use crate::phenotype::Phenotype;
    use multicell_common::{ExchangeConfig, PhenotypeConfig, ProductConfig, Vec3};

    fn substrates() -> Vec<String> {
        vec!["glucose".to_string(), "lactate".to_string()]
    }

    fn config() -> MetabolismConfig {
        MetabolismConfig {
            exchanges: vec![
                ExchangeConfig { substrate: "glucose".into(), reaction: "EX_glc".into(), vmax: 10.0, km: 1.0 },
                ExchangeConfig { substrate: "lactate".into(), reaction: "EX_lac".into(), vmax: 0.0, km: 1.0 },
            ],
            limiting_reaction: "EX_glc".into(),
            products: vec![ProductConfig { reaction: "EX_lac".into(), yield_factor: 2.0 }],
            growth_reaction: Some("BIOMASS".into()),
            growth_yield: 0.001,
        }
    }

    fn cell(coupling: &MetabolicCoupling) -> Cell {
        let phenotype = Phenotype::from_config(&PhenotypeConfig::default(), &substrates()).unwrap();
        let mut cell = Cell::new(CellId(0), 0, Vec3::zero(), phenotype);
        cell.metabolism = Some(coupling.model.boxed_clone());
        cell
    }

    #[test]
    fn lower_bound_follows_michaelis_menten() {
        let ex = ExchangeCoupling { substrate: 0, reaction: "EX".into(), vmax: 10.0, km: 2.0 };
        assert_eq!(ex.lower_bound(0.0), 0.0);
        assert_eq!(ex.lower_bound(1e-13), 0.0);
        assert!((ex.lower_bound(2.0) + 5.0).abs() < 1e-12);
    }

    #[test]
    fn fluxes_become_uptake_and_secretion_rates() {
        let coupling = MetabolicCoupling::from_config(&config(), &substrates()).unwrap();
        let mut cell = cell(&coupling);
        coupling.apply(&mut cell, &[1.0, 0.5]).unwrap();

        // glucose: f = -10 * 1 / 2 = -5, uptake = 5 / 1
        assert!((cell.phenotype.secretion.uptake_rates[0] - 5.0).abs() < 1e-12);
        assert_eq!(cell.phenotype.secretion.secretion_rates[0], 0.0);
        // lactate: f = 2 * 5 = 10, secretion = 10 / 0.5
        assert!((cell.phenotype.secretion.secretion_rates[1] - 20.0).abs() < 1e-12);
        assert_eq!(cell.phenotype.secretion.uptake_rates[1], 0.0);
        assert!((cell.phenotype.cycle.rate - 0.005).abs() < 1e-12);
    }

    #[test]
    fn vanishing_concentration_gives_zero_rates() {
        let coupling = MetabolicCoupling::from_config(&config(), &substrates()).unwrap();
        let mut cell = cell(&coupling);
        coupling.apply(&mut cell, &[0.0, 0.0]).unwrap();
        assert!(cell.phenotype.secretion.uptake_rates.iter().all(|r| *r == 0.0));
        assert!(cell.phenotype.secretion.secretion_rates.iter().all(|r| *r == 0.0));
        assert_eq!(cell.phenotype.cycle.rate, 0.0);
    }

    #[test]
    fn solve_without_limiting_bound_is_a_solver_error() {
        let mut model = FixedYieldModel::new("EX_glc");
        assert!(matches!(model.solve(), Err(RuleError::Solver(_))));
        assert!(model.set_exchange_bounds("EX_glc", 1.0, 0.0).is_err());
    }

    #[test]
    fn unknown_exchange_substrate_is_rejected() {
        let mut cfg = config();
        cfg.exchanges[0].substrate = "oxygen".into();
        assert!(MetabolicCoupling::from_config(&cfg, &substrates()).is_err());
    }
}
