//! Entanglement generation models: how long one attempt takes, how likely
//! it succeeds and what fidelity a delivered pair has.

use serde::Deserialize;

use super::LinkModel;
use crate::{
    builder::{LinkModelBuilder, ModelConfig},
    node::ProcessingNode,
};

/// Timing and success figures shared by the built-in models.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptModel {
    kind: &'static str,
    cycle_time: u64,
    success_probability: f64,
    max_attempts: Option<u32>,
    fidelity: f64,
}

impl LinkModel for AttemptModel {
    fn kind(&self) -> &str {
        self.kind
    }

    fn cycle_time(&self) -> u64 {
        self.cycle_time
    }

    fn success_probability(&self) -> f64 {
        self.success_probability
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    fn fidelity(&self) -> f64 {
        self.fidelity
    }
}

fn check_probability(name: &str, value: f64, allow_zero: bool) -> Result<(), String> {
    let lower_ok = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if !lower_ok || value > 1.0 || value.is_nan() {
        let open = if allow_zero { "[" } else { "(" };
        return Err(format!("{name} must lie in {open}0, 1], got {value}"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerfectLinkConfig {
    /// Time until a pair is delivered, in ns
    pub state_delay: u64,
}

impl Default for PerfectLinkConfig {
    fn default() -> Self {
        Self { state_delay: 1_000 }
    }
}

impl ModelConfig for PerfectLinkConfig {}

/// Every attempt succeeds with a perfect Bell pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfectLinkBuilder;

impl LinkModelBuilder for PerfectLinkBuilder {
    type Config = PerfectLinkConfig;

    fn build(
        &self,
        _a: &ProcessingNode,
        _b: &ProcessingNode,
        config: &Self::Config,
    ) -> Box<dyn LinkModel> {
        Box::new(AttemptModel {
            kind: "perfect",
            cycle_time: config.state_delay,
            success_probability: 1.0,
            max_attempts: None,
            fidelity: 1.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DepolariseLinkConfig {
    /// Fidelity of delivered pairs
    pub fidelity: f64,
    /// Success probability of one attempt
    pub prob_success: f64,
    /// Duration of one attempt, in ns
    pub t_cycle: u64,
}

impl Default for DepolariseLinkConfig {
    fn default() -> Self {
        Self {
            fidelity: 1.0,
            prob_success: 1.0,
            t_cycle: 1_000,
        }
    }
}

impl ModelConfig for DepolariseLinkConfig {
    fn validate(&self) -> Result<(), String> {
        check_probability("fidelity", self.fidelity, true)?;
        check_probability("prob_success", self.prob_success, false)?;
        if self.t_cycle == 0 && self.prob_success < 1.0 {
            return Err("t_cycle must be positive when attempts can fail".into());
        }
        Ok(())
    }
}

/// Pairs arrive with a fixed depolarising noise after a geometric number of
/// attempts. Failures are silent: the link retries until it succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepolariseLinkBuilder;

impl LinkModelBuilder for DepolariseLinkBuilder {
    type Config = DepolariseLinkConfig;

    fn build(
        &self,
        _a: &ProcessingNode,
        _b: &ProcessingNode,
        config: &Self::Config,
    ) -> Box<dyn LinkModel> {
        Box::new(AttemptModel {
            kind: "depolarise",
            cycle_time: config.t_cycle,
            success_probability: config.prob_success,
            max_attempts: None,
            fidelity: config.fidelity,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeraldedLinkConfig {
    /// Success probability of one heralded attempt
    pub p_success: f64,
    /// Duration of one attempt including the herald, in ns
    pub t_cycle: u64,
    /// Attempts per pair before the request fails, unbounded if absent
    pub max_attempts: Option<u32>,
    pub fidelity: f64,
}

impl Default for HeraldedLinkConfig {
    fn default() -> Self {
        Self {
            p_success: 0.5,
            t_cycle: 10_000,
            max_attempts: None,
            fidelity: 1.0,
        }
    }
}

impl ModelConfig for HeraldedLinkConfig {
    fn validate(&self) -> Result<(), String> {
        check_probability("p_success", self.p_success, true)?;
        check_probability("fidelity", self.fidelity, true)?;
        if self.t_cycle == 0 {
            return Err("t_cycle must be positive".into());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".into());
        }
        if self.p_success == 0.0 && self.max_attempts.is_none() {
            return Err("p_success of 0 never succeeds; set max_attempts".into());
        }
        Ok(())
    }
}

/// Every attempt is heralded; exhausting `max_attempts` fails the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeraldedLinkBuilder;

impl LinkModelBuilder for HeraldedLinkBuilder {
    type Config = HeraldedLinkConfig;

    fn build(
        &self,
        _a: &ProcessingNode,
        _b: &ProcessingNode,
        config: &Self::Config,
    ) -> Box<dyn LinkModel> {
        Box::new(AttemptModel {
            kind: "heralded",
            cycle_time: config.t_cycle,
            success_probability: config.p_success,
            max_attempts: config.max_attempts,
            fidelity: config.fidelity,
        })
    }
}
