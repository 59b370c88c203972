//! Quantum devices carried by processing nodes.
//!
//! Gate-level execution belongs to the physics layer; what the network needs
//! from a device is its memory: which positions can receive an entangled
//! qubit and which are currently occupied.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::builder::{ModelConfig, QDeviceBuilder};

/// Quantum memory of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct QDevice {
    name: String,
    num_qubits: usize,
    /// Positions a link may deliver an entangled qubit into.
    communication_positions: Vec<usize>,
    in_use: BTreeSet<usize>,
}

impl QDevice {
    /// Device where every position can act as a communication qubit.
    pub fn new(name: impl Into<String>, num_qubits: usize) -> Self {
        Self {
            name: name.into(),
            num_qubits,
            communication_positions: (0..num_qubits).collect(),
            in_use: BTreeSet::new(),
        }
    }

    /// Device where only the given positions can receive entanglement.
    pub fn with_communication_positions(
        name: impl Into<String>,
        num_qubits: usize,
        positions: impl IntoIterator<Item = usize>,
    ) -> Self {
        let communication_positions = positions.into_iter().filter(|p| *p < num_qubits).collect();
        Self {
            name: name.into(),
            num_qubits,
            communication_positions,
            in_use: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_qubits(&self) -> usize {
        self.num_qubits
    }

    /// Claims the lowest free communication position.
    pub fn allocate(&mut self) -> Option<usize> {
        let position = self
            .communication_positions
            .iter()
            .copied()
            .find(|p| !self.in_use.contains(p))?;
        self.in_use.insert(position);
        Some(position)
    }

    /// Releases a position. Returns false if it was not in use.
    pub fn free(&mut self, position: usize) -> bool {
        self.in_use.remove(&position)
    }

    pub fn is_in_use(&self, position: usize) -> bool {
        self.in_use.contains(&position)
    }

    pub fn num_free_communication(&self) -> usize {
        self.communication_positions
            .iter()
            .filter(|p| !self.in_use.contains(p))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenericQDeviceConfig {
    pub num_qubits: usize,
    /// Energy relaxation time in ns, 0 disables
    pub t1: f64,
    /// Dephasing time in ns, 0 disables
    pub t2: f64,
}

impl Default for GenericQDeviceConfig {
    fn default() -> Self {
        Self {
            num_qubits: 2,
            t1: 0.0,
            t2: 0.0,
        }
    }
}

impl ModelConfig for GenericQDeviceConfig {
    fn validate(&self) -> Result<(), String> {
        if self.num_qubits == 0 {
            return Err("num_qubits must be at least 1".into());
        }
        if self.t1 < 0.0 || self.t2 < 0.0 {
            return Err("t1 and t2 must not be negative".into());
        }
        Ok(())
    }
}

/// Uniform device, every qubit can hold entanglement.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericQDeviceBuilder;

impl QDeviceBuilder for GenericQDeviceBuilder {
    type Config = GenericQDeviceConfig;

    fn build(&self, name: &str, config: &Self::Config) -> QDevice {
        QDevice::new(name, config.num_qubits)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NvQDeviceConfig {
    /// Electron plus carbon memories
    pub num_qubits: usize,
    pub electron_t1: f64,
    pub electron_t2: f64,
    pub carbon_t1: f64,
    pub carbon_t2: f64,
}

impl Default for NvQDeviceConfig {
    fn default() -> Self {
        Self {
            num_qubits: 2,
            electron_t1: 0.0,
            electron_t2: 0.0,
            carbon_t1: 0.0,
            carbon_t2: 0.0,
        }
    }
}

impl ModelConfig for NvQDeviceConfig {
    fn validate(&self) -> Result<(), String> {
        if self.num_qubits == 0 {
            return Err("an NV device needs at least the electron qubit".into());
        }
        let times = [self.electron_t1, self.electron_t2, self.carbon_t1, self.carbon_t2];
        if times.iter().any(|t| *t < 0.0) {
            return Err("coherence times must not be negative".into());
        }
        Ok(())
    }
}

/// NV centre: only the electron (position 0) couples to the link.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvQDeviceBuilder;

impl QDeviceBuilder for NvQDeviceBuilder {
    type Config = NvQDeviceConfig;

    fn build(&self, name: &str, config: &Self::Config) -> QDevice {
        QDevice::with_communication_positions(name, config.num_qubits, [0])
    }
}
