//! Seeded randomness for link models.
//!
//! The network owns one root stream. Every link gets a child stream keyed by
//! its build index, so a run is a function of the seed and the topology.

use std::{cell::RefCell, fmt, rc::Rc};

use rand::{rngs::SmallRng, Rng, SeedableRng};

const CHILD_MIX: u64 = 0x517c_c1b7_2722_0a95;

/// Random stream shared by clones.
#[derive(Clone)]
pub struct SimulationRng {
    inner: Rc<RefCell<SmallRng>>,
    seed: u64,
}

impl SimulationRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SmallRng::seed_from_u64(seed))),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Bernoulli trial; `probability` is clamped to `[0, 1]`.
    pub fn gen_bool(&self, probability: f64) -> bool {
        self.inner
            .borrow_mut()
            .random_bool(probability.clamp(0.0, 1.0))
    }

    /// Independent stream number `index`. Asking twice for the same index
    /// yields the same stream, whatever else was drawn in between.
    pub fn child_with_index(&self, index: u64) -> Self {
        Self::new(self.seed.wrapping_mul(CHILD_MIX).wrapping_add(index))
    }
}

impl fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationRng").field("seed", &self.seed).finish()
    }
}
