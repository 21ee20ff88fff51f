// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

/// Non-cryptographic random number generator used in this crate.
///
/// This RNG is **NOT cryptographically secure**. It backs the half-open
/// admission draw and similar sampling decisions, none of which require
/// cryptographic guarantees.
#[derive(Clone, Default)]
pub(crate) enum Rnd {
    #[default]
    Real,

    #[cfg(test)]
    Test(std::sync::Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            #[cfg(test)]
            Self::Test(_) => write!(f, "Test"),
        }
    }
}

impl Rnd {
    #[cfg(test)]
    pub fn new_fixed(value: f64) -> Self {
        Self::Test(std::sync::Arc::new(move || value))
    }

    #[cfg(test)]
    pub fn new_function<F>(f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::Test(std::sync::Arc::new(f))
    }

    /// Deterministic uniform sequence for statistical tests.
    #[cfg(test)]
    pub fn new_seeded(seed: u64) -> Self {
        let rng = std::sync::Mutex::new(fastrand::Rng::with_seed(seed));
        Self::Test(std::sync::Arc::new(move || {
            rng.lock().expect(crate::constants::ERR_POISONED_LOCK).f64()
        }))
    }

    pub fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            #[cfg(test)]
            Self::Test(generator) => generator(),
        }
    }
}
