//! Packing strategies for the free-space allocator

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a request picks among the free spans that can hold it.
#[derive(Copy, Clone, ValueEnum, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackingStrategy {
    /// Lowest-addressed span that fits
    #[default]
    First,
    /// Smallest span that fits
    Smallest,
    /// Largest span
    Largest,
}

impl fmt::Display for PackingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackingStrategy::First => write!(f, "First fit"),
            PackingStrategy::Smallest => write!(f, "Best fit"),
            PackingStrategy::Largest => write!(f, "Worst fit"),
        }
    }
}

impl PackingStrategy {
    /// Return all available strategies
    pub fn all() -> &'static [PackingStrategy] {
        &[PackingStrategy::First, PackingStrategy::Smallest, PackingStrategy::Largest]
    }
}
