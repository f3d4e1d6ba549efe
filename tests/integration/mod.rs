//! Integration suite: exercises the public API end to end against real
//! temporary data directories.

mod fixtures;

mod durability;
mod propagation;
mod retries;
