//! Shared primitives for the Vireya phylogenetic MCMC engine.
//!
//! `vireya-core` provides the foundation the engine crates build on:
//!
//! - **Error types** — [`VireyaError`] and [`Result`] for structured error handling
//! - **Traits** — [`Summarizable`] display contract
//! - **Randomness** — [`rng::Xorshift64`], the single injected deterministic PRNG

pub mod error;
pub mod rng;
pub mod traits;

pub use error::{Result, VireyaError};
pub use traits::*;
