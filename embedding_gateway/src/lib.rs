//! Embedding provider seam and the bounded-concurrency gateway in front of
//! it. The provider is an external capability; everything here either
//! describes it ([`embedder`]) or rations access to it ([`gateway`]).

pub mod config;
pub mod embedder;
pub mod gateway;
