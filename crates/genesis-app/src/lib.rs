//! Shared plumbing for the Genesis server binary.

pub mod server;

pub use server::{ApiState, ErrorResponse, ForceEvolutionRequest, UpdateParamRequest, router};
