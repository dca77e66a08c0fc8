//! API Module
//!
//! HTTP surface of the agent: lifecycle endpoints and the server that
//! hosts them.

pub mod rest;
pub mod server;

pub use rest::{ApiError, ApiErrorResponse, DeleteVolumeBody, RestRouter, ValidateVolumeBody};
pub use server::{ApiServer, ApiServerConfig};
