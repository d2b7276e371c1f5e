//! HTTP transport: applies admission decisions to incoming requests.

mod middleware;
mod server;

pub use middleware::{
    admit, limit_state, AdmissionState, ErrorBody, DENIAL_MESSAGE, INTERNAL_ERROR_MESSAGE,
};
pub use server::{router, HttpServer};
