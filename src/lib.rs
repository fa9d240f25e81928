//! OCR pool service: an HTTP microservice that performs OCR on uploaded PDFs
//! by delegating to a supervised pool of long-lived child OCR processes.
//!
//! The library surface is the Supervisor (`pool`), the Worker it manages
//! (`worker`), the bounded admission queue (`queue`), the thin pipeline that
//! bridges HTTP uploads to the pool (`pipeline`), and the `axum` HTTP surface
//! (`http`) that consumes all of the above. `main.rs` only wires these
//! together, runs the server and handles graceful shutdown.

pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod worker;
