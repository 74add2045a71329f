//! Library surface of the `k2serve` binary, exposed for integration
//! tests: server assembly, gRPC service, client pipeline and the shared
//! coordination primitives.

pub mod client;
pub mod config;
pub mod grpc;
pub mod index_holder;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod worker_pool;
