//! Streaming gRPC surface of the warden agent: health checking plus the
//! message and log watch streams consumed by cluster-level relays.

pub mod proto {
    tonic::include_proto!("warden.v1");
}

mod server;

pub use server::{run_server, ServerHandle};
