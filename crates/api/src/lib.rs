//! Generated gRPC types and service traits for the agent-facing control protocol.
//!
//! Everything under [`gen`] is produced by `tonic-build` from
//! `proto/v1/orchestrator.proto` at build time; nothing in this crate is
//! hand-written besides this re-export.

pub mod gen {
    pub mod api {
        pub mod v1 {
            tonic::include_proto!("api.v1");
        }
    }
}
