//! Protobuf contracts for the manifold adapter services.
//!
//! One gRPC service per backend family. Request messages carry the caller's
//! `user_id` and `organization_id`; adapters derive physical backend names
//! from them and never expose physical names back to callers.

pub mod common {
    tonic::include_proto!("manifold.common");
}

pub mod objectstore {
    tonic::include_proto!("manifold.objectstore");
}

pub mod broker {
    tonic::include_proto!("manifold.broker");
}

pub mod cache {
    tonic::include_proto!("manifold.cache");
}

pub mod vector {
    tonic::include_proto!("manifold.vector");
}

pub mod graph {
    tonic::include_proto!("manifold.graph");
}

pub mod analytics {
    tonic::include_proto!("manifold.analytics");
}

pub mod relational {
    tonic::include_proto!("manifold.relational");
}

pub mod mqtt {
    tonic::include_proto!("manifold.mqtt");
}
