//! gRPC host for the admission engine.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod floodgate {
        pub mod v1 {
            tonic::include_proto!("floodgate.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::floodgate::v1::{
    admission_service_client::AdmissionServiceClient,
    admission_service_server::AdmissionServiceServer, CheckRequest, CheckResponse, RuleSet,
};
