//! gRPC front end for the admission pipeline.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod turnstile {
        pub mod admission {
            pub mod v1 {
                tonic::include_proto!("turnstile.admission.v1");
            }
        }
    }
}

pub use proto::turnstile::admission::v1::{
    admission_service_server::AdmissionServiceServer, CheckAdmissionRequest,
    CheckAdmissionResponse, UnblockRequest, UnblockResponse,
};
