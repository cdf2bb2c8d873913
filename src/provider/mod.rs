pub mod codec;
pub mod session;

pub use session::{DataSourceResult, ProviderSession};

/// Generated gRPC types for Terraform plugin protocol 6.
#[allow(clippy::all)]
#[allow(non_camel_case_types)]
pub mod tfplugin6 {
    #![doc(hidden)]
    tonic::include_proto!("tfplugin6");
}
