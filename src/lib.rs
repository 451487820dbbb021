pub mod config;
pub mod coord;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod process;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("coord");
}
