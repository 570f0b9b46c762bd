pub mod block;
pub mod classifier;
pub mod config;
pub mod model;

pub use block::Residual;
pub use classifier::Classifier;
pub use config::ModelConfig;
pub use model::ConvNet;
