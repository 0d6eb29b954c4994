pub mod aux_layers;
pub mod checkpoint;
pub mod data_loader;
pub mod dist_registry;
pub mod decoder;
pub mod encoder;
pub mod evaluate;
pub mod gmvae;
pub mod learning_curves;
pub mod loss;
pub mod model_config;
pub mod prediction;
pub mod prior;
pub mod train;

pub use candle_core;
pub use candle_nn;
