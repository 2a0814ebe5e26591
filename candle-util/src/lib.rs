pub mod candle_aux_layers;
pub mod candle_checkpoint;
pub mod candle_classifier;
pub mod candle_data_loader;
pub mod candle_decoder_mlp;
pub mod candle_early_stopping;
pub mod candle_encoder_gaussian;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_runner;
pub mod candle_model_traits;
pub mod candle_noise;
pub mod candle_semisup_inference;
pub mod candle_semisup_objective;
pub mod candle_semisup_vae;
pub mod candle_vae_inference;

pub use candle_core;
pub use candle_nn;
