//! # dgex: ensemble prediction of differential-expression signatures
//!
//! dgex predicts, for (perturbation, cell type) pairs that were never
//! measured, a differential-expression signature over a fixed gene panel.
//! Several independently configured regressors are trained and their
//! predictions blended with fixed, non-normalized weights.
//!
//! ## Features
//!
//! - Target-encoding features from a labelled DE table
//! - Random and cluster-aware train/validation splits
//! - Optional label reduction (standardisation + truncated SVD)
//! - Transformer regressor trained with Huber loss and early stopping
//! - Persisted (reducer, scaler, model) artifacts
//! - Batched inference and weighted blending
//! - Support for CSV, TSV and gzipped inputs
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dgex::data::loader::{load_id_map, load_labeled_table};
//! use dgex::data::DataSources;
//! use dgex::ensemble::orchestrator::EnsembleOrchestrator;
//! use dgex::ensemble::EnsembleConfig;
//! use dgex::TrainingBackend;
//!
//! let sources = DataSources {
//!     table: load_labeled_table("de_train.csv").unwrap(),
//!     id_map: load_id_map("id_map.csv").unwrap(),
//! };
//!
//! let config = EnsembleConfig::canonical();
//! let device = config.device().unwrap();
//! let orchestrator = EnsembleOrchestrator::<TrainingBackend>::new(config, device);
//! let outcome = orchestrator.run(&sources).unwrap();
//!
//! outcome
//!     .prediction
//!     .save("prediction.csv", &sources.id_map.ids, &sources.table.genes)
//!     .unwrap();
//! ```

pub mod cli;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod model;
pub mod predict;
pub mod reduction;
pub mod training;
pub mod utils;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Re-export commonly used types
pub use data::{DataSources, IdMap, LabeledTable};
pub use ensemble::orchestrator::{combine, EnsembleOrchestrator, EnsembleOutcome};
pub use ensemble::{EnsembleConfig, MemberConfig};
pub use error::{EnsembleError, Phase};
pub use model::checkpoint::{ArtifactKey, ModelStore, TrainedArtifact};
pub use model::{architecture::PerturbationModel, ModelConfig};
pub use predict::{predictor::Predictor, PredictionMatrix};
pub use reduction::{fit_reduction, TargetTransform};
pub use training::{TrainingConfig, TrainingResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - ensemble prediction of differential-expression signatures",
        NAME, VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("dgex"));
        assert!(info_str.contains(VERSION));
    }
}
