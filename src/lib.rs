//! STSAN-XL trainer
//!
//! Training orchestration for a sequence-to-sequence spatio-temporal attention
//! model predicting inflow/outflow on a city grid. The network and the dataset
//! pipeline are supplied by the caller through [`training::FlowModel`] and
//! [`training::DatasetProvider`].

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod training;

// Re-exports
pub use config::{DatasetKind, Split, TrainerConfig, TrainerSettings};
pub use error::{Error, Result};
pub use training::{FlowModel, DatasetProvider, ReplicaTopology, StsanTrainer, TrainingReport};
