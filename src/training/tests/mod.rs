//! Scenario tests for the training pipeline
//!
//! Unit tests live next to each component; the modules here exercise the
//! components together against a small linear model and an in-memory
//! dataset provider.

// Test modules
pub mod checkpoint_tests;
pub mod distributed_tests;
pub mod evaluator_tests;

pub mod mock_data;

pub use fixtures::{test_settings, FixedProvider, LinearFlowModel, TrainerFixture};
pub use mock_data::{create_mock_batch, create_mock_batches, MockShape};
