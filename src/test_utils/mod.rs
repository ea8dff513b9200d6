//! the test_utils folder here will share utils and store doubles between
//! unit tests of the watcher and the pipeline
mod common;
mod mock_store;

pub use common::*;
pub use mock_store::*;
