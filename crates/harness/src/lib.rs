pub mod evaluator;
pub mod failing_store;
pub mod fixtures;

pub use evaluator::SimpleEvaluator;
pub use failing_store::{FailingStore, StoreOperation};
pub use fixtures::*;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test writer. Filtered by `RUST_LOG`;
/// safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
