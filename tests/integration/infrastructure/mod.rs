pub mod api_client;
pub mod process_harness;

pub use process_harness::InitHarness;
