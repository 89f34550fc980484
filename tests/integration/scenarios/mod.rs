pub mod condition_tests;
pub mod reload_tests;
pub mod restart_tests;
pub mod runlevel_tests;
