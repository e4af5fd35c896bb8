pub mod catalog;
pub mod comparator;
pub mod counters;
pub mod driver;
pub mod errors;
pub mod handlers;
pub mod lease;
pub mod orchestrator;
pub mod profiles;
pub mod queue;
pub mod results;
pub mod segmentation;
