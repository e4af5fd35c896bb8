pub mod activity;
pub mod history;
pub mod location;
pub mod segmentation;
