pub mod batch;
pub mod context;
pub mod errors;
pub mod handler;
pub mod height;
pub mod types;
