pub mod document;
pub mod task;
