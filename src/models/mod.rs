pub mod api;
pub mod event;
pub mod import_error;
pub mod job;
