pub mod customization;
pub mod job;
