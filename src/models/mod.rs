pub mod artifact;
pub mod image;
pub mod job;
pub mod status;
