//! Image-to-splat generation service
//!
//! Queues conversion of 2D source images into 3D Gaussian splats, runs each
//! job through an external generation service with at most one in-flight
//! generation per image, and answers the status polls clients use to learn
//! when the splat is ready.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
