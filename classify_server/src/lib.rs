//! Classify live webcam frames with a pretrained MobileNet and show the
//! ranked labels in the browser.
pub mod config;
pub mod controller;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod render;
pub mod utils;
