pub mod calibration;
pub mod models;
pub mod motion;
pub mod settings;
