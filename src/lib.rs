pub mod binder;
pub mod bmca;
pub mod calibrator;
pub mod config;
pub mod controller;
pub mod emitter;
pub mod holdover;
pub mod observer;
pub mod ptp;
pub mod quality;
pub mod rtc_discipline;
pub mod servo;
pub mod status;
pub mod traits;

#[cfg(unix)]
pub mod hal;
