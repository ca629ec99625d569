pub mod bmca;
pub mod cache;
pub mod clock;
pub mod command;
pub mod config;
pub mod dashboard;
pub mod extract;
pub mod monitor;
pub mod net;
pub mod ptp;
pub mod status;
pub mod tools;
pub mod traits;
