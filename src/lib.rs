pub mod actuator;
pub mod alarm_store;
pub mod alarmd;
pub mod clock;
pub mod config;
pub mod data_dir;
pub mod delivery;
pub mod demo;
pub mod hang;
pub mod interceptor;
pub mod liveness;
pub mod process;
pub mod registry;
pub mod timer;
pub mod watchdog;

#[cfg(test)]
mod testing;
