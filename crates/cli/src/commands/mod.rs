//! CLI subcommands

pub mod artifacts;
pub mod clock;
pub mod ptpconfig;
pub mod scenario;
pub mod stability;
pub mod topology;
