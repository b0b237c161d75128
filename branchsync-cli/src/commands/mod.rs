pub mod check_config;
pub mod daemon;
pub mod locate;
pub mod trigger;
