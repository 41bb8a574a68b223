pub mod hal;
pub mod logging;
