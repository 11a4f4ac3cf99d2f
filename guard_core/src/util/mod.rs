pub mod log;

pub use self::log::{init_logger, init_logger_with};
