pub mod fs;
pub mod ids;
pub mod logging;
pub mod time;

pub use logging::EventLog;
pub use time::now_secs;
