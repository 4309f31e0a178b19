pub mod clock;
pub mod dir;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod time;
