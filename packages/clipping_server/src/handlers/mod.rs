mod health;
mod realtime;
mod uploads;

pub use health::*;
pub use realtime::*;
pub use uploads::*;
