pub mod clock;

pub use self::clock::{Clock, ManualClock, SystemClock};
