/// Time sources
///
/// All ordering, debouncing and timeout decisions in the core run on
/// monotonic millisecond timestamps from an injectable clock, never on
/// wall-clock time. Tests drive a manual clock to make timing deterministic.
pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};
