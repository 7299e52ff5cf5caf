/*!
 * Event Module
 * Double-buffered lock-free event stream and its wire format
 */

pub mod record;
pub mod stream;

pub use record::{record_size, EventHeader, EventIter, EventRef};
pub use stream::{DrainedBlock, EventStream, StreamStats, Wakeup};
