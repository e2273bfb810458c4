//! Local process runtime: live process handles, exit monitors and the node's
//! session epoch clock

pub mod clock;
pub mod monitor;
pub mod process;

pub use clock::EpochClock;
pub use monitor::{ExitCallback, MonitorRef};
pub use process::ProcessTable;
