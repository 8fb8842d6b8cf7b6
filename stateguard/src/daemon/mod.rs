//! Process lifecycle: signal handling for long-running commands.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
