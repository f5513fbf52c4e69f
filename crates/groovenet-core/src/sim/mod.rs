//! Discrete-event simulation kernel

pub mod context;
pub mod event;
pub mod simulator;

pub use context::SimContext;
pub use event::{EventPayload, EventPriority, EventQueue, SimEvent};
pub use simulator::{ClockMode, SimStats, Simulator, SimulatorConfig};
