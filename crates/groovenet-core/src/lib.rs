//! GrooveNet core: a discrete-event simulator for vehicular ad-hoc
//! networks.
//!
//! The crate is split in two halves. [`net`] holds the protocol stack:
//! the wire packet codec, the per-entity Link/Phys/Comm policy layers,
//! the vehicle and roadside entities, and the socket transports that
//! link simulator processes together. [`sim`] holds the kernel: the
//! event queue, the shared context, and the trial-running simulator.
//!
//! A minimal in-process run:
//!
//! ```no_run
//! use groovenet_core::config::ModelParams;
//! use groovenet_core::map::GridMap;
//! use groovenet_core::sim::{SimContext, Simulator, SimulatorConfig};
//! use std::sync::Arc;
//!
//! let ctx = Arc::new(SimContext::new(Arc::new(GridMap::default()), None));
//! let mut sim = Simulator::new(SimulatorConfig::default(), ctx);
//! sim.add_vehicle(
//!     "car0",
//!     &ModelParams::new("car0")
//!         .with("node.addr", "10.0.0.1")
//!         .with("node.beacon_interval_ms", "1000"),
//!     &[],
//! )?;
//! let stats = sim.run()?;
//! stats.print_summary();
//! # Ok::<(), groovenet_core::error::ConfigError>(())
//! ```

pub mod config;
pub mod error;
pub mod map;
pub mod net;
pub mod sim;
pub mod time;

pub use error::{CodecError, ConfigError, DropReason, TransportError};
pub use time::SimTime;
