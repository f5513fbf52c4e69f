//! Network protocol stack
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Entity (node)                        │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐                │
//! │  │  Comm    │ → │  Link    │ → │  Phys    │  per-entity    │
//! │  │ history  │   │ dedup    │   │ range /  │  policy layers │
//! │  │ flooding │   │ hops     │   │ collision│                │
//! │  └──────────┘   └──────────┘   └──────────┘                │
//! └───────┬────────────────────────────────────────────────────┘
//!         │ Packet (big-endian wire codec)
//! ┌───────┴────────────────────────────────────────────────────┐
//! │  Transport: UDP datagrams | TCP links | Hybrid TCP tunnel  │
//! │  reader threads → RxQueue (keyed by originator)            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! In-process traffic never touches a socket: the simulator fans
//! packets out as scheduled reception events. Transports exist to link
//! multiple simulator processes (or real radios) together.

pub mod comm;
pub mod hybrid;
pub mod link;
pub mod node;
pub mod packet;
pub mod phys;
pub mod registry;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use comm::CommPolicy;
pub use link::LinkPolicy;
pub use node::{Model, RoadsideUnit, Vehicle};
pub use packet::{Address, Packet, PacketSequence};
pub use phys::PhysPolicy;
pub use registry::Registry;
pub use transport::{RxQueue, Transport};
