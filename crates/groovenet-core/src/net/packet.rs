//! Wire packet types and framing
//!
//! This module defines the typed, versioned wire format exchanged
//! between simulated peers. Four variants share a fixed-length common
//! header:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Packet                                  │
//! ├───────────────────┬──────────────────────┬───────────────────────┤
//! │  Header (47B)     │  Variant body        │  Payload (Safety only,│
//! │                   │  (fixed fields)      │  u16 length-prefixed) │
//! └───────────────────┴──────────────────────┴───────────────────────┘
//!
//! Header:
//! ┌──────┬─────────┬─────┬────────┬──────┬─────────┬─────────┬─────────┬──────┬─────┬──────────┐
//! │ Kind │ Version │ Seq │ Origin │ Dest │ TX time │ TX addr │ TX pos  │ Hdg  │ TTL │ RSSI/SNR │
//! │ (1B) │  (1B)   │(4B) │  (4B)  │ (4B) │  (8B)   │  (4B)   │  (8B)   │ (4B) │(1B) │   (8B)   │
//! └──────┴─────────┴─────┴────────┴──────┴─────────┴─────────┴─────────┴──────┴─────┴──────────┘
//! ```
//!
//! Everything on the wire is big-endian. Receive-side fields (receive
//! time/address, local reception counter) are filled in on delivery and
//! never transmitted. The `Hybrid` variant batches N generic/safety
//! sub-packets behind a single 4-byte total-size header and is used
//! only by the TCP tunnel transport.

use crate::error::CodecError;
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Entity address - 4-byte unique ID, doubling as an IPv4 address for
/// the socket transports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 4]);

impl Address {
    /// Broadcast address (all 0xFF)
    pub const BROADCAST: Address = Address([0xFF, 0xFF, 0xFF, 0xFF]);

    /// Unknown/unset address (all 0x00)
    pub const UNKNOWN: Address = Address([0x00, 0x00, 0x00, 0x00]);

    /// Create an address from 4 bytes
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Address(bytes)
    }

    /// Create an address from a u32
    pub fn from_u32(value: u32) -> Self {
        Address(value.to_be_bytes())
    }

    /// Convert to u32
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Interpret the address as an IPv4 address
    pub fn to_ipv4(&self) -> std::net::Ipv4Addr {
        std::net::Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3])
    }

    /// Build an address from an IPv4 address
    pub fn from_ipv4(ip: std::net::Ipv4Addr) -> Self {
        Address(ip.octets())
    }

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Check if this is unknown/unset
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Address({}.{}.{}.{})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Identity of a logical message: originator address plus the
/// originator's transmit sequence number. Unique for the originator's
/// lifetime; ordered lexicographically (address, then sequence).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PacketSequence {
    /// Originator address
    pub origin: Address,
    /// Originator's transmit sequence number
    pub seq: u32,
}

impl PacketSequence {
    pub fn new(origin: Address, seq: u32) -> Self {
        Self { origin, seq }
    }
}

impl fmt::Display for PacketSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// A [`PacketSequence`] extended with the receiver's own reception
/// counter, used to order locally-received packets causally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxPacketSequence {
    /// The logical message identity
    pub sequence: PacketSequence,
    /// Per-receiver monotonic reception counter
    pub rx_count: u32,
}

impl PartialOrd for RxPacketSequence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RxPacketSequence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rx_count
            .cmp(&other.rx_count)
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// Link-quality measurements attached to a packet. Values are
/// `UNAVAILABLE` when the medium did not measure them (e.g., loopback
/// or tunnel transports).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuality {
    /// Received signal strength (dBm)
    pub rssi_dbm: f32,
    /// Signal-to-noise ratio (dB)
    pub snr_db: f32,
}

impl ChannelQuality {
    /// Sentinel for "not measured"
    pub const UNAVAILABLE: f32 = -999.0;

    /// Both fields unmeasured
    pub fn unavailable() -> Self {
        Self {
            rssi_dbm: Self::UNAVAILABLE,
            snr_db: Self::UNAVAILABLE,
        }
    }

    /// Create from measured values
    pub fn new(rssi_dbm: f32, snr_db: f32) -> Self {
        Self { rssi_dbm, snr_db }
    }
}

impl Default for ChannelQuality {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// A geographic position in integer microdegrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in microdegrees (degrees * 1e6)
    pub lat_udeg: i32,
    /// Longitude in microdegrees (degrees * 1e6)
    pub lon_udeg: i32,
}

/// Mean Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

impl Position {
    pub fn new(lat_udeg: i32, lon_udeg: i32) -> Self {
        Self { lat_udeg, lon_udeg }
    }

    /// Create from fractional degrees
    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        Self {
            lat_udeg: (lat * 1e6).round() as i32,
            lon_udeg: (lon * 1e6).round() as i32,
        }
    }

    /// Latitude in degrees
    pub fn lat_deg(&self) -> f64 {
        self.lat_udeg as f64 / 1e6
    }

    /// Longitude in degrees
    pub fn lon_deg(&self) -> f64 {
        self.lon_udeg as f64 / 1e6
    }

    /// Great-circle distance to another position in meters (haversine)
    pub fn distance_m(&self, other: &Position) -> f64 {
        let lat1 = self.lat_deg().to_radians();
        let lat2 = other.lat_deg().to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.lon_deg() - self.lon_deg()).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    /// Initial bearing toward another position, degrees clockwise from north
    pub fn bearing_deg(&self, other: &Position) -> f64 {
        let lat1 = self.lat_deg().to_radians();
        let lat2 = other.lat_deg().to_radians();
        let dlon = (other.lon_deg() - self.lon_deg()).to_radians();

        let y = dlon.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
        (y.atan2(x).to_degrees() + 360.0) % 360.0
    }

    /// Position reached by moving `distance_m` meters along `bearing_deg`
    pub fn offset(&self, bearing_deg: f64, distance_m: f64) -> Position {
        let brg = bearing_deg.to_radians();
        let d = distance_m / EARTH_RADIUS_M;
        let lat1 = self.lat_deg().to_radians();
        let lon1 = self.lon_deg().to_radians();

        let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * brg.cos()).asin();
        let lon2 = lon1
            + (brg.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());
        Position::from_degrees(lat2.to_degrees(), lon2.to_degrees())
    }
}

/// Vehicle kinematic state carried in safety packets.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleState {
    /// Speed in meters per second
    pub speed_mps: f32,
    /// Heading in degrees clockwise from north
    pub heading_deg: f32,
    /// Road record id from the map collaborator
    pub record_id: u32,
    /// Lane index on that record
    pub lane: u8,
    /// Progress along the record, 0.0 - 1.0
    pub progress: f32,
}

/// Geofence gating the re-validity of a safety message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundingRegion {
    /// No geographic restriction
    None,
    /// Axis-aligned bounding box (south-west, north-east corners)
    BBox { min: Position, max: Position },
    /// Corridor around a waypoint polyline, with half-width in meters.
    /// The wire format caps the polyline at
    /// [`BoundingRegion::MAX_CORRIDOR_WAYPOINTS`] points.
    Corridor {
        waypoints: Vec<Position>,
        width_m: f32,
    },
    /// Circle around a center point
    Circle { center: Position, radius_m: f32 },
    /// Cone opening from an apex along a heading
    DirectionalCone {
        apex: Position,
        heading_deg: f32,
        half_angle_deg: f32,
        range_m: f32,
    },
}

impl BoundingRegion {
    /// Wire cap on corridor waypoints (u16 count field); longer
    /// polylines are cut to the cap on encode
    pub const MAX_CORRIDOR_WAYPOINTS: usize = u16::MAX as usize;

    const TAG_NONE: u8 = 0;
    const TAG_BBOX: u8 = 1;
    const TAG_CORRIDOR: u8 = 2;
    const TAG_CIRCLE: u8 = 3;
    const TAG_CONE: u8 = 4;

    /// Whether `pos` falls inside the region. `None` contains everything.
    pub fn contains(&self, pos: &Position) -> bool {
        match self {
            BoundingRegion::None => true,
            BoundingRegion::BBox { min, max } => {
                pos.lat_udeg >= min.lat_udeg
                    && pos.lat_udeg <= max.lat_udeg
                    && pos.lon_udeg >= min.lon_udeg
                    && pos.lon_udeg <= max.lon_udeg
            }
            BoundingRegion::Corridor { waypoints, width_m } => waypoints
                .iter()
                .any(|w| w.distance_m(pos) <= *width_m as f64),
            BoundingRegion::Circle { center, radius_m } => {
                center.distance_m(pos) <= *radius_m as f64
            }
            BoundingRegion::DirectionalCone {
                apex,
                heading_deg,
                half_angle_deg,
                range_m,
            } => {
                if apex.distance_m(pos) > *range_m as f64 {
                    return false;
                }
                let bearing = apex.bearing_deg(pos);
                let mut diff = (bearing - *heading_deg as f64).abs() % 360.0;
                if diff > 180.0 {
                    diff = 360.0 - diff;
                }
                diff <= *half_angle_deg as f64
            }
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BoundingRegion::None => out.push(Self::TAG_NONE),
            BoundingRegion::BBox { min, max } => {
                out.push(Self::TAG_BBOX);
                put_position(out, min);
                put_position(out, max);
            }
            BoundingRegion::Corridor { waypoints, width_m } => {
                out.push(Self::TAG_CORRIDOR);
                let count = waypoints.len().min(Self::MAX_CORRIDOR_WAYPOINTS);
                out.extend_from_slice(&(count as u16).to_be_bytes());
                for w in waypoints.iter().take(count) {
                    put_position(out, w);
                }
                out.extend_from_slice(&width_m.to_be_bytes());
            }
            BoundingRegion::Circle { center, radius_m } => {
                out.push(Self::TAG_CIRCLE);
                put_position(out, center);
                out.extend_from_slice(&radius_m.to_be_bytes());
            }
            BoundingRegion::DirectionalCone {
                apex,
                heading_deg,
                half_angle_deg,
                range_m,
            } => {
                out.push(Self::TAG_CONE);
                put_position(out, apex);
                out.extend_from_slice(&heading_deg.to_be_bytes());
                out.extend_from_slice(&half_angle_deg.to_be_bytes());
                out.extend_from_slice(&range_m.to_be_bytes());
            }
        }
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match r.take_u8()? {
            Self::TAG_NONE => Ok(BoundingRegion::None),
            Self::TAG_BBOX => Ok(BoundingRegion::BBox {
                min: r.take_position()?,
                max: r.take_position()?,
            }),
            Self::TAG_CORRIDOR => {
                let count = r.take_u16()? as usize;
                let mut waypoints = Vec::with_capacity(count);
                for _ in 0..count {
                    waypoints.push(r.take_position()?);
                }
                Ok(BoundingRegion::Corridor {
                    waypoints,
                    width_m: r.take_f32()?,
                })
            }
            Self::TAG_CIRCLE => Ok(BoundingRegion::Circle {
                center: r.take_position()?,
                radius_m: r.take_f32()?,
            }),
            Self::TAG_CONE => Ok(BoundingRegion::DirectionalCone {
                apex: r.take_position()?,
                heading_deg: r.take_f32()?,
                half_angle_deg: r.take_f32()?,
                range_m: r.take_f32()?,
            }),
            tag => Err(CodecError::BadRegionTag(tag)),
        }
    }
}

/// Packet kind tags on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    Generic = 0,
    Safety = 1,
    Squelch = 2,
    Hybrid = 3,
}

impl PacketKind {
    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(PacketKind::Generic),
            1 => Ok(PacketKind::Safety),
            2 => Ok(PacketKind::Squelch),
            3 => Ok(PacketKind::Hybrid),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// Common header shared by all packet variants.
///
/// `rx_time`, `rx_addr`, and `rx_count` are receive-side bookkeeping:
/// they are zeroed on encode and patched in by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Logical message identity
    pub sequence: PacketSequence,
    /// Intended receiver (BROADCAST for all; patched per link on fan-out)
    pub dest: Address,
    /// Simulated time the immediate forwarder transmitted
    pub tx_time: SimTime,
    /// Immediate forwarder's address
    pub tx_addr: Address,
    /// Immediate forwarder's position
    pub tx_position: Position,
    /// Immediate forwarder's heading, degrees
    pub tx_heading: f32,
    /// Hops traveled so far; the link layer increments this on arrival
    /// and drops the packet past its hop budget
    pub hop_count: u8,
    /// Link-quality measurements (may be unavailable)
    pub quality: ChannelQuality,
    /// Time of local reception (filled on delivery, not transmitted)
    pub rx_time: SimTime,
    /// Local receiving address (filled on delivery, not transmitted)
    pub rx_addr: Address,
    /// Local reception counter (filled on delivery, not transmitted)
    pub rx_count: u32,
}

/// Encoded size of the common header
pub const HEADER_WIRE_LEN: usize = 47;

impl PacketHeader {
    /// Create a broadcast header from an originator
    pub fn broadcast(sequence: PacketSequence, tx_time: SimTime, position: Position) -> Self {
        Self {
            sequence,
            dest: Address::BROADCAST,
            tx_time,
            tx_addr: sequence.origin,
            tx_position: position,
            tx_heading: 0.0,
            hop_count: 0,
            quality: ChannelQuality::unavailable(),
            rx_time: SimTime::ZERO,
            rx_addr: Address::UNKNOWN,
            rx_count: 0,
        }
    }

    /// The receive-side local identity of this packet
    pub fn rx_sequence(&self) -> RxPacketSequence {
        RxPacketSequence {
            sequence: self.sequence,
            rx_count: self.rx_count,
        }
    }

    fn encode_into(&self, kind: PacketKind, out: &mut Vec<u8>) {
        out.push(kind as u8);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&self.sequence.seq.to_be_bytes());
        out.extend_from_slice(self.sequence.origin.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        out.extend_from_slice(&self.tx_time.as_micros().to_be_bytes());
        out.extend_from_slice(self.tx_addr.as_bytes());
        put_position(out, &self.tx_position);
        out.extend_from_slice(&self.tx_heading.to_be_bytes());
        out.push(self.hop_count);
        out.extend_from_slice(&self.quality.rssi_dbm.to_be_bytes());
        out.extend_from_slice(&self.quality.snr_db.to_be_bytes());
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<(PacketKind, Self), CodecError> {
        let kind = PacketKind::from_byte(r.take_u8()?)?;
        let version = r.take_u8()?;
        if version != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let seq = r.take_u32()?;
        let origin = r.take_address()?;
        let header = Self {
            sequence: PacketSequence::new(origin, seq),
            dest: r.take_address()?,
            tx_time: SimTime::from_micros(r.take_u64()?),
            tx_addr: r.take_address()?,
            tx_position: r.take_position()?,
            tx_heading: r.take_f32()?,
            hop_count: r.take_u8()?,
            quality: ChannelQuality::new(r.take_f32()?, r.take_f32()?),
            rx_time: SimTime::ZERO,
            rx_addr: Address::UNKNOWN,
            rx_count: 0,
        };
        Ok((kind, header))
    }
}

/// Default hop budget enforced by the link layer
pub const DEFAULT_HOP_LIMIT: u8 = 3;

/// Safety/broadcast application packet.
///
/// Subject fields may differ from the immediate forwarder's header
/// fields during multi-hop relay: the header describes whoever
/// transmitted last, the subject describes the vehicle the message is
/// about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyPacket {
    pub header: PacketHeader,
    /// Vehicle the message is about (usually the originator)
    pub subject: Address,
    /// Subject position at message creation
    pub subject_position: Position,
    /// Subject kinematic state at message creation
    pub subject_state: VehicleState,
    /// Seconds the message stays deliverable after `tx_time`
    pub lifetime_secs: f32,
    /// Geofence gating re-validity
    pub region: BoundingRegion,
    /// Application payload
    pub payload: Vec<u8>,
}

/// Minimum encoded size of a safety packet (empty payload, `None` region)
pub const SAFETY_MIN_WIRE_LEN: usize = HEADER_WIRE_LEN + 4 + 8 + 17 + 4 + 1 + 2;

/// Squelch packet: quiets redundant rebroadcasts of a named message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquelchPacket {
    pub header: PacketHeader,
    /// The message whose rebroadcast should be suppressed
    pub squelched: PacketSequence,
}

/// Encoded size of a squelch packet
pub const SQUELCH_WIRE_LEN: usize = HEADER_WIRE_LEN + 8;

/// Batched aggregate of generic/safety packets, exchanged over the TCP
/// tunnel transport. Multiplexes N sub-packets behind a single 4-byte
/// total-size header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HybridPacket {
    pub packets: Vec<Packet>,
}

/// Minimum encoded size of a hybrid packet (empty batch)
pub const HYBRID_MIN_WIRE_LEN: usize = 6;

/// A wire packet, polymorphic over the four variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    Generic(PacketHeader),
    Safety(SafetyPacket),
    Squelch(SquelchPacket),
    Hybrid(HybridPacket),
}

impl Packet {
    /// The variant tag
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Generic(_) => PacketKind::Generic,
            Packet::Safety(_) => PacketKind::Safety,
            Packet::Squelch(_) => PacketKind::Squelch,
            Packet::Hybrid(_) => PacketKind::Hybrid,
        }
    }

    /// Common header, if the variant has one (Hybrid does not)
    pub fn header(&self) -> Option<&PacketHeader> {
        match self {
            Packet::Generic(h) => Some(h),
            Packet::Safety(p) => Some(&p.header),
            Packet::Squelch(p) => Some(&p.header),
            Packet::Hybrid(_) => None,
        }
    }

    /// Mutable common header, if the variant has one
    pub fn header_mut(&mut self) -> Option<&mut PacketHeader> {
        match self {
            Packet::Generic(h) => Some(h),
            Packet::Safety(p) => Some(&mut p.header),
            Packet::Squelch(p) => Some(&mut p.header),
            Packet::Hybrid(_) => None,
        }
    }

    /// Logical message identity, if the variant has one
    pub fn sequence(&self) -> Option<PacketSequence> {
        self.header().map(|h| h.sequence)
    }

    /// Patch the receiver-address field before a per-link send
    pub fn set_receiver(&mut self, dest: Address) {
        if let Some(h) = self.header_mut() {
            h.dest = dest;
        }
    }

    /// Serialize to wire bytes. Receive-side fields are not emitted.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_WIRE_LEN + 32);
        match self {
            Packet::Generic(h) => h.encode_into(PacketKind::Generic, &mut out),
            Packet::Safety(p) => {
                p.header.encode_into(PacketKind::Safety, &mut out);
                out.extend_from_slice(p.subject.as_bytes());
                put_position(&mut out, &p.subject_position);
                out.extend_from_slice(&p.subject_state.speed_mps.to_be_bytes());
                out.extend_from_slice(&p.subject_state.heading_deg.to_be_bytes());
                out.extend_from_slice(&p.subject_state.record_id.to_be_bytes());
                out.push(p.subject_state.lane);
                out.extend_from_slice(&p.subject_state.progress.to_be_bytes());
                out.extend_from_slice(&p.lifetime_secs.to_be_bytes());
                p.region.encode_into(&mut out);
                let len = p.payload.len().min(u16::MAX as usize);
                out.extend_from_slice(&(len as u16).to_be_bytes());
                out.extend_from_slice(&p.payload[..len]);
            }
            Packet::Squelch(p) => {
                p.header.encode_into(PacketKind::Squelch, &mut out);
                out.extend_from_slice(p.squelched.origin.as_bytes());
                out.extend_from_slice(&p.squelched.seq.to_be_bytes());
            }
            Packet::Hybrid(batch) => {
                let mut body = Vec::new();
                for sub in &batch.packets {
                    body.extend_from_slice(&sub.encode());
                }
                out.push(PacketKind::Hybrid as u8);
                out.push(WIRE_VERSION);
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&body);
            }
        }
        out
    }

    /// Decode one packet from the front of `bytes`, returning it and
    /// the remaining bytes. A buffer shorter than the variant's fixed
    /// minimum length is an error, never a partial object; decoding
    /// never looks ahead past the declared length.
    pub fn decode(bytes: &[u8]) -> Result<(Packet, &[u8]), CodecError> {
        let mut r = Reader::new(bytes);

        // Hybrid has its own framing: kind, version, 4-byte batch size.
        if bytes.first() == Some(&(PacketKind::Hybrid as u8)) {
            r.take_u8()?;
            let version = r.take_u8()?;
            if version != WIRE_VERSION {
                return Err(CodecError::UnsupportedVersion(version));
            }
            let total = r.take_u32()? as usize;
            let mut body = r.take_slice(total)?;
            let mut packets = Vec::new();
            while !body.is_empty() {
                let (sub, rest) = Packet::decode(body)?;
                if matches!(sub, Packet::Hybrid(_) | Packet::Squelch(_)) {
                    return Err(CodecError::BadHybridMember(sub.kind() as u8));
                }
                packets.push(sub);
                body = rest;
            }
            return Ok((Packet::Hybrid(HybridPacket { packets }), r.rest()));
        }

        let (kind, header) = PacketHeader::decode_from(&mut r)?;
        let packet = match kind {
            PacketKind::Generic => Packet::Generic(header),
            PacketKind::Safety => {
                let subject = r.take_address()?;
                let subject_position = r.take_position()?;
                let subject_state = VehicleState {
                    speed_mps: r.take_f32()?,
                    heading_deg: r.take_f32()?,
                    record_id: r.take_u32()?,
                    lane: r.take_u8()?,
                    progress: r.take_f32()?,
                };
                let lifetime_secs = r.take_f32()?;
                let region = BoundingRegion::decode_from(&mut r)?;
                let len = r.take_u16()? as usize;
                let payload = r.take_payload(len)?;
                Packet::Safety(SafetyPacket {
                    header,
                    subject,
                    subject_position,
                    subject_state,
                    lifetime_secs,
                    region,
                    payload,
                })
            }
            PacketKind::Squelch => {
                let origin = r.take_address()?;
                let seq = r.take_u32()?;
                Packet::Squelch(SquelchPacket {
                    header,
                    squelched: PacketSequence::new(origin, seq),
                })
            }
            PacketKind::Hybrid => unreachable!("hybrid handled above"),
        };
        Ok((packet, r.rest()))
    }
}

fn put_position(out: &mut Vec<u8>, pos: &Position) {
    out.extend_from_slice(&pos.lat_udeg.to_be_bytes());
    out.extend_from_slice(&pos.lon_udeg.to_be_bytes());
}

/// Cursor over a decode buffer. Every `take_*` fails with
/// [`CodecError::Truncated`] rather than reading past the end.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take_slice(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                have: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_slice(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take_slice(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take_slice(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take_slice(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take_slice(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn take_f32(&mut self) -> Result<f32, CodecError> {
        let b = self.take_slice(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_address(&mut self) -> Result<Address, CodecError> {
        let b = self.take_slice(4)?;
        Ok(Address::from_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_position(&mut self) -> Result<Position, CodecError> {
        Ok(Position::new(self.take_i32()?, self.take_i32()?))
    }

    fn take_payload(&mut self, declared: usize) -> Result<Vec<u8>, CodecError> {
        if self.buf.len() < declared {
            return Err(CodecError::BadPayloadLength {
                declared,
                remaining: self.buf.len(),
            });
        }
        Ok(self.take_slice(declared)?.to_vec())
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(seq: u32) -> PacketHeader {
        let origin = Address::from_bytes([10, 0, 0, 1]);
        let mut h = PacketHeader::broadcast(
            PacketSequence::new(origin, seq),
            SimTime::from_secs(10),
            Position::from_degrees(40.443, -79.943),
        );
        h.tx_heading = 87.5;
        h.quality = ChannelQuality::new(-72.0, 12.5);
        h
    }

    fn sample_safety(seq: u32) -> SafetyPacket {
        SafetyPacket {
            header: sample_header(seq),
            subject: Address::from_bytes([10, 0, 0, 1]),
            subject_position: Position::from_degrees(40.443, -79.943),
            subject_state: VehicleState {
                speed_mps: 13.4,
                heading_deg: 87.5,
                record_id: 5521,
                lane: 1,
                progress: 0.25,
            },
            lifetime_secs: 5.0,
            region: BoundingRegion::Circle {
                center: Position::from_degrees(40.443, -79.943),
                radius_m: 500.0,
            },
            payload: b"brake warning".to_vec(),
        }
    }

    #[test]
    fn test_address() {
        let a = Address::from_bytes([192, 168, 0, 7]);
        assert_eq!(a.to_u32(), 0xC0A8_0007);
        assert!(!a.is_broadcast());
        assert!(Address::BROADCAST.is_broadcast());
        assert_eq!(Address::from_ipv4(a.to_ipv4()), a);
    }

    #[test]
    fn test_packet_sequence_ordering() {
        let a = PacketSequence::new(Address::from_u32(1), 99);
        let b = PacketSequence::new(Address::from_u32(2), 1);
        // Address dominates sequence number
        assert!(a < b);
        let c = PacketSequence::new(Address::from_u32(1), 100);
        assert!(a < c);
    }

    #[test]
    fn test_rx_sequence_causal_order() {
        let seq = PacketSequence::new(Address::from_u32(9), 1);
        let first = RxPacketSequence { sequence: seq, rx_count: 3 };
        let later = RxPacketSequence {
            sequence: PacketSequence::new(Address::from_u32(1), 50),
            rx_count: 4,
        };
        // Reception counter dominates the message identity
        assert!(first < later);
    }

    #[test]
    fn test_distance_haversine() {
        let a = Position::from_degrees(40.4430, -79.9430);
        let b = a.offset(90.0, 50.0);
        let d = a.distance_m(&b);
        assert!((d - 50.0).abs() < 0.5, "distance was {}", d);
    }

    #[test]
    fn test_generic_roundtrip() {
        let p = Packet::Generic(sample_header(7));
        let bytes = p.encode();
        assert_eq!(bytes.len(), HEADER_WIRE_LEN);
        let (decoded, rest) = Packet::decode(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_safety_roundtrip() {
        let p = Packet::Safety(sample_safety(42));
        let bytes = p.encode();
        let (decoded, rest) = Packet::decode(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_squelch_roundtrip() {
        let p = Packet::Squelch(SquelchPacket {
            header: sample_header(3),
            squelched: PacketSequence::new(Address::from_u32(77), 12),
        });
        let bytes = p.encode();
        assert_eq!(bytes.len(), SQUELCH_WIRE_LEN);
        let (decoded, _) = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_hybrid_roundtrip() {
        let batch = Packet::Hybrid(HybridPacket {
            packets: vec![
                Packet::Generic(sample_header(1)),
                Packet::Safety(sample_safety(2)),
            ],
        });
        let bytes = batch.encode();
        let (decoded, rest) = Packet::decode(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_hybrid_rejects_nested_hybrid() {
        let inner = Packet::Hybrid(HybridPacket::default());
        let mut body = inner.encode();
        let mut bytes = vec![PacketKind::Hybrid as u8, WIRE_VERSION];
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.append(&mut body);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(CodecError::BadHybridMember(_))
        ));
    }

    #[test]
    fn test_truncated_buffer_is_error() {
        let bytes = Packet::Safety(sample_safety(1)).encode();
        for cut in [1, HEADER_WIRE_LEN - 1, HEADER_WIRE_LEN + 3, bytes.len() - 1] {
            let err = Packet::decode(&bytes[..cut]);
            assert!(err.is_err(), "cut at {} should fail", cut);
        }
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut bytes = Packet::Generic(sample_header(5)).encode();
        bytes.extend_from_slice(&Packet::Generic(sample_header(6)).encode());
        let (first, rest) = Packet::decode(&bytes).unwrap();
        assert_eq!(first.sequence().unwrap().seq, 5);
        let (second, rest) = Packet::decode(rest).unwrap();
        assert_eq!(second.sequence().unwrap().seq, 6);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_rx_fields_zeroed_on_encode() {
        let mut p = Packet::Generic(sample_header(1));
        {
            let h = p.header_mut().unwrap();
            h.rx_time = SimTime::from_secs(99);
            h.rx_addr = Address::from_u32(5);
            h.rx_count = 41;
        }
        let (decoded, _) = Packet::decode(&p.encode()).unwrap();
        let h = decoded.header().unwrap();
        assert_eq!(h.rx_time, SimTime::ZERO);
        assert_eq!(h.rx_addr, Address::UNKNOWN);
        assert_eq!(h.rx_count, 0);
    }

    #[test]
    fn test_set_receiver_patches_dest() {
        let mut p = Packet::Generic(sample_header(1));
        let dest = Address::from_bytes([10, 0, 0, 9]);
        p.set_receiver(dest);
        let (decoded, _) = Packet::decode(&p.encode()).unwrap();
        assert_eq!(decoded.header().unwrap().dest, dest);
    }

    #[test]
    fn test_bounding_regions() {
        let center = Position::from_degrees(40.0, -80.0);
        let near = center.offset(0.0, 100.0);
        let far = center.offset(0.0, 2_000.0);

        let circle = BoundingRegion::Circle { center, radius_m: 500.0 };
        assert!(circle.contains(&near));
        assert!(!circle.contains(&far));

        let cone = BoundingRegion::DirectionalCone {
            apex: center,
            heading_deg: 0.0,
            half_angle_deg: 30.0,
            range_m: 500.0,
        };
        assert!(cone.contains(&near));
        assert!(!cone.contains(&center.offset(90.0, 100.0)));
        assert!(BoundingRegion::None.contains(&far));
    }

    #[test]
    fn test_region_roundtrip_in_safety() {
        let mut p = sample_safety(9);
        p.region = BoundingRegion::Corridor {
            waypoints: vec![
                Position::from_degrees(40.0, -80.0),
                Position::from_degrees(40.001, -80.0),
            ],
            width_m: 30.0,
        };
        let (decoded, _) = Packet::decode(&Packet::Safety(p.clone()).encode()).unwrap();
        assert_eq!(decoded, Packet::Safety(p));
    }

    #[test]
    fn test_long_corridor_roundtrip() {
        // A road polyline well past the old single-byte count
        let waypoints: Vec<Position> = (0..300)
            .map(|i| Position::from_degrees(40.0 + i as f64 * 1e-4, -80.0))
            .collect();
        let mut p = sample_safety(11);
        p.region = BoundingRegion::Corridor {
            waypoints,
            width_m: 25.0,
        };
        let packet = Packet::Safety(p);
        let encoded = packet.encode();
        let (decoded, rest) = Packet::decode(&encoded).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_min_wire_lengths() {
        let minimal = SafetyPacket {
            header: sample_header(1),
            subject: Address::UNKNOWN,
            subject_position: Position::default(),
            subject_state: VehicleState::default(),
            lifetime_secs: 0.0,
            region: BoundingRegion::None,
            payload: Vec::new(),
        };
        assert_eq!(Packet::Safety(minimal).encode().len(), SAFETY_MIN_WIRE_LEN);
        assert_eq!(
            Packet::Hybrid(HybridPacket::default()).encode().len(),
            HYBRID_MIN_WIRE_LEN
        );
    }
}
