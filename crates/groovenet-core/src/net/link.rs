//! Link-layer policy
//!
//! The link layer owns the per-entity duplicate-suppression set and the
//! admission filter applied the moment bytes arrive: address match, hop
//! budget, message lifetime. `begin_process_packet`/`end_process_packet`
//! bracket the simulated time-on-air; the duplicate check happens at
//! the end of the bracket so two copies in flight at once still resolve
//! to a single delivery.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::error::{ConfigError, DropReason};
use crate::net::packet::{Address, Packet, PacketSequence, DEFAULT_HOP_LIMIT};
use crate::time::SimTime;
use std::collections::HashMap;
use std::time::Duration;

/// Closed set of link-layer policies, selected by type tag at init.
#[derive(Debug)]
pub enum LinkPolicy {
    Simple(SimpleLink),
}

impl LinkPolicy {
    /// Type tags accepted by [`LinkPolicy::from_tag`]
    pub const TAGS: &'static [&'static str] = &["simple"];

    /// Build a policy from its configuration tag
    pub fn from_tag(tag: &str, params: &ModelParams) -> Result<Self, ConfigError> {
        match tag {
            "simple" => Ok(LinkPolicy::Simple(SimpleLink::from_params(params)?)),
            other => Err(ConfigError::UnknownPolicy {
                model: params.model.clone(),
                tag: other.to_string(),
            }),
        }
    }

    /// Admission filter at packet arrival. Increments the hop count and
    /// rejects packets that are not for this entity, out of hop budget,
    /// or already past their lifetime.
    pub fn receive_packet(
        &mut self,
        packet: &mut Packet,
        local: Address,
        now: SimTime,
    ) -> Result<(), DropReason> {
        match self {
            LinkPolicy::Simple(link) => link.receive_packet(packet, local, now),
        }
    }

    /// Reception window opened (time-on-air begins)
    pub fn begin_process_packet(&mut self, packet: &Packet, now: SimTime) {
        match self {
            LinkPolicy::Simple(link) => link.begin_process_packet(packet, now),
        }
    }

    /// Reception window closed; rejects duplicates and expired messages
    pub fn end_process_packet(&mut self, packet: &Packet, now: SimTime) -> Result<(), DropReason> {
        match self {
            LinkPolicy::Simple(link) => link.end_process_packet(packet, now),
        }
    }

    /// Lifetime of a packet under this policy
    pub fn lifetime_of(&self, packet: &Packet) -> Duration {
        match self {
            LinkPolicy::Simple(link) => link.lifetime_of(packet),
        }
    }

    /// Record a delivered sequence. Returns `true` exactly once per
    /// sequence until its recorded expiry passes.
    pub fn add_received_packet(
        &mut self,
        sequence: PacketSequence,
        rx_time: SimTime,
        lifetime: Duration,
    ) -> bool {
        match self {
            LinkPolicy::Simple(link) => link.add_received_packet(sequence, rx_time, lifetime),
        }
    }

    /// Opportunistic purge, called from the entity's Update tick
    pub fn tick(&mut self, now: SimTime) {
        match self {
            LinkPolicy::Simple(link) => link.purge_expired(now),
        }
    }

    /// Reset between trials
    pub fn reset(&mut self) {
        match self {
            LinkPolicy::Simple(link) => link.seen.clear(),
        }
    }
}

/// Default link policy: hop budget + duplicate suppression.
#[derive(Debug)]
pub struct SimpleLink {
    /// Seen sequences and the time their record expires
    seen: HashMap<PacketSequence, SimTime>,
    /// Maximum hops a packet may travel
    max_hops: u8,
    /// Lifetime assumed for packets that do not carry one
    default_lifetime: Duration,
}

impl SimpleLink {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "link.max_hops",
            ParamSpec::new(
                &DEFAULT_HOP_LIMIT.to_string(),
                "maximum hops a packet may travel",
                ParamType::Int,
            ),
        );
        declared.declare(
            "link.default_lifetime_secs",
            ParamSpec::new(
                "5.0",
                "assumed lifetime for packets without one",
                ParamType::Float,
            ),
        );
        Ok(Self {
            seen: HashMap::new(),
            max_hops: declared.get_u32("link.max_hops")? as u8,
            default_lifetime: Duration::from_secs_f64(
                declared.get_f64("link.default_lifetime_secs")?,
            ),
        })
    }

    /// Lifetime of a packet: the safety packet's own, else the default
    pub fn lifetime_of(&self, packet: &Packet) -> Duration {
        match packet {
            Packet::Safety(p) => Duration::from_secs_f64(p.lifetime_secs.max(0.0) as f64),
            _ => self.default_lifetime,
        }
    }

    fn receive_packet(
        &mut self,
        packet: &mut Packet,
        local: Address,
        now: SimTime,
    ) -> Result<(), DropReason> {
        let lifetime = self.lifetime_of(packet);
        let header = match packet.header_mut() {
            Some(h) => h,
            None => return Ok(()), // hybrid batches are unpacked upstream
        };

        if !header.dest.is_broadcast() && header.dest != local {
            return Err(DropReason::AddressMismatch);
        }

        header.hop_count = header.hop_count.saturating_add(1);
        if header.hop_count > self.max_hops {
            return Err(DropReason::HopLimitExceeded);
        }

        if now > header.tx_time + lifetime {
            return Err(DropReason::ExpiredLifetime);
        }
        Ok(())
    }

    fn begin_process_packet(&mut self, _packet: &Packet, _now: SimTime) {
        // Time-on-air bookkeeping lives in the physical layer; the link
        // layer only acts at the end of the window.
    }

    fn end_process_packet(&mut self, packet: &Packet, now: SimTime) -> Result<(), DropReason> {
        let lifetime = self.lifetime_of(packet);
        let header = match packet.header() {
            Some(h) => h,
            None => return Ok(()),
        };

        if now > header.tx_time + lifetime {
            return Err(DropReason::ExpiredLifetime);
        }

        if let Some(expiry) = self.seen.get(&header.sequence) {
            if now <= *expiry {
                return Err(DropReason::Duplicate);
            }
        }
        Ok(())
    }

    fn add_received_packet(
        &mut self,
        sequence: PacketSequence,
        rx_time: SimTime,
        lifetime: Duration,
    ) -> bool {
        let expiry = rx_time + lifetime;
        match self.seen.get(&sequence) {
            Some(existing) if rx_time <= *existing => false,
            _ => {
                self.seen.insert(sequence, expiry);
                true
            }
        }
    }

    fn purge_expired(&mut self, now: SimTime) {
        self.seen.retain(|_, expiry| *expiry >= now);
    }

    /// Number of live suppression entries
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}
