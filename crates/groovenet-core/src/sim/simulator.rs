//! Simulator run loop
//!
//! Owns the model registry, the event queue, and the simulated clock.
//! Each loop iteration advances the clock, dispatches every due event
//! to its destination model (resolved by name at dispatch time), drains
//! the network transport, and expires tracked messages. A run is N
//! Monte-Carlo trials; model pre-run and post-run hooks both fire in
//! dependency order, so a model's dependencies are always handled
//! before it is.

use crate::config::ModelParams;
use crate::error::{ConfigError, DropReason};
use crate::net::node::{Model, NodeStats, RoadsideUnit, Vehicle};
use crate::net::packet::{Address, Packet};
use crate::sim::context::SimContext;
use crate::sim::event::{EventPayload, EventPriority, EventQueue, SimEvent};
use crate::time::SimTime;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How simulated time advances between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Track the host clock; useful when a transport links real peers
    Wall,
    /// Fixed step per iteration; deterministic and faster than real time
    Synthetic(Duration),
}

/// Run parameters.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub clock: ClockMode,
    /// Simulated length of one trial
    pub duration: Duration,
    /// Monte-Carlo trial count
    pub trials: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Synthetic(Duration::from_millis(100)),
            duration: Duration::from_secs(60),
            trials: 1,
        }
    }
}

impl SimulatorConfig {
    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_trials(mut self, trials: u32) -> Self {
        self.trials = trials.max(1);
        self
    }
}

/// Closed set of registered model kinds.
enum ModelEntry {
    Vehicle(Arc<Mutex<Vehicle>>),
    Roadside(Arc<Mutex<RoadsideUnit>>),
}

impl ModelEntry {
    fn with_model<R>(&self, f: impl FnOnce(&mut dyn Model) -> R) -> R {
        match self {
            ModelEntry::Vehicle(h) => f(&mut *h.lock().unwrap()),
            ModelEntry::Roadside(h) => f(&mut *h.lock().unwrap()),
        }
    }

    fn stats(&self) -> NodeStats {
        match self {
            ModelEntry::Vehicle(h) => h.lock().unwrap().stats().clone(),
            ModelEntry::Roadside(h) => h.lock().unwrap().stats().clone(),
        }
    }

    fn phys_collisions(&self) -> u64 {
        match self {
            ModelEntry::Vehicle(h) => h.lock().unwrap().stack().phys.stats().collisions,
            ModelEntry::Roadside(h) => h.lock().unwrap().stack().phys.stats().collisions,
        }
    }
}

/// Aggregate counters for a completed run.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub trials: u32,
    pub sim_time: Duration,
    pub events_dispatched: u64,
    /// Events whose destination model no longer existed
    pub events_orphaned: u64,
    pub transmitted: u64,
    pub delivered: u64,
    pub dropped: HashMap<DropReason, u64>,
    pub collisions: u64,
    pub tracked_expired: u64,
}

impl SimStats {
    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }

    /// Human-readable run summary
    pub fn print_summary(&self) {
        println!("=== Simulation Summary ===");
        println!("Trials:             {}", self.trials);
        println!("Simulated time:     {:.1}s per trial", self.sim_time.as_secs_f64());
        println!("Events dispatched:  {}", self.events_dispatched);
        if self.events_orphaned > 0 {
            println!("Events orphaned:    {}", self.events_orphaned);
        }
        println!("Packets transmitted:{:>8}", self.transmitted);
        println!("Packets delivered:  {:>8}", self.delivered);
        println!("Packets dropped:    {:>8}", self.dropped_total());
        let mut reasons: Vec<_> = self.dropped.iter().collect();
        reasons.sort_by(|a, b| b.1.cmp(a.1));
        for (reason, count) in reasons {
            println!("  {:<18}{:>8}", format!("{}:", reason), count);
        }
        println!("Collisions:         {:>8}", self.collisions);
        if self.tracked_expired > 0 {
            println!("Messages expired:   {:>8}", self.tracked_expired);
        }
    }
}

pub struct Simulator {
    config: SimulatorConfig,
    ctx: Arc<SimContext>,
    models: HashMap<String, ModelEntry>,
    queue: EventQueue,
    /// Cooperative pause: dispatch happens only at zero
    pause_count: Arc<AtomicU32>,
    /// External stop request (e.g. Ctrl-C)
    stop: Arc<AtomicBool>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig, ctx: Arc<SimContext>) -> Self {
        Self {
            config,
            ctx,
            models: HashMap::new(),
            queue: EventQueue::new(),
            pause_count: Arc::new(AtomicU32::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    /// Flag a cooperating caller can set to end the run early
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Pause handle; callers may hold several nested pauses
    pub fn pause_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.pause_count)
    }

    pub fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let _ = self
            .pause_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::SeqCst) > 0
    }

    /// Build a vehicle from params and register it under `name`.
    pub fn add_vehicle(
        &mut self,
        name: &str,
        params: &ModelParams,
        dependencies: &[&str],
    ) -> Result<(), ConfigError> {
        let mut vehicle = Vehicle::from_params(name, params)?;
        vehicle.set_dependencies(dependencies.iter().map(|s| s.to_string()).collect());
        let handle = self.ctx.vehicles.insert(vehicle.address(), vehicle)?;
        self.models
            .insert(name.to_string(), ModelEntry::Vehicle(handle));
        Ok(())
    }

    /// Build a roadside unit from params and register it under `name`.
    pub fn add_roadside(
        &mut self,
        name: &str,
        params: &ModelParams,
        dependencies: &[&str],
    ) -> Result<(), ConfigError> {
        let mut unit = RoadsideUnit::from_params(name, params)?;
        unit.set_dependencies(dependencies.iter().map(|s| s.to_string()).collect());
        let handle = self.ctx.infrastructure.insert(unit.address(), unit)?;
        self.models
            .insert(name.to_string(), ModelEntry::Roadside(handle));
        Ok(())
    }

    /// Schedule an event directly, e.g. from a scenario script
    pub fn schedule(&mut self, event: SimEvent) {
        self.queue.schedule(event);
    }

    /// Dependency-ordered model names (Kahn). A name that depends on an
    /// unregistered model, or any cycle, fails configuration.
    fn dependency_order(&self) -> Result<Vec<String>, ConfigError> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut deps_of: HashMap<&str, Vec<String>> = HashMap::new();

        for (name, entry) in &self.models {
            deps_of.insert(
                name.as_str(),
                entry.with_model(|m| m.dependencies().to_vec()),
            );
        }
        for (&name, deps) in &deps_of {
            indegree.entry(name).or_insert(0);
            for dep in deps {
                if !self.models.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        model: name.to_string(),
                        dependency: dep.clone(),
                    });
                }
                *indegree.entry(name).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(name);
            }
        }

        let mut ready: VecDeque<&str> = {
            let mut zero: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(n, _)| *n)
                .collect();
            zero.sort_unstable(); // deterministic order among independents
            zero.into()
        };
        let mut order = Vec::with_capacity(self.models.len());
        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            for &dependent in dependents.get(name).into_iter().flatten() {
                let d = indegree.get_mut(dependent).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        if order.len() != self.models.len() {
            let stuck = indegree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(n, _)| n.to_string())
                .unwrap_or_default();
            return Err(ConfigError::DependencyCycle(stuck));
        }
        Ok(order)
    }

    /// Promote an unknown network originator to a remote vehicle proxy.
    fn promote_remote(&mut self, origin: Address) -> Result<(), ConfigError> {
        let name = format!("remote-{}", origin);
        debug!(%origin, %name, "promoting unknown originator");
        let vehicle = Vehicle::remote(&name, origin, &ModelParams::new(&name))?;
        let handle = self.ctx.vehicles.insert(origin, vehicle)?;
        self.models.insert(name, ModelEntry::Vehicle(handle));
        Ok(())
    }

    /// Pull everything the transport received and re-inject it as
    /// reception events for every local entity except the packet's own
    /// originator (UDP broadcast loops our own datagrams back). Range
    /// gating happens in each receiver's phys layer, same as in-process
    /// traffic.
    fn drain_network(&mut self, now: SimTime) {
        let Some(network) = self.ctx.network.clone() else {
            return;
        };
        for (origin, packets) in network.rx_queue().drain_all() {
            if !self.ctx.vehicles.contains(origin) && !self.ctx.infrastructure.contains(origin) {
                if let Err(e) = self.promote_remote(origin) {
                    warn!(%origin, error = %e, "cannot promote originator, dropping traffic");
                    continue;
                }
            }
            for packet in packets {
                if let (Packet::Safety(p), Some(handle)) =
                    (&packet, self.ctx.vehicles.get(origin))
                {
                    let mut vehicle = handle.lock().unwrap();
                    if !vehicle.is_local() {
                        vehicle.apply_remote_state(p, now);
                    }
                }
                for (addr, handle) in self.ctx.vehicles.snapshot() {
                    if addr == origin {
                        continue;
                    }
                    let peer = handle.lock().unwrap();
                    if !peer.is_local() {
                        continue;
                    }
                    self.queue.schedule(SimEvent::new(
                        now,
                        EventPriority::High,
                        peer.name(),
                        EventPayload::ReceiveBegin(Box::new(packet.clone())),
                    ));
                }
                for (addr, handle) in self.ctx.infrastructure.snapshot() {
                    if addr == origin {
                        continue;
                    }
                    let peer = handle.lock().unwrap();
                    self.queue.schedule(SimEvent::new(
                        now,
                        EventPriority::High,
                        peer.name(),
                        EventPayload::ReceiveBegin(Box::new(packet.clone())),
                    ));
                }
            }
        }
    }

    /// Run all trials to completion (or until the stop flag is set).
    pub fn run(&mut self) -> Result<SimStats, ConfigError> {
        let order = self.dependency_order()?;
        let mut stats = SimStats::default();

        for trial in 0..self.config.trials {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            info!(trial, "trial starting");
            self.ctx.reset();
            self.queue.clear();
            for name in &order {
                self.models[name].with_model(|m| m.reset());
            }

            let mut now = SimTime::ZERO;
            for name in &order {
                let entry = &self.models[name];
                // pre_run may schedule events; queue borrow is disjoint
                let queue = &mut self.queue;
                entry.with_model(|m| m.pre_run(&self.ctx, queue, now));
            }

            let end = SimTime::ZERO + self.config.duration;
            let wall_start = Instant::now();
            while now < end && !self.stop.load(Ordering::SeqCst) {
                if self.is_paused() {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }

                now = match self.config.clock {
                    ClockMode::Synthetic(step) => now + step,
                    ClockMode::Wall => {
                        std::thread::sleep(Duration::from_millis(1));
                        SimTime::ZERO + wall_start.elapsed()
                    }
                };
                if now > end {
                    now = end;
                }

                self.drain_network(now);

                while let Some(event) = self.queue.pop_due(now) {
                    match self.models.get(&event.dest) {
                        Some(entry) => {
                            stats.events_dispatched += 1;
                            let queue = &mut self.queue;
                            entry.with_model(|m| m.process_event(event, &self.ctx, queue));
                        }
                        None => {
                            debug!(
                                dest = %event.dest,
                                source = %event.source,
                                "dropping event for missing model"
                            );
                            stats.events_orphaned += 1;
                        }
                    }
                }

                stats.tracked_expired += self.ctx.expire_tracked(now) as u64;
            }

            for name in &order {
                self.models[name].with_model(|m| m.post_run(now));
            }
            stats.trials = trial + 1;
            stats.sim_time = now.saturating_sub(SimTime::ZERO);

            // Fold per-entity counters from this trial
            let mut folded = NodeStats::default();
            for entry in self.models.values() {
                folded.merge(&entry.stats());
                stats.collisions += entry.phys_collisions();
            }
            stats.transmitted += folded.transmitted;
            stats.delivered += folded.delivered;
            for (reason, count) in folded.dropped {
                *stats.dropped.entry(reason).or_insert(0) += count;
            }
            info!(trial, delivered = folded.delivered, "trial finished");
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::GridMap;

    fn params(addr: &str, lat: f64, lon: f64) -> ModelParams {
        ModelParams::new("test")
            .with("node.addr", addr)
            .with("node.lat", lat.to_string())
            .with("node.lon", lon.to_string())
            .with("comm.seed", "42")
    }

    fn simulator(duration_secs: u64) -> Simulator {
        let ctx = Arc::new(SimContext::new(Arc::new(GridMap::default()), None));
        Simulator::new(
            SimulatorConfig::default()
                .with_clock(ClockMode::Synthetic(Duration::from_millis(100)))
                .with_duration(Duration::from_secs(duration_secs)),
            ctx,
        )
    }

    #[test]
    fn test_beaconing_vehicle_reaches_neighbor() {
        let mut sim = simulator(5);
        let near = crate::net::packet::Position::from_degrees(40.0, -80.0).offset(90.0, 50.0);
        sim.add_vehicle(
            "car_a",
            &params("10.0.0.1", 40.0, -80.0).with("node.beacon_interval_ms", "1000"),
            &[],
        )
        .unwrap();
        sim.add_vehicle("car_b", &params("10.0.0.2", near.lat_deg(), near.lon_deg()), &[])
            .unwrap();

        let stats = sim.run().unwrap();
        assert!(stats.transmitted >= 4, "transmitted {}", stats.transmitted);
        assert!(stats.delivered >= 4, "delivered {}", stats.delivered);
        assert_eq!(stats.events_orphaned, 0);
    }

    #[test]
    fn test_dependency_cycle_detected() {
        let mut sim = simulator(1);
        sim.add_vehicle("a", &params("10.0.0.1", 40.0, -80.0), &["b"]).unwrap();
        sim.add_vehicle("b", &params("10.0.0.2", 40.0, -80.0), &["a"]).unwrap();
        assert!(matches!(sim.run(), Err(ConfigError::DependencyCycle(_))));
    }

    #[test]
    fn test_unknown_dependency_detected() {
        let mut sim = simulator(1);
        sim.add_vehicle("a", &params("10.0.0.1", 40.0, -80.0), &["ghost"])
            .unwrap();
        assert!(matches!(
            sim.run(),
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_address_rejected_at_add() {
        let mut sim = simulator(1);
        sim.add_vehicle("a", &params("10.0.0.1", 40.0, -80.0), &[]).unwrap();
        assert!(matches!(
            sim.add_vehicle("b", &params("10.0.0.1", 40.0, -80.0), &[]),
            Err(ConfigError::DuplicateAddress(_))
        ));
    }

    #[test]
    fn test_trials_reset_state() {
        let mut sim = simulator(2);
        sim.add_vehicle(
            "car_a",
            &params("10.0.0.1", 40.0, -80.0).with("node.beacon_interval_ms", "1000"),
            &[],
        )
        .unwrap();
        let near = crate::net::packet::Position::from_degrees(40.0, -80.0).offset(0.0, 60.0);
        sim.add_vehicle("car_b", &params("10.0.0.2", near.lat_deg(), near.lon_deg()), &[])
            .unwrap();

        let one_trial = sim.run().unwrap();

        let mut sim2 = simulator(2);
        sim2.add_vehicle(
            "car_a",
            &params("10.0.0.1", 40.0, -80.0).with("node.beacon_interval_ms", "1000"),
            &[],
        )
        .unwrap();
        sim2.add_vehicle("car_b", &params("10.0.0.2", near.lat_deg(), near.lon_deg()), &[])
            .unwrap();
        sim2.config.trials = 3;
        let three_trials = sim2.run().unwrap();

        assert_eq!(three_trials.trials, 3);
        // Per-trial behavior repeats, so totals scale with trial count
        assert_eq!(three_trials.delivered, one_trial.delivered * 3);
    }
}
