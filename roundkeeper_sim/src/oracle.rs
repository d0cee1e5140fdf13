//! Ground truth oracle for simulation.
//!
//! The Oracle owns the "true" position of every simulated player and knows
//! in advance whether each one means to finish the round inside the
//! survival region. The world feeds these positions to the host every tick,
//! so the host's elimination set can be checked against the oracle's.

use nalgebra::{Point3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use roundkeeper_core::{Pose, SurvivalRegion};
use roundkeeper_env::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Distance kept from the region boundary by players with a fixed intent.
const BOUNDARY_MARGIN: f64 = 1.0;

/// Width of the band outside the region that outside players roam in.
const OUTSIDE_BAND: f64 = 15.0;

/// What a simulated player is trying to do this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    /// Stays well inside the region
    Inside,

    /// Stays well outside the region
    Outside,

    /// Roams across the boundary
    Wander,
}

/// Axis-aligned box a player's walk is confined to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Bounds {
    fn sample(&self, rng: &mut ChaCha8Rng) -> Vector3<f64> {
        Vector3::new(
            rng.gen_range(self.min.x..=self.max.x),
            rng.gen_range(self.min.y..=self.max.y),
            rng.gen_range(self.min.z..=self.max.z),
        )
    }

    /// Reflects `position` and `velocity` back inside on each axis.
    fn reflect(&self, position: &mut Vector3<f64>, velocity: &mut Vector3<f64>) {
        for axis in 0..3 {
            if position[axis] < self.min[axis] {
                position[axis] = (2.0 * self.min[axis] - position[axis]).min(self.max[axis]);
                velocity[axis] = velocity[axis].abs();
            } else if position[axis] > self.max[axis] {
                position[axis] = (2.0 * self.max[axis] - position[axis]).max(self.min[axis]);
                velocity[axis] = -velocity[axis].abs();
            }
        }
    }
}

/// A ground truth player in the simulation.
#[derive(Debug, Clone)]
pub struct SimPlayer {
    pub peer: PeerId,
    pub intent: Intent,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub bounds: Bounds,

    /// Player has left the session
    pub active: bool,
}

impl SimPlayer {
    /// Pose handed to the host. The f32 conversion happens once, here.
    pub fn pose(&self) -> Pose {
        Pose::at(self.position.x as f32, self.position.y as f32, self.position.z as f32)
    }
}

/// The Oracle - maintains ground truth player motion.
pub struct PlayerOracle {
    rng: ChaCha8Rng,
    region: Option<SurvivalRegion>,
    players: Vec<SimPlayer>,
    speed: f64,

    /// Heading noise (m/s per second); none when speed is not finite
    heading_noise: Option<Normal<f64>>,
    current_time: f64,
}

impl PlayerOracle {
    /// Creates an oracle with its own physics seed.
    ///
    /// The physics seed is derived separately from the network seed so
    /// changing latency doesn't change trajectories.
    pub fn new(physics_seed: u64, region: Option<SurvivalRegion>, speed: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(physics_seed),
            region,
            players: Vec::new(),
            speed,
            heading_noise: Normal::new(0.0, speed.abs().max(0.01) * 0.25).ok(),
            current_time: 0.0,
        }
    }

    /// Adds a player with a random intent.
    pub fn spawn_random(&mut self, peer: PeerId) -> Pose {
        let intent = match self.rng.gen_range(0..3) {
            0 => Intent::Inside,
            1 => Intent::Outside,
            _ => Intent::Wander,
        };
        self.spawn(peer, intent)
    }

    /// Adds a player with the given intent and returns its starting pose.
    pub fn spawn(&mut self, peer: PeerId, intent: Intent) -> Pose {
        let bounds = self.bounds_for(intent);
        let position = bounds.sample(&mut self.rng);
        let heading = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let velocity = Vector3::new(heading.cos(), 0.0, heading.sin()) * self.speed;

        let player = SimPlayer {
            peer,
            intent,
            position,
            velocity,
            bounds,
            active: true,
        };
        let pose = player.pose();
        self.players.push(player);
        pose
    }

    /// Marks a player as gone. Its position freezes.
    pub fn deactivate(&mut self, peer: PeerId) {
        if let Some(p) = self.players.iter_mut().find(|p| p.peer == peer) {
            p.active = false;
        }
    }

    /// Advances every active player by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        for player in self.players.iter_mut().filter(|p| p.active) {
            let jitter = match &self.heading_noise {
                Some(noise) => Vector3::new(noise.sample(&mut self.rng), 0.0, noise.sample(&mut self.rng)),
                None => Vector3::zeros(),
            };
            player.velocity += jitter * dt;
            if player.velocity.norm() > self.speed && self.speed > 0.0 {
                player.velocity = player.velocity.normalize() * self.speed;
            }
            player.position += player.velocity * dt;
            player.bounds.reflect(&mut player.position, &mut player.velocity);
        }
        self.current_time += dt;
    }

    /// Players whose current pose is outside the region, in spawn order.
    ///
    /// With no region configured every active player counts as outside.
    pub fn expected_eliminated(&self) -> BTreeSet<PeerId> {
        self.players
            .iter()
            .filter(|p| p.active)
            .filter(|p| match &self.region {
                Some(region) => !region.contains(&p.pose().position),
                None => true,
            })
            .map(|p| p.peer)
            .collect()
    }

    pub fn player(&self, peer: PeerId) -> Option<&SimPlayer> {
        self.players.iter().find(|p| p.peer == peer)
    }

    pub fn players(&self) -> &[SimPlayer] {
        &self.players
    }

    pub fn active_players(&self) -> impl Iterator<Item = &SimPlayer> {
        self.players.iter().filter(|p| p.active)
    }

    pub fn region(&self) -> Option<&SurvivalRegion> {
        self.region.as_ref()
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// Walk bounds for an intent, relative to the region.
    fn bounds_for(&mut self, intent: Intent) -> Bounds {
        let positive_side = self.rng.gen_bool(0.5);
        let (center, inner, outer) = match &self.region {
            Some(SurvivalRegion::Box { center, half_extents }) => (
                center.map(|c| c as f64),
                half_extents.map(|h| h as f64),
                half_extents.map(|h| h as f64),
            ),
            Some(SurvivalRegion::Sphere { center, radius }) => {
                let r = *radius as f64;
                (
                    center.map(|c| c as f64),
                    Vector3::repeat(r / 3f64.sqrt()),
                    Vector3::repeat(r),
                )
            }
            None => (Point3::origin(), Vector3::repeat(20.0), Vector3::repeat(20.0)),
        };
        let c = center.coords;

        match intent {
            Intent::Inside => {
                let half = (inner - Vector3::repeat(BOUNDARY_MARGIN)).map(|h| h.max(0.0));
                Bounds { min: c - half, max: c + half }
            }
            Intent::Outside => {
                // Beyond the region along x, on a side fixed at spawn.
                let near = outer.x + BOUNDARY_MARGIN;
                let far = near + OUTSIDE_BAND;
                let (lo, hi) = if positive_side { (near, far) } else { (-far, -near) };
                Bounds {
                    min: Vector3::new(c.x + lo, c.y - inner.y, c.z - outer.z),
                    max: Vector3::new(c.x + hi, c.y + inner.y, c.z + outer.z),
                }
            }
            Intent::Wander => {
                let half = outer + Vector3::repeat(OUTSIDE_BAND * 0.5);
                Bounds { min: c - half, max: c + half }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> SurvivalRegion {
        SurvivalRegion::aabb(Point3::origin(), Vector3::new(20.0, 10.0, 20.0))
    }

    #[test]
    fn test_oracle_determinism() {
        let mut a = PlayerOracle::new(42, Some(region()), 4.0);
        let mut b = PlayerOracle::new(42, Some(region()), 4.0);

        for i in 0..6 {
            assert_eq!(a.spawn_random(PeerId::from_seed(i)), b.spawn_random(PeerId::from_seed(i)));
        }
        for _ in 0..300 {
            a.step(1.0 / 30.0);
            b.step(1.0 / 30.0);
        }
        for (pa, pb) in a.players().iter().zip(b.players()) {
            assert_eq!(pa.pose(), pb.pose());
        }
    }

    #[test]
    fn test_fixed_intents_hold_over_time() {
        let mut oracle = PlayerOracle::new(7, Some(region()), 6.0);
        let inside = PeerId::from_seed(1);
        let outside = PeerId::from_seed(2);
        oracle.spawn(inside, Intent::Inside);
        oracle.spawn(outside, Intent::Outside);

        for _ in 0..3000 {
            oracle.step(0.1);
            let eliminated = oracle.expected_eliminated();
            assert!(!eliminated.contains(&inside));
            assert!(eliminated.contains(&outside));
        }
    }

    #[test]
    fn test_sphere_region_intents() {
        let sphere = SurvivalRegion::sphere(Point3::new(5.0, 0.0, 5.0), 12.0);
        let mut oracle = PlayerOracle::new(3, Some(sphere), 3.0);
        let inside = PeerId::from_seed(1);
        let outside = PeerId::from_seed(2);
        oracle.spawn(inside, Intent::Inside);
        oracle.spawn(outside, Intent::Outside);
        oracle.step(1.0);

        assert_eq!(oracle.expected_eliminated().into_iter().collect::<Vec<_>>(), vec![outside]);
    }

    #[test]
    fn test_missing_region_eliminates_everyone() {
        let mut oracle = PlayerOracle::new(1, None, 2.0);
        oracle.spawn(PeerId::from_seed(1), Intent::Inside);
        oracle.spawn(PeerId::from_seed(2), Intent::Outside);
        assert_eq!(oracle.expected_eliminated().len(), 2);
    }

    #[test]
    fn test_deactivated_player_not_expected() {
        let mut oracle = PlayerOracle::new(1, Some(region()), 2.0);
        let gone = PeerId::from_seed(4);
        oracle.spawn(gone, Intent::Outside);
        oracle.deactivate(gone);
        oracle.step(1.0);
        assert!(oracle.expected_eliminated().is_empty());
        assert_eq!(oracle.active_players().count(), 0);
    }
}
