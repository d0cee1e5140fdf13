//! JSON exporter for simulation traces.
//!
//! Exports simulation frames as JSON so a run can be replayed or plotted
//! outside the harness.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

use crate::oracle::Intent;
use crate::world::SimWorld;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    pub tick: u64,

    /// Host round phase
    pub round_phase: String,

    /// Countdown text the host's own player is showing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<String>,

    /// Scenes the host has loaded
    pub scenes: Vec<String>,

    /// Ground truth player positions
    pub players: Vec<PlayerFrame>,

    /// Live replicated entities on the host
    pub entity_count: usize,

    /// Events (joins, resolutions, hand-offs, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Ground truth and host state of one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerFrame {
    pub peer: String,
    pub intent: Intent,
    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// Inside the survival region right now
    pub inside: bool,

    /// Host has this player's entity eliminated
    pub eliminated: bool,
    pub connected: bool,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

impl SimFrame {
    /// Captures the world's current state and takes its pending events.
    pub fn capture(world: &mut SimWorld) -> Self {
        let events = world.take_events().into_iter().map(SimEvent::info).collect();
        let session = &world.session;
        let region = world.oracle.region();

        let players = world
            .oracle
            .players()
            .iter()
            .map(|p| {
                let eliminated = session
                    .roster()
                    .get(p.peer)
                    .and_then(|slot| slot.entity)
                    .and_then(|id| session.registry().get(id))
                    .and_then(|e| e.vitals)
                    .map(|v| v.eliminated)
                    .unwrap_or(false);
                PlayerFrame {
                    peer: p.peer.to_string(),
                    intent: p.intent,
                    x: p.position.x,
                    y: p.position.y,
                    z: p.position.z,
                    inside: region.map(|r| r.contains(&p.pose().position)).unwrap_or(false),
                    eliminated,
                    connected: p.active,
                }
            })
            .collect();

        let time_sec = world.time();
        let countdown = world
            .peer(world.host_peer())
            .and_then(|host| host.view.countdown_display(time_sec, &world.config.session.round));

        Self {
            time_sec,
            tick: world.tick_count(),
            round_phase: format!("{:?}", session.round().phase()),
            countdown,
            scenes: session.loaded_scenes().to_vec(),
            players,
            entity_count: session.registry().len(),
            events,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimConfig;

    #[test]
    fn test_capture_reports_players_and_events() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        world.start().unwrap();
        world.run_for(2.0);

        let frame = SimFrame::capture(&mut world);
        assert_eq!(frame.players.len(), 4);
        assert_eq!(frame.round_phase, "CountingDown");
        assert_eq!(frame.scenes, vec!["arena".to_string()]);
        assert!(frame.countdown.is_some());
        assert_eq!(frame.events.len(), 4);

        // Events are taken once.
        assert!(SimFrame::capture(&mut world).events.is_empty());
    }

    #[test]
    fn test_export_serializes() {
        let mut world = SimWorld::new(SimConfig::default()).unwrap();
        world.start().unwrap();
        world.step();

        let mut export = SimExport::new("standard_round", 42);
        export.add_frame(SimFrame::capture(&mut world));
        export.finalize(true, None);

        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"scenario\":\"standard_round\""));
        assert!(!json.contains("failure_reason"));
        assert!(export.duration_sec > 0.0);
    }
}
