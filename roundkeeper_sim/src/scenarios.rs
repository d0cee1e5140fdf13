//! Round lifecycle scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Full countdown, survival check, revive, fallback hand-off
    StandardRound,

    /// DST-002: A peer ends the round early over the network
    EarlyEnd,

    /// DST-003: Players joining after placeholder conversion
    LateJoin,

    /// DST-004: Players leaving while the countdown runs
    DisconnectMidRound,

    /// DST-005: Orchestrated hand-off with competing transition requests
    TransitionSpam,

    /// DST-006: No survival region configured
    MissingRegion,

    /// DST-007: Composite structure with missing anchors and parts
    CompositeAnchors,

    /// DST-008: Re-entering the play scene mid-countdown
    Reentry,

    /// DST-009: Play, lobby, play again, with a late joiner in the second round
    SecondRound,

    /// DST-010: A player connecting while a transition is loading
    JoinDuringLoad,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StandardRound,
            ScenarioId::EarlyEnd,
            ScenarioId::LateJoin,
            ScenarioId::DisconnectMidRound,
            ScenarioId::TransitionSpam,
            ScenarioId::MissingRegion,
            ScenarioId::CompositeAnchors,
            ScenarioId::Reentry,
            ScenarioId::SecondRound,
            ScenarioId::JoinDuringLoad,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::StandardRound => "standard_round",
            ScenarioId::EarlyEnd => "early_end",
            ScenarioId::LateJoin => "late_join",
            ScenarioId::DisconnectMidRound => "disconnect_mid_round",
            ScenarioId::TransitionSpam => "transition_spam",
            ScenarioId::MissingRegion => "missing_region",
            ScenarioId::CompositeAnchors => "composite_anchors",
            ScenarioId::Reentry => "reentry",
            ScenarioId::SecondRound => "second_round",
            ScenarioId::JoinDuringLoad => "join_during_load",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::StandardRound => "Countdown to zero, eliminate outside players, revive after 3s, load lobby",
            ScenarioId::EarlyEnd => "Peer requests end-early mid-countdown; repeat requests are ignored",
            ScenarioId::LateJoin => "Two players join after conversion and get exactly one replay each",
            ScenarioId::DisconnectMidRound => "Players drop mid-countdown; resolution covers only those left",
            ScenarioId::TransitionSpam => "Orchestrated hand-off while extra transitions are requested",
            ScenarioId::MissingRegion => "No survival region: every player is eliminated",
            ScenarioId::CompositeAnchors => "Root with parts on anchors; unknown anchors and items are skipped",
            ScenarioId::Reentry => "Play scene reloaded mid-countdown; only the new countdown resolves",
            ScenarioId::SecondRound => "Back in the play scene: level data converts again and replays the new records",
            ScenarioId::JoinDuringLoad => "Player joins mid-transition and follows the pending load",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard_round" | "standardround" | "dst-001" => Ok(ScenarioId::StandardRound),
            "early_end" | "earlyend" | "dst-002" => Ok(ScenarioId::EarlyEnd),
            "late_join" | "latejoin" | "dst-003" => Ok(ScenarioId::LateJoin),
            "disconnect_mid_round" | "disconnect" | "dst-004" => Ok(ScenarioId::DisconnectMidRound),
            "transition_spam" | "transitionspam" | "dst-005" => Ok(ScenarioId::TransitionSpam),
            "missing_region" | "missingregion" | "dst-006" => Ok(ScenarioId::MissingRegion),
            "composite_anchors" | "composite" | "dst-007" => Ok(ScenarioId::CompositeAnchors),
            "reentry" | "dst-008" => Ok(ScenarioId::Reentry),
            "second_round" | "secondround" | "dst-009" => Ok(ScenarioId::SecondRound),
            "join_during_load" | "joinduringload" | "dst-010" => Ok(ScenarioId::JoinDuringLoad),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
