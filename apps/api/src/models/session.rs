//! Session, participant and playback models
//!
//! The state machine lives here as plain functions over owned data so the
//! orchestrator can run a transition on a copy and only persist it when the
//! whole step succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Ready,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Terminal projection independent of `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum OverallStatus {
    OnGoing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum SessionType {
    Individual,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Left,
    Completed,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Left => "left",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("seek requires positionMs")]
    MissingPosition,
    #[error("positionMs must be non-negative (got {0})")]
    NegativePosition(i64),
    #[error("positionMs must not exceed {max} (got {0})", max = MAX_POSITION_MS)]
    PositionOutOfRange(i64),
}

/// Upper bound for any content position: one day of playback
pub const MAX_POSITION_MS: i64 = 24 * 60 * 60 * 1000;

/// Operator command; seek carries its absolute target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Pause,
    Seek { position_ms: i64 },
    Stop,
    Sync,
    Complete,
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Seek { .. } => "seek",
            Self::Stop => "stop",
            Self::Sync => "sync",
            Self::Complete => "complete",
        }
    }

    /// Parse a command from its route segment and optional body position
    pub fn from_parts(name: &str, position_ms: Option<i64>) -> Result<Self, CommandParseError> {
        match name.to_ascii_lowercase().as_str() {
            "start" | "resume" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "seek" => match position_ms {
                None => Err(CommandParseError::MissingPosition),
                Some(p) if p < 0 => Err(CommandParseError::NegativePosition(p)),
                Some(p) if p > MAX_POSITION_MS => Err(CommandParseError::PositionOutOfRange(p)),
                Some(position_ms) => Ok(Self::Seek { position_ms }),
            },
            "stop" => Ok(Self::Stop),
            "sync" => Ok(Self::Sync),
            "complete" => Ok(Self::Complete),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

impl std::fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A command that is not legal in the current status
#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{command}' not allowed while {status}")]
pub struct TransitionRejected {
    pub command: &'static str,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Playback clock
// ---------------------------------------------------------------------------

/// Where a clock is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPhase {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl ClockPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

/// Authoritative timing for a session or a single participant
///
/// `anchor_elapsed_ms` is the running time at which `last_position_ms` was
/// set, so the expected position keeps advancing after a seek.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackClock {
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub pause_duration_ms: i64,
    pub total_duration_ms: Option<i64>,
    pub last_position_ms: i64,
    pub anchor_elapsed_ms: i64,
}

impl PlaybackClock {
    pub fn phase(&self) -> ClockPhase {
        if self.stopped_at.is_some() {
            ClockPhase::Stopped
        } else if self.started_at.is_none() {
            ClockPhase::Idle
        } else if self.paused_at.is_some() {
            ClockPhase::Paused
        } else {
            ClockPhase::Running
        }
    }

    /// Running time excluding pauses, frozen while paused or stopped
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        let Some(started_at) = self.started_at else {
            return 0;
        };
        let end = self.stopped_at.or(self.paused_at).unwrap_or(now);
        (end - started_at)
            .num_milliseconds()
            .saturating_sub(self.pause_duration_ms)
            .max(0)
    }

    /// Position a device following this clock should be at
    pub fn expected_position_ms(&self, now: DateTime<Utc>) -> i64 {
        self.last_position_ms
            .saturating_add(self.elapsed_ms(now))
            .saturating_sub(self.anchor_elapsed_ms)
            .max(0)
    }

    /// First start or resume; a no-op while already running
    pub fn start(&mut self, now: DateTime<Utc>) {
        match self.phase() {
            ClockPhase::Idle => {
                self.started_at = Some(now);
                self.anchor_elapsed_ms = 0;
            }
            ClockPhase::Paused => self.fold_pause(now),
            ClockPhase::Running | ClockPhase::Stopped => {}
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) {
        if self.phase() == ClockPhase::Running {
            self.paused_at = Some(now);
        }
    }

    pub fn seek(&mut self, position_ms: i64, now: DateTime<Utc>) {
        self.anchor_elapsed_ms = self.elapsed_ms(now);
        self.last_position_ms = position_ms;
    }

    /// Freeze the clock; an open pause is counted as paused time
    pub fn stop(&mut self, now: DateTime<Utc>) {
        if self.phase() == ClockPhase::Stopped {
            return;
        }
        if self.paused_at.is_some() {
            self.fold_pause(now);
        }
        self.stopped_at = Some(now);
        self.total_duration_ms = Some(match self.started_at {
            Some(started_at) => {
                (now - started_at)
                    .num_milliseconds()
                    .saturating_sub(self.pause_duration_ms)
                    .max(0)
            }
            None => 0,
        });
    }

    fn fold_pause(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.paused_at.take() {
            self.pause_duration_ms = self
                .pause_duration_ms
                .saturating_add((now - paused_at).num_milliseconds().max(0));
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub pair_id: Option<Uuid>,
    pub vr_device_id: Option<String>,
    pub chair_device_id: Option<String>,
    pub status: SessionStatus,
    pub overall_status: OverallStatus,
    pub session_type: SessionType,
    pub group_id: Option<Uuid>,
    pub journey_ids: Vec<String>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub clock: PlaybackClock,
    pub last_command: Option<String>,
    /// Stamped on every published command
    pub command_seq: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new_individual(
        pair_id: Uuid,
        vr_device_id: impl Into<String>,
        chair_device_id: impl Into<String>,
        journey_ids: Vec<String>,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pair_id: Some(pair_id),
            vr_device_id: Some(vr_device_id.into()),
            chair_device_id: Some(chair_device_id.into()),
            ..Self::blank(SessionType::Individual, journey_ids, status, now)
        }
    }

    pub fn new_group(journey_ids: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            group_id: Some(Uuid::new_v4()),
            ..Self::blank(SessionType::Group, journey_ids, SessionStatus::Ready, now)
        }
    }

    fn blank(
        session_type: SessionType,
        journey_ids: Vec<String>,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pair_id: None,
            vr_device_id: None,
            chair_device_id: None,
            status,
            overall_status: OverallStatus::OnGoing,
            session_type,
            group_id: None,
            journey_ids,
            clock: PlaybackClock::default(),
            last_command: None,
            command_seq: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn position_ms(&self, now: DateTime<Utc>) -> i64 {
        self.clock.expected_position_ms(now)
    }

    /// Validate and apply a command to the session status and clock
    pub fn apply(
        &mut self,
        command: SessionCommand,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        use SessionStatus::*;

        let allowed = match command {
            SessionCommand::Start => matches!(self.status, Pending | Ready | Paused),
            SessionCommand::Pause => self.status == Running,
            SessionCommand::Complete => self.status == Running,
            SessionCommand::Seek { .. } | SessionCommand::Stop | SessionCommand::Sync => {
                !self.status.is_terminal()
            }
        };
        if !allowed {
            return Err(TransitionRejected {
                command: command.name(),
                status: self.status.to_string(),
            });
        }

        match command {
            SessionCommand::Start => {
                self.clock.start(now);
                self.status = Running;
            }
            SessionCommand::Pause => {
                self.clock.pause(now);
                self.status = Paused;
            }
            SessionCommand::Seek { position_ms } => self.clock.seek(position_ms, now),
            SessionCommand::Stop => self.finish(Stopped, now),
            SessionCommand::Complete => self.finish(Completed, now),
            SessionCommand::Sync => {}
        }

        self.last_command = Some(command.name().to_string());
        self.updated_at = now;
        Ok(())
    }

    fn finish(&mut self, status: SessionStatus, now: DateTime<Utc>) {
        self.clock.stop(now);
        self.status = status;
        self.overall_status = OverallStatus::Completed;
        self.is_active = false;
    }

    /// Advance and return the command sequence for the next publish
    pub fn next_seq(&mut self) -> i64 {
        self.command_seq += 1;
        self.command_seq
    }

    /// Devices directly bound to an individual session
    pub fn bound_devices(&self) -> Vec<String> {
        self.vr_device_id
            .iter()
            .chain(self.chair_device_id.iter())
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionParticipant {
    pub id: Uuid,
    pub session_id: Uuid,
    pub pair_id: Option<Uuid>,
    pub vr_device_id: String,
    pub chair_device_id: String,
    pub participant_code: Option<String>,
    pub language: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub sync_ok_rate: Option<f64>,
    pub avg_drift_ms: Option<f64>,
    pub max_drift_ms: Option<f64>,
    pub status: ParticipantStatus,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub clock: PlaybackClock,
}

/// Optional per-seat details for group creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatInfo {
    pub participant_code: Option<String>,
    pub language: Option<String>,
}

impl SessionParticipant {
    pub fn new(
        session_id: Uuid,
        pair_id: Option<Uuid>,
        vr_device_id: impl Into<String>,
        chair_device_id: impl Into<String>,
        seat: SeatInfo,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            pair_id,
            vr_device_id: vr_device_id.into(),
            chair_device_id: chair_device_id.into(),
            participant_code: seat.participant_code,
            language: seat.language,
            joined_at: now,
            left_at: None,
            sync_ok_rate: None,
            avg_drift_ms: None,
            max_drift_ms: None,
            status: ParticipantStatus::Active,
            clock: PlaybackClock::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }

    pub fn devices(&self) -> [&str; 2] {
        [&self.vr_device_id, &self.chair_device_id]
    }

    /// Apply a command addressed to this participant alone
    pub fn apply(
        &mut self,
        command: SessionCommand,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        let phase = self.clock.phase();
        let allowed = self.is_active()
            && match command {
                SessionCommand::Start => matches!(phase, ClockPhase::Idle | ClockPhase::Paused),
                SessionCommand::Pause | SessionCommand::Complete => phase == ClockPhase::Running,
                SessionCommand::Seek { .. } | SessionCommand::Stop | SessionCommand::Sync => true,
            };
        if !allowed {
            let status = if self.is_active() {
                phase.as_str().to_string()
            } else {
                self.status.to_string()
            };
            return Err(TransitionRejected {
                command: command.name(),
                status,
            });
        }
        self.follow(command, now);
        Ok(())
    }

    /// Mirror a session-wide command onto this participant's clock
    pub fn follow(&mut self, command: SessionCommand, now: DateTime<Utc>) {
        if !self.is_active() {
            return;
        }
        match command {
            SessionCommand::Start => self.clock.start(now),
            SessionCommand::Pause => self.clock.pause(now),
            SessionCommand::Seek { position_ms } => self.clock.seek(position_ms, now),
            SessionCommand::Stop => self.leave(ParticipantStatus::Left, now),
            SessionCommand::Complete => self.leave(ParticipantStatus::Completed, now),
            SessionCommand::Sync => {}
        }
    }

    /// End this participant when the whole session ends
    pub fn finish_with_session(&mut self, now: DateTime<Utc>) {
        if self.is_active() {
            self.leave(ParticipantStatus::Completed, now);
        }
    }

    fn leave(&mut self, status: ParticipantStatus, now: DateTime<Utc>) {
        self.clock.stop(now);
        self.status = status;
        self.left_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Append-only records
// ---------------------------------------------------------------------------

/// One playback attempt by a participant, written when it closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEntry {
    pub id: Uuid,
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub journey_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub completed: bool,
    pub vr_sync_ok: bool,
    pub chair_sync_ok: bool,
    pub avg_drift_ms: f64,
    pub max_drift_ms: f64,
    pub error_code: Option<String>,
}

/// Audit trail of transitions and device-reported events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub event: String,
    pub journey_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub device_id: Option<String>,
    pub position_ms: Option<i64>,
    pub error_code: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SessionLog {
    pub fn new(session_id: Uuid, event: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            event: event.into(),
            journey_id: None,
            start_time: None,
            end_time: None,
            duration_ms: None,
            device_id: None,
            position_ms: None,
            error_code: None,
            details: serde_json::Value::Object(Default::default()),
            created_at: now,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_position(mut self, position_ms: i64) -> Self {
        self.position_ms = Some(position_ms);
        self
    }

    pub fn with_journey(mut self, journey_id: Option<String>) -> Self {
        self.journey_id = journey_id;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_clock(mut self, clock: &PlaybackClock) -> Self {
        self.start_time = clock.started_at;
        self.end_time = clock.stopped_at;
        self.duration_ms = clock.total_duration_ms;
        self
    }
}

/// Session together with its participants, as returned to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    pub participants: Vec<SessionParticipant>,
    pub position_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn session(status: SessionStatus) -> Session {
        Session::new_individual(
            Uuid::new_v4(),
            "VR_#001",
            "CHAIR_#001",
            vec!["journey-1".to_string()],
            status,
            t0(),
        )
    }

    #[test]
    fn test_pause_resume_scenario() {
        let mut s = session(SessionStatus::Pending);

        s.apply(SessionCommand::Start, t0()).unwrap();
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.clock.started_at, Some(t0()));

        let paused = t0() + Duration::seconds(10);
        s.apply(SessionCommand::Pause, paused).unwrap();
        assert_eq!(s.status, SessionStatus::Paused);
        assert_eq!(s.clock.paused_at, Some(paused));
        let position_at_pause = s.position_ms(paused);

        let resumed = paused + Duration::seconds(5);
        s.apply(SessionCommand::Start, resumed).unwrap();
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.clock.pause_duration_ms, 5_000);
        assert!(s.clock.paused_at.is_none());
        assert_eq!(s.position_ms(resumed), position_at_pause);
        assert_eq!(s.clock.last_position_ms, 0);

        let stopped = resumed + Duration::seconds(20);
        s.apply(SessionCommand::Stop, stopped).unwrap();
        assert_eq!(s.status, SessionStatus::Stopped);
        assert_eq!(s.overall_status, OverallStatus::Completed);
        assert_eq!(s.clock.stopped_at, Some(stopped));
        assert_eq!(s.clock.total_duration_ms, Some(30_000));
        assert!(!s.is_active);
    }

    #[rstest]
    #[case(SessionStatus::Pending)]
    #[case(SessionStatus::Ready)]
    #[case(SessionStatus::Running)]
    #[case(SessionStatus::Paused)]
    fn test_stop_from_any_live_status(#[case] status: SessionStatus) {
        let mut s = session(status);
        if matches!(status, SessionStatus::Running | SessionStatus::Paused) {
            s.clock.start(t0());
        }
        if status == SessionStatus::Paused {
            s.clock.pause(t0() + Duration::seconds(1));
        }
        s.apply(SessionCommand::Stop, t0() + Duration::seconds(3))
            .unwrap();
        assert_eq!(s.overall_status, OverallStatus::Completed);
        assert_eq!(s.status, SessionStatus::Stopped);
    }

    #[rstest]
    #[case(SessionStatus::Stopped, SessionCommand::Start)]
    #[case(SessionStatus::Stopped, SessionCommand::Stop)]
    #[case(SessionStatus::Completed, SessionCommand::Sync)]
    #[case(SessionStatus::Completed, SessionCommand::Seek { position_ms: 10 })]
    #[case(SessionStatus::Ready, SessionCommand::Pause)]
    #[case(SessionStatus::Paused, SessionCommand::Pause)]
    #[case(SessionStatus::Paused, SessionCommand::Complete)]
    #[case(SessionStatus::Running, SessionCommand::Start)]
    fn test_rejected_transitions(#[case] status: SessionStatus, #[case] command: SessionCommand) {
        let mut s = session(status);
        let before = s.clone();
        let err = s.apply(command, t0()).unwrap_err();
        assert_eq!(err.command, command.name());
        assert_eq!(s, before);
    }

    #[test]
    fn test_stop_during_pause_counts_open_pause() {
        let mut s = session(SessionStatus::Ready);
        s.apply(SessionCommand::Start, t0()).unwrap();
        s.apply(SessionCommand::Pause, t0() + Duration::seconds(4))
            .unwrap();
        s.apply(SessionCommand::Stop, t0() + Duration::seconds(10))
            .unwrap();
        assert_eq!(s.clock.pause_duration_ms, 6_000);
        assert_eq!(s.clock.total_duration_ms, Some(4_000));
    }

    #[test]
    fn test_seek_reanchors_expected_position() {
        let mut clock = PlaybackClock::default();
        clock.start(t0());
        clock.seek(60_000, t0() + Duration::seconds(2));
        assert_eq!(clock.expected_position_ms(t0() + Duration::seconds(2)), 60_000);
        assert_eq!(clock.expected_position_ms(t0() + Duration::seconds(5)), 63_000);

        clock.pause(t0() + Duration::seconds(5));
        // frozen while paused
        assert_eq!(clock.expected_position_ms(t0() + Duration::seconds(50)), 63_000);
    }

    #[test]
    fn test_seek_before_start() {
        let mut s = session(SessionStatus::Pending);
        s.apply(SessionCommand::Seek { position_ms: 12_000 }, t0())
            .unwrap();
        assert_eq!(s.status, SessionStatus::Pending);
        s.apply(SessionCommand::Start, t0() + Duration::seconds(1))
            .unwrap();
        assert_eq!(s.position_ms(t0() + Duration::seconds(3)), 14_000);
    }

    #[test]
    fn test_complete_only_from_running() {
        let mut s = session(SessionStatus::Ready);
        assert!(s.apply(SessionCommand::Complete, t0()).is_err());
        s.apply(SessionCommand::Start, t0()).unwrap();
        s.apply(SessionCommand::Complete, t0() + Duration::seconds(90))
            .unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.overall_status, OverallStatus::Completed);
        assert_eq!(s.clock.total_duration_ms, Some(90_000));
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            SessionCommand::from_parts("Seek", Some(1500)),
            Ok(SessionCommand::Seek { position_ms: 1500 })
        );
        assert_eq!(
            SessionCommand::from_parts("seek", None),
            Err(CommandParseError::MissingPosition)
        );
        assert_eq!(
            SessionCommand::from_parts("seek", Some(-1)),
            Err(CommandParseError::NegativePosition(-1))
        );
        assert_eq!(
            SessionCommand::from_parts("rewind", None),
            Err(CommandParseError::Unknown("rewind".to_string()))
        );
        assert_eq!(
            SessionCommand::from_parts("seek", Some(i64::MAX)),
            Err(CommandParseError::PositionOutOfRange(i64::MAX))
        );
        assert_eq!(
            SessionCommand::from_parts("seek", Some(MAX_POSITION_MS)),
            Ok(SessionCommand::Seek { position_ms: MAX_POSITION_MS })
        );
        assert_eq!(SessionCommand::from_parts("resume", None), Ok(SessionCommand::Start));
    }

    #[test]
    fn test_extreme_stored_position_saturates() {
        // rows written before positions were bounded must still be readable
        let mut clock = PlaybackClock::default();
        clock.start(t0());
        clock.seek(i64::MAX, t0());
        assert_eq!(clock.expected_position_ms(t0() + Duration::seconds(1)), i64::MAX);

        clock.anchor_elapsed_ms = i64::MAX;
        clock.last_position_ms = 0;
        assert_eq!(clock.expected_position_ms(t0() + Duration::seconds(1)), 0);

        clock.pause_duration_ms = i64::MIN;
        assert_eq!(clock.elapsed_ms(t0() + Duration::seconds(1)), i64::MAX);
    }

    #[test]
    fn test_participant_diverges_from_session() {
        let mut p = SessionParticipant::new(
            Uuid::new_v4(),
            None,
            "VR_#001",
            "CHAIR_#001",
            SeatInfo::default(),
            t0(),
        );
        p.follow(SessionCommand::Start, t0());
        p.apply(SessionCommand::Pause, t0() + Duration::seconds(3))
            .unwrap();
        assert_eq!(p.clock.phase(), ClockPhase::Paused);

        // pausing twice is rejected at participant level
        let err = p
            .apply(SessionCommand::Pause, t0() + Duration::seconds(4))
            .unwrap_err();
        assert_eq!(err.status, "paused");

        p.apply(SessionCommand::Stop, t0() + Duration::seconds(5))
            .unwrap();
        assert_eq!(p.status, ParticipantStatus::Left);
        assert!(p.left_at.is_some());

        // a left participant ignores session-wide commands
        let before = p.clone();
        p.follow(SessionCommand::Start, t0() + Duration::seconds(6));
        assert_eq!(p, before);
        assert!(p.apply(SessionCommand::Sync, t0()).is_err());
    }
}
