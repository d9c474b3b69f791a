//! Session orchestrator
//!
//! Owns the session state machine end to end: a command is applied to a copy
//! of the session and its participants, committed to the store together with
//! its log entry, and only then fanned out to devices. Commands for one
//! session run one at a time behind a FIFO lock; different sessions proceed
//! in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    DevicePair, SeatInfo, Session, SessionCommand, SessionDetail, SessionLog,
    SessionParticipant, SessionStatus, SessionType,
};
use crate::repositories::{PaginatedResult, Pagination, SharedStore};
use crate::services::clock::SharedClock;
use crate::services::commands::CommandDispatcher;
use crate::services::presence::PresenceTracker;
use crate::services::telemetry::{EntryOutcome, TelemetryService};
use crate::transport::messages::CommandMessage;
use crate::transport::observer::{ObserverEvent, ObserverHub, SessionUpdate};
use crate::transport::topics::Topic;

pub struct SessionOrchestrator {
    store: SharedStore,
    clock: SharedClock,
    presence: Arc<PresenceTracker>,
    commands: Arc<CommandDispatcher>,
    telemetry: Arc<TelemetryService>,
    observers: ObserverHub,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl SessionOrchestrator {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        presence: Arc<PresenceTracker>,
        commands: Arc<CommandDispatcher>,
        telemetry: Arc<TelemetryService>,
        observers: ObserverHub,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            presence,
            commands,
            telemetry,
            observers,
            locks: DashMap::new(),
        })
    }

    /// Create a session for one active pair
    ///
    /// The session starts `ready` when both devices are online and `pending`
    /// otherwise. With `auto_start` the start command runs straight away.
    pub async fn create_individual(
        &self,
        pair_id: Uuid,
        journey_ids: Vec<String>,
        auto_start: bool,
    ) -> ApiResult<SessionDetail> {
        let pair = self.active_pair(pair_id).await?;
        let now = self.clock.now();

        let online = self
            .presence
            .all_online([pair.vr_device_id.as_str(), pair.chair_device_id.as_str()]);
        let status = if online {
            SessionStatus::Ready
        } else {
            SessionStatus::Pending
        };

        let session = Session::new_individual(
            pair.id,
            &pair.vr_device_id,
            &pair.chair_device_id,
            journey_ids,
            status,
            now,
        );
        let participant = SessionParticipant::new(
            session.id,
            Some(pair.id),
            &pair.vr_device_id,
            &pair.chair_device_id,
            SeatInfo::default(),
            now,
        );
        let log = SessionLog::new(session.id, "created", now)
            .with_journey(session.journey_ids.first().cloned())
            .with_details(json!({
                "sessionType": "individual",
                "pairId": pair.id,
                "status": status,
            }));

        self.store
            .create_session(&session, std::slice::from_ref(&participant), &log)
            .await?;
        tracing::info!(
            session_id = %session.id,
            pair_id = %pair.id,
            status = %status,
            "Individual session created"
        );

        if auto_start {
            return self.command(session.id, SessionCommand::Start).await;
        }

        Ok(SessionDetail {
            position_ms: session.position_ms(now),
            session,
            participants: vec![participant],
        })
    }

    /// Create a group session with one participant per pair
    pub async fn create_group_from_pairs(
        &self,
        pair_ids: Vec<Uuid>,
        journey_ids: Vec<String>,
        seats: Vec<SeatInfo>,
    ) -> ApiResult<SessionDetail> {
        if pair_ids.is_empty() {
            return Err(ApiError::ValidationError(
                "a group session needs at least one pair".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = pair_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ApiError::ValidationError(format!(
                "pair {} listed more than once",
                duplicate
            )));
        }

        let mut pairs = Vec::with_capacity(pair_ids.len());
        for pair_id in &pair_ids {
            let pair = self.active_pair(*pair_id).await?;
            let offline: Vec<&str> = [pair.vr_device_id.as_str(), pair.chair_device_id.as_str()]
                .into_iter()
                .filter(|device_id| !self.presence.is_online(device_id))
                .collect();
            if !offline.is_empty() {
                return Err(ApiError::ValidationError(format!(
                    "pair {} has offline devices: {}",
                    pair.id,
                    offline.join(", ")
                )));
            }
            pairs.push(pair);
        }

        let now = self.clock.now();
        let session = Session::new_group(journey_ids, now);
        let mut seats = seats.into_iter();
        let participants: Vec<SessionParticipant> = pairs
            .iter()
            .map(|pair| {
                SessionParticipant::new(
                    session.id,
                    Some(pair.id),
                    &pair.vr_device_id,
                    &pair.chair_device_id,
                    seats.next().unwrap_or_default(),
                    now,
                )
            })
            .collect();
        let log = SessionLog::new(session.id, "created", now)
            .with_journey(session.journey_ids.first().cloned())
            .with_details(json!({
                "sessionType": "group",
                "groupId": session.group_id,
                "pairIds": pair_ids,
            }));

        self.store
            .create_session(&session, &participants, &log)
            .await?;
        tracing::info!(
            session_id = %session.id,
            participants = participants.len(),
            "Group session created"
        );

        Ok(SessionDetail {
            position_ms: session.position_ms(now),
            session,
            participants,
        })
    }

    pub async fn get_session(&self, session_id: Uuid) -> ApiResult<SessionDetail> {
        let session = self.load(session_id).await?;
        let participants = self.store.list_participants(session_id).await?;
        Ok(SessionDetail {
            position_ms: session.position_ms(self.clock.now()),
            session,
            participants,
        })
    }

    pub async fn logs(
        &self,
        session_id: Uuid,
        page: Pagination,
    ) -> ApiResult<PaginatedResult<SessionLog>> {
        self.load(session_id).await?;
        self.store.list_logs(session_id, page.clamped()).await
    }

    /// Apply a session-wide command
    pub async fn command(
        &self,
        session_id: Uuid,
        command: SessionCommand,
    ) -> ApiResult<SessionDetail> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.command_locked(session_id, command).await
        };
        drop(lock);
        self.release_session_lock(session_id);
        result
    }

    /// Apply a command to a single participant of a live session
    pub async fn command_participant(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        command: SessionCommand,
    ) -> ApiResult<SessionParticipant> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.command_participant_locked(session_id, participant_id, command)
                .await
        };
        drop(lock);
        self.release_session_lock(session_id);
        result
    }

    async fn command_participant_locked(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        command: SessionCommand,
    ) -> ApiResult<SessionParticipant> {
        let mut session = self.load(session_id).await?;
        let participants = self.store.list_participants(session_id).await?;
        let mut participant = participants
            .into_iter()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| ApiError::not_found("participant", participant_id.to_string()))?;

        if session.is_terminal() {
            let detail = self.detail(session, vec![participant.clone()]);
            return Err(ApiError::invalid_transition(
                "session",
                command,
                detail.session.status,
                &detail,
            ));
        }

        let now = self.clock.now();
        let was_active = participant.is_active();
        if let Err(rejected) = participant.apply(command, now) {
            return Err(ApiError::invalid_transition(
                "participant",
                rejected.command,
                rejected.status,
                &participant,
            ));
        }

        let seq = session.next_seq();
        session.updated_at = now;
        let unreachable = self.unreachable(participant.devices());
        let position_ms = participant.clock.expected_position_ms(now);
        let log = SessionLog::new(session.id, format!("participant_{}", command.name()), now)
            .with_position(position_ms)
            .with_journey(session.journey_ids.first().cloned())
            .with_details(json!({
                "participantId": participant.id,
                "commandSeq": seq,
                "status": participant.status,
                "unreachable": unreachable,
            }));

        self.store
            .commit_transition(&session, std::slice::from_ref(&participant), &[log])
            .await?;

        let message = CommandMessage {
            command: command.name().to_string(),
            session_id: Some(session.id),
            participant_id: Some(participant.id),
            status: Some(participant.clock.phase().as_str().to_string()),
            position_ms: Some(position_ms),
            command_seq: seq,
            issued_at: now,
            journey_ids: session.journey_ids.clone(),
            payload: serde_json::Value::Null,
        };
        self.commands
            .broadcast(
                &Topic::participant_command(session.id, participant.id, command.name()),
                &message,
            )
            .await;
        for device_id in participant.devices() {
            self.commands
                .dispatch(
                    device_id,
                    Topic::device_command(device_id, command.name()),
                    message.clone(),
                )
                .await;
        }

        tracing::info!(
            session_id = %session.id,
            participant_id = %participant.id,
            command = %command,
            seq,
            "Participant command applied"
        );

        self.telemetry.track(
            std::slice::from_ref(&participant),
            session.journey_ids.first().map(String::as_str),
        );
        if was_active && !participant.is_active() {
            self.close_entry(participant.id, EntryOutcome::Stopped).await;
        }
        self.observers.publish(ObserverEvent::Session(SessionUpdate {
            session_id: session.id,
            participant_id: Some(participant.id),
            command: command.name().to_string(),
            status: message.status.clone().unwrap_or_default(),
            position_ms,
            command_seq: seq,
            unreachable,
            at: now,
        }));

        Ok(participant)
    }

    /// Stop a live session, then remove it and everything scoped to it
    pub async fn delete_session(&self, session_id: Uuid) -> ApiResult<()> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.delete_locked(session_id).await
        };
        drop(lock);
        self.release_session_lock(session_id);
        result?;

        self.telemetry.forget_session(session_id);
        tracing::info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    async fn delete_locked(&self, session_id: Uuid) -> ApiResult<()> {
        let session = self.load(session_id).await?;
        if !session.is_terminal() {
            self.command_locked(session_id, SessionCommand::Stop).await?;
        }
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    async fn command_locked(
        &self,
        session_id: Uuid,
        command: SessionCommand,
    ) -> ApiResult<SessionDetail> {
        let current = self.load(session_id).await?;
        let mut participants = self.store.list_participants(session_id).await?;
        let now = self.clock.now();

        let mut session = current.clone();
        if let Err(rejected) = session.apply(command, now) {
            let detail = self.detail(current, participants);
            return Err(ApiError::invalid_transition(
                "session",
                rejected.command,
                rejected.status,
                &detail,
            ));
        }

        if command == SessionCommand::Sync
            && session.status == SessionStatus::Pending
            && self
                .presence
                .all_online(session.bound_devices().iter().map(String::as_str))
        {
            session.status = SessionStatus::Ready;
        }

        let previously_active: HashSet<Uuid> = participants
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.id)
            .collect();
        for participant in participants.iter_mut() {
            if session.is_terminal() {
                participant.finish_with_session(now);
            } else {
                participant.follow(command, now);
            }
        }

        let seq = session.next_seq();
        let position_ms = session.position_ms(now);
        let targets = self.targets(&session, &participants, &previously_active);
        let unreachable = self.unreachable(targets.iter().map(|(device, _)| device.as_str()));

        let mut log = SessionLog::new(session.id, command.name(), now)
            .with_position(position_ms)
            .with_journey(session.journey_ids.first().cloned())
            .with_details(json!({
                "commandSeq": seq,
                "status": session.status,
                "unreachable": unreachable,
            }));
        if session.is_terminal() {
            log = log.with_clock(&session.clock);
        }

        self.store
            .commit_transition(&session, &participants, &[log])
            .await?;

        let message = self.session_message(&session, command, seq, position_ms, now);
        self.commands
            .broadcast(&Topic::session_command(session.id, command.name()), &message)
            .await;
        for (device_id, participant_id) in &targets {
            let mut device_message = message.clone();
            if session.session_type == SessionType::Group {
                if let Some(participant) = participants.iter().find(|p| Some(p.id) == *participant_id) {
                    device_message.participant_id = Some(participant.id);
                    device_message.position_ms =
                        Some(participant.clock.expected_position_ms(now));
                }
            }
            self.commands
                .dispatch(
                    device_id,
                    Topic::device_command(device_id, command.name()),
                    device_message,
                )
                .await;
        }

        if !unreachable.is_empty() {
            tracing::warn!(
                session_id = %session.id,
                command = %command,
                unreachable = ?unreachable,
                "Published to offline devices"
            );
        }
        tracing::info!(
            session_id = %session.id,
            command = %command,
            status = %session.status,
            seq,
            "Session command applied"
        );

        self.telemetry
            .track(&participants, session.journey_ids.first().map(String::as_str));
        let outcome = if session.status == SessionStatus::Completed {
            EntryOutcome::Completed
        } else {
            EntryOutcome::Stopped
        };
        for participant in participants
            .iter()
            .filter(|p| previously_active.contains(&p.id) && !p.is_active())
        {
            self.close_entry(participant.id, outcome.clone()).await;
        }
        if session.is_terminal() {
            // aggregates are on the participant rows now
            self.telemetry.forget_session(session.id);
        }

        self.observers.publish(ObserverEvent::Session(SessionUpdate {
            session_id: session.id,
            participant_id: None,
            command: command.name().to_string(),
            status: session.status.to_string(),
            position_ms,
            command_seq: seq,
            unreachable,
            at: now,
        }));

        Ok(self.detail(session, participants))
    }

    /// Devices to publish to, with the participant each one sits in
    fn targets(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        previously_active: &HashSet<Uuid>,
    ) -> Vec<(String, Option<Uuid>)> {
        match session.session_type {
            SessionType::Individual => session
                .bound_devices()
                .into_iter()
                .map(|device_id| {
                    let participant_id = participants
                        .iter()
                        .find(|p| p.devices().contains(&device_id.as_str()))
                        .map(|p| p.id);
                    (device_id, participant_id)
                })
                .collect(),
            // a stop still has to reach seats that were active until now
            SessionType::Group => participants
                .iter()
                .filter(|p| previously_active.contains(&p.id))
                .flat_map(|p| {
                    p.devices()
                        .into_iter()
                        .map(move |device_id| (device_id.to_string(), Some(p.id)))
                })
                .collect(),
        }
    }

    fn unreachable<'a>(&self, device_ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        device_ids
            .into_iter()
            .filter(|device_id| !self.presence.is_online(device_id))
            .map(str::to_string)
            .collect()
    }

    fn session_message(
        &self,
        session: &Session,
        command: SessionCommand,
        seq: i64,
        position_ms: i64,
        now: DateTime<Utc>,
    ) -> CommandMessage {
        CommandMessage {
            command: command.name().to_string(),
            session_id: Some(session.id),
            participant_id: None,
            status: Some(session.status.to_string()),
            position_ms: Some(position_ms),
            command_seq: seq,
            issued_at: now,
            journey_ids: session.journey_ids.clone(),
            payload: serde_json::Value::Null,
        }
    }

    async fn close_entry(&self, participant_id: Uuid, outcome: EntryOutcome) {
        // the transition is already committed; a failed entry write is only logged
        if let Err(e) = self.telemetry.close_entry(participant_id, outcome).await {
            tracing::error!(
                participant_id = %participant_id,
                error = %e,
                "Failed to close playback entry"
            );
        }
    }

    fn detail(&self, session: Session, participants: Vec<SessionParticipant>) -> SessionDetail {
        SessionDetail {
            position_ms: session.position_ms(self.clock.now()),
            session,
            participants,
        }
    }

    async fn load(&self, session_id: Uuid) -> ApiResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ApiError::not_found("session", session_id.to_string()))
    }

    async fn active_pair(&self, pair_id: Uuid) -> ApiResult<DevicePair> {
        let pair = self
            .store
            .get_pair(pair_id)
            .await?
            .ok_or_else(|| ApiError::not_found("pair", pair_id.to_string()))?;
        if !pair.is_active {
            return Err(ApiError::ValidationError(format!(
                "pair {} is no longer active",
                pair_id
            )));
        }
        Ok(pair)
    }

    fn session_lock(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session's lock unless another command is holding or waiting on it
    fn release_session_lock(&self, session_id: Uuid) {
        self.locks
            .remove_if(&session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::models::{ClockPhase, DeviceKind, OverallStatus, ParticipantStatus};
    use crate::repositories::{MemoryStore, Store};
    use crate::services::clock::{Clock, ManualClock};
    use crate::transport::connection::ConnectionRegistry;
    use crate::transport::messages::HeartbeatPayload;
    use crate::transport::pubsub::MessageBus;
    use assert_matches::assert_matches;
    use chrono::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        presence: Arc<PresenceTracker>,
        commands: Arc<CommandDispatcher>,
        bus: MessageBus,
        orchestrator: Arc<SessionOrchestrator>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new();
        let policy = Policy::default();
        let presence = PresenceTracker::new(store.clone(), clock.clone(), policy.heartbeat_timeout());
        let bus = MessageBus::new_in_memory();
        let commands = CommandDispatcher::new(bus.clone(), ConnectionRegistry::new(), 16);
        let observers = ObserverHub::new();
        let telemetry =
            TelemetryService::new(store.clone(), clock.clone(), observers.clone(), &policy);
        let orchestrator = SessionOrchestrator::new(
            store.clone(),
            clock.clone(),
            presence.clone(),
            commands.clone(),
            telemetry,
            observers,
        );
        Harness {
            clock,
            store,
            presence,
            commands,
            bus,
            orchestrator,
        }
    }

    /// Record an active pair the way a completed bundle claim does
    async fn store_pair(h: &Harness, pair: &DevicePair) {
        let mut bundle = crate::models::PairingBundle::new(
            "100000".to_string(),
            Duration::seconds(120),
            None,
            h.clock.now(),
        );
        h.store.insert_bundle(&bundle).await.unwrap();
        bundle.vr_device_id = Some(pair.vr_device_id.clone());
        bundle.chair_device_id = Some(pair.chair_device_id.clone());
        bundle.completed = true;
        bundle.completed_at = Some(h.clock.now());
        h.store.complete_bundle(&bundle, pair).await.unwrap();
    }

    async fn online_pair(h: &Harness, vr: &str, chair: &str) -> DevicePair {
        for id in [vr, chair] {
            h.presence
                .record_heartbeat(id, HeartbeatPayload::default())
                .await;
        }
        let pair = DevicePair::new(vr, chair, h.clock.now());
        store_pair(h, &pair).await;
        pair
    }

    #[tokio::test]
    async fn test_individual_ready_when_online() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let detail = h
            .orchestrator
            .create_individual(pair.id, vec!["j1".into()], false)
            .await
            .unwrap();
        assert_eq!(detail.session.status, SessionStatus::Ready);
        assert_eq!(detail.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_individual_pending_then_sync_promotes() {
        let h = harness();
        let pair = DevicePair::new("VR_#002", "CHAIR_#002", h.clock.now());
        store_pair(&h, &pair).await;

        let detail = h
            .orchestrator
            .create_individual(pair.id, vec![], false)
            .await
            .unwrap();
        assert_eq!(detail.session.status, SessionStatus::Pending);

        for id in ["VR_#002", "CHAIR_#002"] {
            h.presence
                .record_heartbeat(id, HeartbeatPayload::default())
                .await;
        }
        let synced = h
            .orchestrator
            .command(detail.session.id, SessionCommand::Sync)
            .await
            .unwrap();
        assert_eq!(synced.session.status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn test_pause_resume_accumulates_pause() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let id = h
            .orchestrator
            .create_individual(pair.id, vec![], true)
            .await
            .unwrap()
            .session
            .id;

        h.clock.advance(Duration::seconds(10));
        h.orchestrator.command(id, SessionCommand::Pause).await.unwrap();
        h.clock.advance(Duration::seconds(5));
        let resumed = h.orchestrator.command(id, SessionCommand::Start).await.unwrap();

        assert_eq!(resumed.session.status, SessionStatus::Running);
        assert_eq!(resumed.session.clock.pause_duration_ms, 5_000);
        assert_eq!(resumed.position_ms, 10_000);
        assert_eq!(resumed.participants[0].clock.pause_duration_ms, 5_000);
    }

    #[tokio::test]
    async fn test_stop_is_terminal_and_rejects_further_commands() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let id = h
            .orchestrator
            .create_individual(pair.id, vec![], false)
            .await
            .unwrap()
            .session
            .id;

        let stopped = h.orchestrator.command(id, SessionCommand::Stop).await.unwrap();
        assert_eq!(stopped.session.status, SessionStatus::Stopped);
        assert_eq!(stopped.session.overall_status, OverallStatus::Completed);
        assert_eq!(stopped.participants[0].status, ParticipantStatus::Completed);

        let err = h
            .orchestrator
            .command(id, SessionCommand::Start)
            .await
            .unwrap_err();
        assert_matches!(err, ApiError::InvalidTransition { ref status, .. } if status == "stopped");
    }

    #[tokio::test]
    async fn test_fan_out_topics_and_seq() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let id = h
            .orchestrator
            .create_individual(pair.id, vec![], false)
            .await
            .unwrap()
            .session
            .id;

        let mut rx = h.bus.subscribe();
        h.orchestrator.command(id, SessionCommand::Start).await.unwrap();

        let mut topics = Vec::new();
        for _ in 0..3 {
            topics.push(rx.recv().await.unwrap().topic);
        }
        assert_eq!(topics[0], format!("sessions/{}/commands/start", id));
        assert!(topics.contains(&"devices/VR_#001/commands/start".to_string()));
        assert!(topics.contains(&"devices/CHAIR_#001/commands/start".to_string()));

        let queued = h.commands.drain("VR_#001");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].command.command_seq, 1);
        assert_eq!(queued[0].command.status.as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn test_offline_targets_logged_unreachable() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let id = h
            .orchestrator
            .create_individual(pair.id, vec![], false)
            .await
            .unwrap()
            .session
            .id;

        h.presence
            .force_offline("CHAIR_#001", crate::services::presence::PresenceReason::LastWill);
        h.orchestrator.command(id, SessionCommand::Start).await.unwrap();

        // still queued for the offline chair
        assert_eq!(h.commands.pending("CHAIR_#001"), 1);
        let logs = h.orchestrator.logs(id, Pagination::default()).await.unwrap();
        let start = logs.items.iter().find(|l| l.event == "start").unwrap();
        assert_eq!(start.details["unreachable"], json!(["CHAIR_#001"]));
    }

    #[tokio::test]
    async fn test_group_requires_online_pairs() {
        let h = harness();
        let online = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let offline = DevicePair::new("VR_#009", "CHAIR_#009", h.clock.now());
        store_pair(&h, &offline).await;

        let err = h
            .orchestrator
            .create_group_from_pairs(vec![online.id, offline.id], vec![], vec![])
            .await
            .unwrap_err();
        assert_matches!(err, ApiError::ValidationError(_));

        let err = h
            .orchestrator
            .create_group_from_pairs(vec![online.id, online.id], vec![], vec![])
            .await
            .unwrap_err();
        assert_matches!(err, ApiError::ValidationError(_));
    }

    #[tokio::test]
    async fn test_participant_stop_leaves_others_running() {
        let h = harness();
        let a = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let b = online_pair(&h, "VR_#002", "CHAIR_#002").await;
        let detail = h
            .orchestrator
            .create_group_from_pairs(vec![a.id, b.id], vec![], vec![])
            .await
            .unwrap();
        let id = detail.session.id;
        h.orchestrator.command(id, SessionCommand::Start).await.unwrap();

        let first = detail.participants[0].id;
        let left = h
            .orchestrator
            .command_participant(id, first, SessionCommand::Stop)
            .await
            .unwrap();
        assert_eq!(left.status, ParticipantStatus::Left);

        h.clock.advance(Duration::seconds(3));
        let paused = h.orchestrator.command(id, SessionCommand::Pause).await.unwrap();
        let other = paused.participants.iter().find(|p| p.id != first).unwrap();
        assert_eq!(other.clock.phase(), ClockPhase::Paused);
        let gone = paused.participants.iter().find(|p| p.id == first).unwrap();
        assert_eq!(gone.clock.phase(), ClockPhase::Stopped);
    }

    #[tokio::test]
    async fn test_persistence_failure_publishes_nothing() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let id = h
            .orchestrator
            .create_individual(pair.id, vec![], false)
            .await
            .unwrap()
            .session
            .id;

        let mut rx = h.bus.subscribe();
        h.store.set_write_failure(true);
        let err = h.orchestrator.command(id, SessionCommand::Start).await;
        assert!(err.is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(h.commands.pending("VR_#001"), 0);

        h.store.set_write_failure(false);
        let session = h.store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn test_delete_stops_live_session() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;
        let id = h
            .orchestrator
            .create_individual(pair.id, vec![], true)
            .await
            .unwrap()
            .session
            .id;

        let mut rx = h.bus.subscribe();
        h.orchestrator.delete_session(id).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().topic,
            format!("sessions/{}/commands/stop", id)
        );
        assert_matches!(
            h.orchestrator.get_session(id).await,
            Err(ApiError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_finished_sessions_release_in_memory_state() {
        let h = harness();
        let pair = online_pair(&h, "VR_#001", "CHAIR_#001").await;

        for _ in 0..20 {
            let detail = h
                .orchestrator
                .create_individual(pair.id, vec![], true)
                .await
                .unwrap();
            let participant_id = detail.participants[0].id;
            h.clock.advance(Duration::seconds(2));
            h.orchestrator
                .telemetry
                .report_progress(detail.session.id, participant_id, 2_000, None, DeviceKind::Vr)
                .await
                .unwrap();
            h.orchestrator
                .command(detail.session.id, SessionCommand::Stop)
                .await
                .unwrap();

            let stored = h.store.list_participants(detail.session.id).await.unwrap();
            assert_eq!(stored[0].sync_ok_rate, Some(1.0));
        }

        assert!(h.orchestrator.locks.is_empty());
        assert_eq!(h.orchestrator.telemetry.tracked_participants(), 0);
    }
}
