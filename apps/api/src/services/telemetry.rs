//! Sync/drift telemetry
//!
//! Devices report where they are in the content; drift is the distance from
//! where the participant's authoritative clock says they should be. No
//! samples are stored: each playback entry and each participant keeps a
//! running (Welford) mean, a running max and ok/total counts per side.
//!
//! Entries open when a participant's clock first starts and close when the
//! participant stops, completes or errors, at which point the aggregates are
//! written to the participant row together with a [`PlaybackEntry`].

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Policy;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    ClockPhase, DeviceKind, PlaybackClock, PlaybackEntry, SessionParticipant, MAX_POSITION_MS,
};
use crate::repositories::SharedStore;
use crate::services::clock::SharedClock;
use crate::transport::observer::{ObserverEvent, ObserverHub};

/// Running drift statistics for one stream of samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftStats {
    pub count: u64,
    pub ok_count: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

impl DriftStats {
    pub fn push(&mut self, drift_ms: f64, ok: bool) {
        self.count += 1;
        if ok {
            self.ok_count += 1;
        }
        self.mean_ms += (drift_ms - self.mean_ms) / self.count as f64;
        if drift_ms > self.max_ms {
            self.max_ms = drift_ms;
        }
    }

    /// Combine two disjoint sample streams
    pub fn merge(&self, other: &DriftStats) -> DriftStats {
        let count = self.count + other.count;
        if count == 0 {
            return DriftStats::default();
        }
        DriftStats {
            count,
            ok_count: self.ok_count + other.ok_count,
            mean_ms: (self.mean_ms * self.count as f64 + other.mean_ms * other.count as f64)
                / count as f64,
            max_ms: self.max_ms.max(other.max_ms),
        }
    }

    pub fn ok_rate(&self) -> Option<f64> {
        (self.count > 0).then(|| self.ok_count as f64 / self.count as f64)
    }
}

/// Per-side statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SideStats {
    pub vr: DriftStats,
    pub chair: DriftStats,
}

impl SideStats {
    fn side_mut(&mut self, side: DeviceKind) -> &mut DriftStats {
        match side {
            DeviceKind::Vr => &mut self.vr,
            DeviceKind::Chair => &mut self.chair,
        }
    }

    pub fn combined(&self) -> DriftStats {
        self.vr.merge(&self.chair)
    }
}

/// Result of evaluating one progress report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftSample {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub side: DeviceKind,
    pub reported_position_ms: i64,
    pub expected_position_ms: i64,
    pub drift_ms: f64,
    pub sync_ok: bool,
    pub evaluated_at: DateTime<Utc>,
}

/// Session-level rollup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub session_id: Uuid,
    pub avg_drift_ms: Option<f64>,
    pub max_drift_ms: Option<f64>,
    pub sync_ok_rate: Option<f64>,
    pub samples: u64,
}

/// How a playback entry ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Completed,
    Stopped,
    Error(String),
}

/// Clock and identity of a participant as the orchestrator last committed it
#[derive(Debug, Clone)]
struct LiveParticipant {
    session_id: Uuid,
    vr_device_id: String,
    chair_device_id: String,
    active: bool,
    clock: PlaybackClock,
}

#[derive(Debug, Clone)]
struct OpenEntry {
    session_id: Uuid,
    journey_id: Option<String>,
    start_time: DateTime<Utc>,
    stats: SideStats,
}

pub struct TelemetryService {
    store: SharedStore,
    clock: SharedClock,
    observers: ObserverHub,
    threshold_ms: f64,
    max_skew_ms: i64,
    min_ok_rate: f64,
    live: DashMap<Uuid, LiveParticipant>,
    entries: DashMap<Uuid, OpenEntry>,
    totals: DashMap<Uuid, (Uuid, SideStats)>,
}

impl TelemetryService {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        observers: ObserverHub,
        policy: &Policy,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            observers,
            threshold_ms: policy.sync_drift_threshold_ms as f64,
            max_skew_ms: policy.sync_max_clock_skew_ms,
            min_ok_rate: policy.sync_min_ok_rate,
            live: DashMap::new(),
            entries: DashMap::new(),
            totals: DashMap::new(),
        })
    }

    /// Refresh the live clocks after a committed transition, opening an entry
    /// for any participant whose clock has started
    pub fn track(&self, participants: &[SessionParticipant], journey_id: Option<&str>) {
        for participant in participants {
            if participant.is_active() {
                self.live.insert(participant.id, LiveParticipant::from(participant));
            } else {
                self.live.remove(&participant.id);
            }
            let started = participant.is_active()
                && matches!(
                    participant.clock.phase(),
                    ClockPhase::Running | ClockPhase::Paused
                );
            if started && !self.entries.contains_key(&participant.id) {
                let start_time = participant
                    .clock
                    .started_at
                    .unwrap_or_else(|| self.clock.now());
                self.entries.insert(
                    participant.id,
                    OpenEntry {
                        session_id: participant.session_id,
                        journey_id: journey_id.map(str::to_string),
                        start_time,
                        stats: SideStats::default(),
                    },
                );
                tracing::debug!(participant_id = %participant.id, "Playback entry opened");
            }
        }
    }

    /// Evaluate one progress report against the participant's clock
    pub async fn report_progress(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        position_ms: i64,
        device_clock_ms: Option<i64>,
        side: DeviceKind,
    ) -> ApiResult<DriftSample> {
        if !(0..=MAX_POSITION_MS).contains(&position_ms) {
            return Err(ApiError::ValidationError(format!(
                "positionMs {} outside 0..={}",
                position_ms, MAX_POSITION_MS
            )));
        }
        let live = self.live_participant(session_id, participant_id).await?;
        if !live.active {
            return Err(ApiError::ValidationError(format!(
                "participant {} is no longer active",
                participant_id
            )));
        }

        let received_at = self.clock.now();
        let evaluated_at = self.evaluation_instant(received_at, device_clock_ms);
        let expected_position_ms = live.clock.expected_position_ms(evaluated_at);
        let drift_ms = position_ms.abs_diff(expected_position_ms) as f64;
        let sync_ok = drift_ms < self.threshold_ms;

        if let Some(mut entry) = self.entries.get_mut(&participant_id) {
            entry.stats.side_mut(side).push(drift_ms, sync_ok);
        }
        self.totals
            .entry(participant_id)
            .or_insert_with(|| (session_id, SideStats::default()))
            .1
            .side_mut(side)
            .push(drift_ms, sync_ok);

        let sample = DriftSample {
            session_id,
            participant_id,
            side,
            reported_position_ms: position_ms,
            expected_position_ms,
            drift_ms,
            sync_ok,
            evaluated_at,
        };

        if !sync_ok {
            tracing::debug!(
                participant_id = %participant_id,
                side = %side,
                drift_ms,
                "Drift above threshold"
            );
        }
        self.observers.publish(ObserverEvent::Drift(sample.clone()));
        Ok(sample)
    }

    /// Report from a device, with the side inferred from which seat it holds
    pub async fn report_from_device(
        &self,
        device_id: &str,
        session_id: Uuid,
        participant_id: Uuid,
        position_ms: i64,
        device_clock_ms: Option<i64>,
        side: Option<DeviceKind>,
    ) -> ApiResult<DriftSample> {
        let live = self.live_participant(session_id, participant_id).await?;
        let inferred = if live.vr_device_id == device_id {
            Some(DeviceKind::Vr)
        } else if live.chair_device_id == device_id {
            Some(DeviceKind::Chair)
        } else {
            None
        };
        let side = match (side, inferred) {
            (Some(side), _) | (None, Some(side)) => side,
            (None, None) => {
                return Err(ApiError::ValidationError(format!(
                    "device {} is not seated for participant {}",
                    device_id, participant_id
                )));
            }
        };
        self.report_progress(session_id, participant_id, position_ms, device_clock_ms, side)
            .await
    }

    /// Close the participant's open entry and persist its aggregates
    pub async fn close_entry(
        &self,
        participant_id: Uuid,
        outcome: EntryOutcome,
    ) -> ApiResult<Option<PlaybackEntry>> {
        let Some((_, open)) = self.entries.remove(&participant_id) else {
            self.evict(participant_id);
            return Ok(None);
        };

        let mut participant = self
            .store
            .list_participants(open.session_id)
            .await?
            .into_iter()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| ApiError::not_found("participant", participant_id.to_string()))?;

        let now = self.clock.now();
        let end_time = participant.clock.stopped_at.unwrap_or(now);
        let combined = open.stats.combined();
        let entry = PlaybackEntry {
            id: Uuid::new_v4(),
            session_id: open.session_id,
            participant_id,
            journey_id: open.journey_id,
            start_time: open.start_time,
            end_time: Some(end_time),
            duration_ms: participant
                .clock
                .total_duration_ms
                .unwrap_or_else(|| participant.clock.elapsed_ms(end_time)),
            completed: outcome == EntryOutcome::Completed,
            vr_sync_ok: self.side_ok(&open.stats.vr),
            chair_sync_ok: self.side_ok(&open.stats.chair),
            avg_drift_ms: combined.mean_ms,
            max_drift_ms: combined.max_ms,
            error_code: match &outcome {
                EntryOutcome::Error(code) => Some(code.clone()),
                _ => None,
            },
        };

        if let Some(total) = self.totals.get(&participant_id) {
            let all = total.1.combined();
            participant.sync_ok_rate = all.ok_rate();
            participant.avg_drift_ms = (all.count > 0).then_some(all.mean_ms);
            participant.max_drift_ms = (all.count > 0).then_some(all.max_ms);
        }

        self.store.close_playback(&entry, &participant).await?;
        self.evict(participant_id);
        tracing::info!(
            participant_id = %participant_id,
            completed = entry.completed,
            avg_drift_ms = entry.avg_drift_ms,
            "Playback entry closed"
        );
        Ok(Some(entry))
    }

    /// Weighted rollup over every participant of the session
    pub async fn stats_for(&self, session_id: Uuid) -> ApiResult<SyncStats> {
        let live: Vec<DriftStats> = self
            .totals
            .iter()
            .filter(|entry| entry.value().0 == session_id)
            .map(|entry| entry.value().1.combined())
            .collect();

        if !live.is_empty() {
            let all = live
                .iter()
                .fold(DriftStats::default(), |acc, stats| acc.merge(stats));
            return Ok(SyncStats {
                session_id,
                avg_drift_ms: (all.count > 0).then_some(all.mean_ms),
                max_drift_ms: (all.count > 0).then_some(all.max_ms),
                sync_ok_rate: all.ok_rate(),
                samples: all.count,
            });
        }

        // nothing in memory (e.g. after a restart): fall back to stored rows
        if self.store.get_session(session_id).await?.is_none() {
            return Err(ApiError::not_found("session", session_id.to_string()));
        }
        let participants = self.store.list_participants(session_id).await?;
        let stored: Vec<&SessionParticipant> = participants
            .iter()
            .filter(|p| p.avg_drift_ms.is_some())
            .collect();
        let n = stored.len() as f64;
        Ok(SyncStats {
            session_id,
            avg_drift_ms: (!stored.is_empty())
                .then(|| stored.iter().filter_map(|p| p.avg_drift_ms).sum::<f64>() / n),
            max_drift_ms: stored
                .iter()
                .filter_map(|p| p.max_drift_ms)
                .reduce(f64::max),
            sync_ok_rate: (!stored.is_empty())
                .then(|| stored.iter().filter_map(|p| p.sync_ok_rate).sum::<f64>() / n),
            samples: 0,
        })
    }

    /// Drop all in-memory state for a deleted session
    pub fn forget_session(&self, session_id: Uuid) {
        self.live.retain(|_, live| live.session_id != session_id);
        self.entries.retain(|_, entry| entry.session_id != session_id);
        self.totals.retain(|_, (sid, _)| *sid != session_id);
    }

    /// Drop in-memory state of a participant whose aggregates are persisted
    fn evict(&self, participant_id: Uuid) {
        self.live.remove(&participant_id);
        self.totals.remove(&participant_id);
    }

    pub fn tracked_participants(&self) -> usize {
        self.live.len() + self.totals.len()
    }

    pub fn participant_stats(&self, participant_id: Uuid) -> Option<SideStats> {
        self.totals.get(&participant_id).map(|total| total.1)
    }

    fn side_ok(&self, stats: &DriftStats) -> bool {
        // a side that never reported is not held against the entry
        stats.ok_rate().map_or(true, |rate| rate >= self.min_ok_rate)
    }

    fn evaluation_instant(
        &self,
        received_at: DateTime<Utc>,
        device_clock_ms: Option<i64>,
    ) -> DateTime<Utc> {
        let Some(device_ms) = device_clock_ms else {
            return received_at;
        };
        let skew_ms = device_ms.abs_diff(received_at.timestamp_millis());
        if skew_ms > self.max_skew_ms.unsigned_abs() {
            return received_at;
        }
        Utc.timestamp_millis_opt(device_ms)
            .single()
            .unwrap_or(received_at)
    }

    async fn live_participant(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
    ) -> ApiResult<LiveParticipant> {
        if let Some(live) = self.live.get(&participant_id) {
            if live.session_id != session_id {
                return Err(ApiError::not_found("participant", participant_id.to_string()));
            }
            return Ok(live.clone());
        }

        // not seen since restart: load from the store once
        let participant = self
            .store
            .list_participants(session_id)
            .await?
            .into_iter()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| ApiError::not_found("participant", participant_id.to_string()))?;
        let live = LiveParticipant::from(&participant);
        if live.active {
            self.live.insert(participant_id, live.clone());
        }
        Ok(live)
    }
}

impl From<&SessionParticipant> for LiveParticipant {
    fn from(participant: &SessionParticipant) -> Self {
        Self {
            session_id: participant.session_id,
            vr_device_id: participant.vr_device_id.clone(),
            chair_device_id: participant.chair_device_id.clone(),
            active: participant.is_active(),
            clock: participant.clock.clone(),
        }
    }
}
