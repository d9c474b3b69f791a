//! Postgres store built on sqlx
//!
//! Queries are checked at runtime (`query_as::<_, T>`), matching the rest of
//! the codebase; the schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{PaginatedResult, Pagination, Store};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Device, DeviceKind, DevicePair, PairingBundle, PairingCode, PlaybackEntry, Session,
    SessionLog, SessionParticipant, UpsertDevice,
};

/// Postgres-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const UPSERT_PARTICIPANT: &str = r#"
    INSERT INTO session_participants (
        id, session_id, pair_id, vr_device_id, chair_device_id, participant_code, language,
        joined_at, left_at, sync_ok_rate, avg_drift_ms, max_drift_ms, status,
        started_at, paused_at, stopped_at, pause_duration_ms, total_duration_ms,
        last_position_ms, anchor_elapsed_ms
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
    ON CONFLICT (id) DO UPDATE SET
        left_at = EXCLUDED.left_at,
        sync_ok_rate = EXCLUDED.sync_ok_rate,
        avg_drift_ms = EXCLUDED.avg_drift_ms,
        max_drift_ms = EXCLUDED.max_drift_ms,
        status = EXCLUDED.status,
        started_at = EXCLUDED.started_at,
        paused_at = EXCLUDED.paused_at,
        stopped_at = EXCLUDED.stopped_at,
        pause_duration_ms = EXCLUDED.pause_duration_ms,
        total_duration_ms = EXCLUDED.total_duration_ms,
        last_position_ms = EXCLUDED.last_position_ms,
        anchor_elapsed_ms = EXCLUDED.anchor_elapsed_ms
"#;

async fn save_participant(
    conn: &mut PgConnection,
    p: &SessionParticipant,
) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_PARTICIPANT)
        .bind(p.id)
        .bind(p.session_id)
        .bind(p.pair_id)
        .bind(&p.vr_device_id)
        .bind(&p.chair_device_id)
        .bind(&p.participant_code)
        .bind(&p.language)
        .bind(p.joined_at)
        .bind(p.left_at)
        .bind(p.sync_ok_rate)
        .bind(p.avg_drift_ms)
        .bind(p.max_drift_ms)
        .bind(p.status)
        .bind(p.clock.started_at)
        .bind(p.clock.paused_at)
        .bind(p.clock.stopped_at)
        .bind(p.clock.pause_duration_ms)
        .bind(p.clock.total_duration_ms)
        .bind(p.clock.last_position_ms)
        .bind(p.clock.anchor_elapsed_ms)
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_log(conn: &mut PgConnection, log: &SessionLog) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO session_logs (
            id, session_id, event, journey_id, start_time, end_time, duration_ms,
            device_id, position_ms, error_code, details, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(log.id)
    .bind(log.session_id)
    .bind(&log.event)
    .bind(&log.journey_id)
    .bind(log.start_time)
    .bind(log.end_time)
    .bind(log.duration_ms)
    .bind(&log.device_id)
    .bind(log.position_ms)
    .bind(&log.error_code)
    .bind(&log.details)
    .bind(log.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_device(&self, device: UpsertDevice, now: DateTime<Utc>) -> ApiResult<Device> {
        let record = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (id, hardware_id, kind, metadata, created_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id)
            DO UPDATE SET
                hardware_id = COALESCE(EXCLUDED.hardware_id, devices.hardware_id),
                kind = EXCLUDED.kind,
                metadata = EXCLUDED.metadata,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING *
            "#,
        )
        .bind(&device.id)
        .bind(&device.hardware_id)
        .bind(device.kind)
        .bind(&device.metadata)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_device(&self, id: &str) -> ApiResult<Option<Device>> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn find_device_by_hardware_id(&self, hardware_id: &str) -> ApiResult<Option<Device>> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE hardware_id = $1")
            .bind(hardware_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    async fn touch_device(&self, id: &str, at: DateTime<Utc>) -> ApiResult<()> {
        sqlx::query(
            r#"
            UPDATE devices
            SET last_seen_at = GREATEST(COALESCE(last_seen_at, $2), $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_display_number(&self, kind: DeviceKind) -> ApiResult<u32> {
        let value: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO device_counters (kind, value) VALUES ($1, 1)
            ON CONFLICT (kind) DO UPDATE SET value = device_counters.value + 1
            RETURNING value
            "#,
        )
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        u32::try_from(value)
            .map_err(|_| ApiError::Internal(format!("display counter out of range: {}", value)))
    }

    async fn list_devices(&self, page: Pagination) -> ApiResult<PaginatedResult<Device>> {
        let page = page.clamped();
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        let items = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices ORDER BY id LIMIT $1 OFFSET $2",
        )
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(PaginatedResult {
            items,
            total: total.max(0) as u64,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn code_in_use(&self, code: &str, now: DateTime<Utc>) -> ApiResult<bool> {
        let in_use: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pairing_bundles
                WHERE code = $1 AND NOT completed AND expires_at > $2
            ) OR EXISTS (
                SELECT 1 FROM pairing_codes
                WHERE code = $1 AND NOT claimed AND expires_at > $2
            )
            "#,
        )
        .bind(code)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }

    async fn insert_pairing_code(&self, code: &PairingCode) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pairing_codes (code, kind, expires_at, claimed, claimed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&code.code)
        .bind(code.kind)
        .bind(code.expires_at)
        .bind(code.claimed)
        .bind(code.claimed_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pairing_code(&self, code: &str) -> ApiResult<Option<PairingCode>> {
        let found = sqlx::query_as::<_, PairingCode>(
            "SELECT * FROM pairing_codes WHERE code = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found)
    }

    async fn mark_code_claimed(&self, code: &str, at: DateTime<Utc>) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pairing_codes
            SET claimed = TRUE, claimed_at = $2
            WHERE code = $1
              AND NOT claimed
              AND created_at = (SELECT MAX(created_at) FROM pairing_codes WHERE code = $1)
            "#,
        )
        .bind(code)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_bundle(&self, bundle: &PairingBundle) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pairing_bundles (
                id, code, expires_at, vr_device_id, chair_device_id,
                completed, completed_at, target_pair_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(bundle.id)
        .bind(&bundle.code)
        .bind(bundle.expires_at)
        .bind(&bundle.vr_device_id)
        .bind(&bundle.chair_device_id)
        .bind(bundle.completed)
        .bind(bundle.completed_at)
        .bind(bundle.target_pair_id)
        .bind(bundle.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bundle_by_code(&self, code: &str) -> ApiResult<Option<PairingBundle>> {
        let bundle = sqlx::query_as::<_, PairingBundle>(
            "SELECT * FROM pairing_bundles WHERE code = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(bundle)
    }

    async fn update_bundle(&self, bundle: &PairingBundle) -> ApiResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pairing_bundles
            SET vr_device_id = $2, chair_device_id = $3, completed = $4, completed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(bundle.id)
        .bind(&bundle.vr_device_id)
        .bind(&bundle.chair_device_id)
        .bind(bundle.completed)
        .bind(bundle.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::not_found("pairing bundle", &bundle.code));
        }
        Ok(())
    }

    async fn complete_bundle(&self, bundle: &PairingBundle, pair: &DevicePair) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE device_pairs
            SET is_active = FALSE, updated_at = $4
            WHERE is_active
              AND id <> $1
              AND (vr_device_id IN ($2, $3) OR chair_device_id IN ($2, $3))
            "#,
        )
        .bind(pair.id)
        .bind(&pair.vr_device_id)
        .bind(&pair.chair_device_id)
        .bind(pair.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO device_pairs (
                id, name, vr_device_id, chair_device_id, is_active, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                vr_device_id = EXCLUDED.vr_device_id,
                chair_device_id = EXCLUDED.chair_device_id,
                is_active = EXCLUDED.is_active,
                notes = EXCLUDED.notes,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(pair.id)
        .bind(&pair.name)
        .bind(&pair.vr_device_id)
        .bind(&pair.chair_device_id)
        .bind(pair.is_active)
        .bind(&pair.notes)
        .bind(pair.created_at)
        .bind(pair.updated_at)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE pairing_bundles
            SET vr_device_id = $2, chair_device_id = $3, completed = $4, completed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(bundle.id)
        .bind(&bundle.vr_device_id)
        .bind(&bundle.chair_device_id)
        .bind(bundle.completed)
        .bind(bundle.completed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::not_found("pairing bundle", &bundle.code));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_expired_pairing(&self, now: DateTime<Utc>) -> ApiResult<u64> {
        let mut tx = self.pool.begin().await?;
        let bundles = sqlx::query(
            "DELETE FROM pairing_bundles WHERE NOT completed AND expires_at <= $1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let codes = sqlx::query("DELETE FROM pairing_codes WHERE NOT claimed AND expires_at <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(bundles.rows_affected() + codes.rows_affected())
    }

    async fn get_pair(&self, id: Uuid) -> ApiResult<Option<DevicePair>> {
        let pair = sqlx::query_as::<_, DevicePair>("SELECT * FROM device_pairs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(pair)
    }

    async fn active_pair_for_device(&self, device_id: &str) -> ApiResult<Option<DevicePair>> {
        let pair = sqlx::query_as::<_, DevicePair>(
            r#"
            SELECT * FROM device_pairs
            WHERE is_active AND (vr_device_id = $1 OR chair_device_id = $1)
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pair)
    }

    async fn deactivate_pair(&self, id: Uuid, at: DateTime<Utc>) -> ApiResult<Option<DevicePair>> {
        let pair = sqlx::query_as::<_, DevicePair>(
            r#"
            UPDATE device_pairs SET is_active = FALSE, updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pair)
    }

    async fn create_session(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        log: &SessionLog,
    ) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, pair_id, vr_device_id, chair_device_id, status, overall_status,
                session_type, group_id, journey_ids, started_at, paused_at, stopped_at,
                pause_duration_ms, total_duration_ms, last_position_ms, anchor_elapsed_ms,
                last_command, command_seq, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21)
            "#,
        )
        .bind(session.id)
        .bind(session.pair_id)
        .bind(&session.vr_device_id)
        .bind(&session.chair_device_id)
        .bind(session.status)
        .bind(session.overall_status)
        .bind(session.session_type)
        .bind(session.group_id)
        .bind(&session.journey_ids)
        .bind(session.clock.started_at)
        .bind(session.clock.paused_at)
        .bind(session.clock.stopped_at)
        .bind(session.clock.pause_duration_ms)
        .bind(session.clock.total_duration_ms)
        .bind(session.clock.last_position_ms)
        .bind(session.clock.anchor_elapsed_ms)
        .bind(&session.last_command)
        .bind(session.command_seq)
        .bind(session.is_active)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        for participant in participants {
            save_participant(&mut *tx, participant).await?;
        }
        insert_log(&mut *tx, log).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> ApiResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn list_participants(&self, session_id: Uuid) -> ApiResult<Vec<SessionParticipant>> {
        let participants = sqlx::query_as::<_, SessionParticipant>(
            "SELECT * FROM session_participants WHERE session_id = $1 ORDER BY joined_at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(participants)
    }

    async fn commit_transition(
        &self,
        session: &Session,
        participants: &[SessionParticipant],
        logs: &[SessionLog],
    ) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                status = $2,
                overall_status = $3,
                started_at = $4,
                paused_at = $5,
                stopped_at = $6,
                pause_duration_ms = $7,
                total_duration_ms = $8,
                last_position_ms = $9,
                anchor_elapsed_ms = $10,
                last_command = $11,
                command_seq = $12,
                is_active = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.status)
        .bind(session.overall_status)
        .bind(session.clock.started_at)
        .bind(session.clock.paused_at)
        .bind(session.clock.stopped_at)
        .bind(session.clock.pause_duration_ms)
        .bind(session.clock.total_duration_ms)
        .bind(session.clock.last_position_ms)
        .bind(session.clock.anchor_elapsed_ms)
        .bind(&session.last_command)
        .bind(session.command_seq)
        .bind(session.is_active)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::not_found("session", session.id.to_string()));
        }

        for participant in participants {
            save_participant(&mut *tx, participant).await?;
        }
        for log in logs {
            insert_log(&mut *tx, log).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> ApiResult<bool> {
        // children cascade
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_log(&self, log: &SessionLog) -> ApiResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_log(&mut *conn, log).await?;
        Ok(())
    }

    async fn list_logs(
        &self,
        session_id: Uuid,
        page: Pagination,
    ) -> ApiResult<PaginatedResult<SessionLog>> {
        let page = page.clamped();
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM session_logs WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        let items = sqlx::query_as::<_, SessionLog>(
            r#"
            SELECT * FROM session_logs
            WHERE session_id = $1
            ORDER BY created_at, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(session_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(PaginatedResult {
            items,
            total: total.max(0) as u64,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn close_playback(
        &self,
        entry: &PlaybackEntry,
        participant: &SessionParticipant,
    ) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE session_participants
            SET sync_ok_rate = $2, avg_drift_ms = $3, max_drift_ms = $4
            WHERE id = $1
            "#,
        )
        .bind(participant.id)
        .bind(participant.sync_ok_rate)
        .bind(participant.avg_drift_ms)
        .bind(participant.max_drift_ms)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO playback_entries (
                id, session_id, participant_id, journey_id, start_time, end_time, duration_ms,
                completed, vr_sync_ok, chair_sync_ok, avg_drift_ms, max_drift_ms, error_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.session_id)
        .bind(entry.participant_id)
        .bind(&entry.journey_id)
        .bind(entry.start_time)
        .bind(entry.end_time)
        .bind(entry.duration_ms)
        .bind(entry.completed)
        .bind(entry.vr_sync_ok)
        .bind(entry.chair_sync_ok)
        .bind(entry.avg_drift_ms)
        .bind(entry.max_drift_ms)
        .bind(&entry.error_code)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_playback_entries(&self, session_id: Uuid) -> ApiResult<Vec<PlaybackEntry>> {
        let entries = sqlx::query_as::<_, PlaybackEntry>(
            "SELECT * FROM playback_entries WHERE session_id = $1 ORDER BY start_time",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn ping(&self) -> ApiResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
