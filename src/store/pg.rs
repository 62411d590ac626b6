use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use super::{AppointmentMove, FlowCommit, ScheduleStore, StoreError};
use crate::directory::{AppointmentType, AppointmentTypeCatalog, HolidayCalendar, ResourceDirectory, ResourceInfo};
use crate::scheduling::allocation::{ApplicationStatus, ResourceFilters, TemplateApplication};
use crate::scheduling::appointment::{
    Appointment, AppointmentStatus, BookingClaim, ConflictDetail, ResourceDimension, find_conflict,
};
use crate::scheduling::expansion::{ApplicationScope, ApplicationType};
use crate::scheduling::flow::{FlowStage, FlowStageHistory, PatientFlowState};
use crate::scheduling::occupancy::ResourceOccupancy;
use crate::scheduling::template::{ScheduleTemplate, TemplateKind, TemplateSlot, TemplateStatus};

const APPOINTMENT_COLUMNS: &str = "appointment_id, clinic_id, patient_id, provider_id, appointment_type_id, \
     chair_id, room_id, start_at, end_at, duration_min, status, confirmation_status, capacity, \
     cleanup_buffer_min, template_application_id, note, created_at, updated_at, deleted_at";

const FLOW_COLUMNS: &str = "flow_id, appointment_id, clinic_id, patient_id, provider_id, chair_id, \
     service_date, stage, priority, scheduled_at, checked_in_at, called_at, seated_at, completed_at, \
     checked_out_at, departed_at, current_wait_started_at, version, updated_at";

const OCCUPANCY_COLUMNS: &str = "resource_id, clinic_id, dimension, flow_id, appointment_id, patient_id, \
     occupied_at, expected_free_at, hold_status, hold_reason, held_at, updated_at";

const SLOT_COLUMNS: &str = "slot_id, position, start_time, end_time, day_of_week, appointment_type_id, \
     provider_id, chair_id, room_id, capacity, prep_buffer_min, cleanup_buffer_min, label";

const APPLICATION_COLUMNS: &str = "application_id, template_id, template_version, clinic_id, application_type, \
     scope, filters, status, generated_slots, skipped_conflict, skipped_holiday, skipped_invalid, \
     generated_through, applied_by, created_at, updated_at";

/// Postgres-backed store. Double-booking is prevented twice: advisory
/// locks plus a re-check inside the write transaction, and the exclusion
/// constraints on `appointment` underneath.
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

/* ============================================================
   Helpers
   ============================================================ */

/// Turns an exclusion-constraint violation into the conflict it stands for.
fn overlap_error(e: sqlx::Error, appointment: &Appointment) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23P01") {
            let dimension = match db.constraint() {
                Some("appointment_chair_no_overlap") => ResourceDimension::Chair,
                Some("appointment_room_no_overlap") => ResourceDimension::Room,
                _ => ResourceDimension::Provider,
            };
            if let Some(resource_id) = appointment.resource(dimension) {
                return StoreError::Overlap(ConflictDetail {
                    dimension,
                    resource_id,
                    existing_appointment_id: None,
                });
            }
        }
    }
    StoreError::Database(e)
}

fn seated_error(e: sqlx::Error, flow: &PatientFlowState) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") && db.constraint() == Some("patient_flow_one_in_chair") {
            if let Some(chair) = flow.chair_id {
                return StoreError::Overlap(ConflictDetail {
                    dimension: ResourceDimension::Chair,
                    resource_id: chair,
                    existing_appointment_id: None,
                });
            }
        }
    }
    StoreError::Database(e)
}

/// Serializes writers on each claimed timeline for the rest of the
/// transaction. Keys are taken in sorted order.
async fn lock_timelines(conn: &mut PgConnection, claim: &BookingClaim) -> Result<(), StoreError> {
    let mut keys = claim.resource_keys();
    keys.sort();
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn select_overlapping(
    conn: &mut PgConnection,
    clinic_id: Uuid,
    resources: &[(ResourceDimension, Uuid)],
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> Result<Vec<Appointment>, StoreError> {
    let ids = |dimension: ResourceDimension| -> Vec<Uuid> {
        resources
            .iter()
            .filter(|(d, _)| *d == dimension)
            .map(|(_, id)| *id)
            .collect()
    };

    let sql = format!(
        r#"
        SELECT {APPOINTMENT_COLUMNS}
        FROM appointment
        WHERE clinic_id = $1
          AND deleted_at IS NULL
          AND status <> $2
          AND start_at < $4
          AND end_at > $3
          AND (provider_id = ANY($5) OR chair_id = ANY($6) OR room_id = ANY($7))
        ORDER BY start_at, appointment_id
        "#
    );
    let rows = sqlx::query_as::<_, Appointment>(&sql)
        .bind(clinic_id)
        .bind(AppointmentStatus::Cancelled)
        .bind(start_at)
        .bind(end_at)
        .bind(ids(ResourceDimension::Provider))
        .bind(ids(ResourceDimension::Chair))
        .bind(ids(ResourceDimension::Room))
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

/// Locks the appointment's timelines and re-validates it inside the
/// caller's transaction.
async fn recheck(conn: &mut PgConnection, appointment: &Appointment) -> Result<(), StoreError> {
    if !appointment.is_live() {
        return Ok(());
    }
    let claim = appointment.claim();
    lock_timelines(conn, &claim).await?;
    let existing = select_overlapping(conn, claim.clinic_id, &claim.resources(), claim.start_at, claim.end_at).await?;
    match find_conflict(&claim, &existing, Some(appointment.appointment_id)) {
        Some(conflict) => Err(StoreError::Overlap(conflict)),
        None => Ok(()),
    }
}

/// Re-checks and writes an appointment inside the caller's transaction,
/// guarded by the status the caller read.
async fn update_appointment_row(
    conn: &mut PgConnection,
    appointment: &Appointment,
    expected_status: AppointmentStatus,
) -> Result<(), StoreError> {
    recheck(conn, appointment).await?;

    let result = sqlx::query(
        r#"
        UPDATE appointment
        SET provider_id = $2,
            chair_id = $3,
            room_id = $4,
            start_at = $5,
            end_at = $6,
            duration_min = $7,
            status = $8,
            confirmation_status = $9,
            note = $10,
            updated_at = $11,
            deleted_at = $12
        WHERE appointment_id = $1 AND status = $13 AND deleted_at IS NULL
        "#,
    )
    .bind(appointment.appointment_id)
    .bind(appointment.provider_id)
    .bind(appointment.chair_id)
    .bind(appointment.room_id)
    .bind(appointment.start_at)
    .bind(appointment.end_at)
    .bind(appointment.duration_min)
    .bind(appointment.status)
    .bind(appointment.confirmation_status)
    .bind(&appointment.note)
    .bind(appointment.updated_at)
    .bind(appointment.deleted_at)
    .bind(expected_status)
    .execute(&mut *conn)
    .await
    .map_err(|e| overlap_error(e, appointment))?;

    if result.rows_affected() == 1 {
        return Ok(());
    }
    let exists = sqlx::query("SELECT 1 FROM appointment WHERE appointment_id = $1")
        .bind(appointment.appointment_id)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if exists {
        Err(StoreError::StaleVersion)
    } else {
        Err(StoreError::NotFound {
            entity: "appointment",
            id: appointment.appointment_id,
        })
    }
}

async fn insert_template_row(conn: &mut PgConnection, template: &ScheduleTemplate) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO schedule_template
          (template_id, clinic_id, name, kind, status, version, parent_template_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(template.template_id)
    .bind(template.clinic_id)
    .bind(&template.name)
    .bind(template.kind)
    .bind(template.status)
    .bind(template.version)
    .bind(template.parent_template_id)
    .bind(template.created_at)
    .bind(template.updated_at)
    .execute(&mut *conn)
    .await?;
    insert_slots(conn, template.template_id, &template.slots).await
}

async fn insert_slots(conn: &mut PgConnection, template_id: Uuid, slots: &[TemplateSlot]) -> Result<(), StoreError> {
    for slot in slots {
        sqlx::query(
            r#"
            INSERT INTO template_slot
              (slot_id, template_id, position, start_time, end_time, day_of_week, appointment_type_id,
               provider_id, chair_id, room_id, capacity, prep_buffer_min, cleanup_buffer_min, label)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(slot.slot_id)
        .bind(template_id)
        .bind(slot.position)
        .bind(slot.start_time)
        .bind(slot.end_time)
        .bind(slot.day_of_week)
        .bind(slot.appointment_type_id)
        .bind(slot.provider_id)
        .bind(slot.chair_id)
        .bind(slot.room_id)
        .bind(slot.capacity)
        .bind(slot.prep_buffer_min)
        .bind(slot.cleanup_buffer_min)
        .bind(&slot.label)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn application_from_row(row: &PgRow) -> Result<TemplateApplication, sqlx::Error> {
    let Json(scope): Json<ApplicationScope> = row.try_get("scope")?;
    let Json(filters): Json<ResourceFilters> = row.try_get("filters")?;
    Ok(TemplateApplication {
        application_id: row.try_get("application_id")?,
        template_id: row.try_get("template_id")?,
        template_version: row.try_get("template_version")?,
        clinic_id: row.try_get("clinic_id")?,
        application_type: row.try_get::<ApplicationType, _>("application_type")?,
        scope,
        filters,
        status: row.try_get::<ApplicationStatus, _>("status")?,
        generated_slots: row.try_get("generated_slots")?,
        skipped_conflict: row.try_get("skipped_conflict")?,
        skipped_holiday: row.try_get("skipped_holiday")?,
        skipped_invalid: row.try_get("skipped_invalid")?,
        generated_through: row.try_get("generated_through")?,
        applied_by: row.try_get("applied_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_history(conn: &mut PgConnection, history: &FlowStageHistory) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO flow_stage_history (history_id, flow_id, appointment_id, stage, entered_at, triggered_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(history.history_id)
    .bind(history.flow_id)
    .bind(history.appointment_id)
    .bind(history.stage)
    .bind(history.entered_at)
    .bind(history.triggered_by)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Version-checked flow update.
async fn update_flow_row(
    conn: &mut PgConnection,
    flow: &PatientFlowState,
    expected_version: i32,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE patient_flow
        SET chair_id = $2,
            stage = $3,
            priority = $4,
            checked_in_at = $5,
            called_at = $6,
            seated_at = $7,
            completed_at = $8,
            checked_out_at = $9,
            departed_at = $10,
            current_wait_started_at = $11,
            version = $12,
            updated_at = $13,
            provider_id = $15,
            service_date = $16,
            scheduled_at = $17
        WHERE flow_id = $1 AND version = $14
        "#,
    )
    .bind(flow.flow_id)
    .bind(flow.chair_id)
    .bind(flow.stage)
    .bind(flow.priority)
    .bind(flow.checked_in_at)
    .bind(flow.called_at)
    .bind(flow.seated_at)
    .bind(flow.completed_at)
    .bind(flow.checked_out_at)
    .bind(flow.departed_at)
    .bind(flow.current_wait_started_at)
    .bind(flow.version)
    .bind(flow.updated_at)
    .bind(expected_version)
    .bind(flow.provider_id)
    .bind(flow.service_date)
    .bind(flow.scheduled_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| seated_error(e, flow))?;

    if result.rows_affected() == 1 {
        return Ok(());
    }
    let exists = sqlx::query("SELECT 1 FROM patient_flow WHERE flow_id = $1")
        .bind(flow.flow_id)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if exists {
        Err(StoreError::StaleVersion)
    } else {
        Err(StoreError::NotFound {
            entity: "flow",
            id: flow.flow_id,
        })
    }
}

async fn upsert_occupancy(conn: &mut PgConnection, record: &ResourceOccupancy) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO resource_occupancy
          (resource_id, clinic_id, dimension, flow_id, appointment_id, patient_id,
           occupied_at, expected_free_at, hold_status, hold_reason, held_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (resource_id) DO UPDATE
        SET clinic_id = EXCLUDED.clinic_id,
            dimension = EXCLUDED.dimension,
            flow_id = EXCLUDED.flow_id,
            appointment_id = EXCLUDED.appointment_id,
            patient_id = EXCLUDED.patient_id,
            occupied_at = EXCLUDED.occupied_at,
            expected_free_at = EXCLUDED.expected_free_at,
            hold_status = EXCLUDED.hold_status,
            hold_reason = EXCLUDED.hold_reason,
            held_at = EXCLUDED.held_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(record.resource_id)
    .bind(record.clinic_id)
    .bind(record.dimension)
    .bind(record.flow_id)
    .bind(record.appointment_id)
    .bind(record.patient_id)
    .bind(record.occupied_at)
    .bind(record.expected_free_at)
    .bind(record.hold_status)
    .bind(&record.hold_reason)
    .bind(record.held_at)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/* ============================================================
   ScheduleStore
   ============================================================ */

#[async_trait]
impl ScheduleStore for PgStore {
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        recheck(&mut tx, appointment).await?;

        sqlx::query(
            r#"
            INSERT INTO appointment
              (appointment_id, clinic_id, patient_id, provider_id, appointment_type_id, chair_id, room_id,
               start_at, end_at, duration_min, status, confirmation_status, capacity, cleanup_buffer_min,
               template_application_id, note, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(appointment.appointment_id)
        .bind(appointment.clinic_id)
        .bind(appointment.patient_id)
        .bind(appointment.provider_id)
        .bind(appointment.appointment_type_id)
        .bind(appointment.chair_id)
        .bind(appointment.room_id)
        .bind(appointment.start_at)
        .bind(appointment.end_at)
        .bind(appointment.duration_min)
        .bind(appointment.status)
        .bind(appointment.confirmation_status)
        .bind(appointment.capacity)
        .bind(appointment.cleanup_buffer_min)
        .bind(appointment.template_application_id)
        .bind(&appointment.note)
        .bind(appointment.created_at)
        .bind(appointment.updated_at)
        .bind(appointment.deleted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| overlap_error(e, appointment))?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected_status: AppointmentStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        update_appointment_row(&mut tx, appointment, expected_status).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reschedule_appointment(&self, change: &AppointmentMove) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        update_appointment_row(&mut tx, &change.appointment, change.expected_status).await?;
        if let Some(flow) = &change.flow {
            update_flow_row(&mut tx, flow, change.flow_expected_version).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointment WHERE appointment_id = $1");
        let row = sqlx::query_as::<_, Appointment>(&sql)
            .bind(appointment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn overlapping(
        &self,
        clinic_id: Uuid,
        resources: &[(ResourceDimension, Uuid)],
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        select_overlapping(&mut conn, clinic_id, resources, start_at, end_at).await
    }

    async fn appointments_between(
        &self,
        clinic_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
            FROM appointment
            WHERE clinic_id = $1
              AND deleted_at IS NULL
              AND status <> $2
              AND start_at >= $3
              AND start_at < $4
            ORDER BY start_at, appointment_id
            "#
        );
        let rows = sqlx::query_as::<_, Appointment>(&sql)
            .bind(clinic_id)
            .bind(AppointmentStatus::Cancelled)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn insert_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_template_row(&mut tx, template).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_template(&self, template: &ScheduleTemplate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE schedule_template
            SET name = $2, status = $3, updated_at = $4
            WHERE template_id = $1
            "#,
        )
        .bind(template.template_id)
        .bind(&template.name)
        .bind(template.status)
        .bind(template.updated_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "template",
                id: template.template_id,
            });
        }

        sqlx::query("DELETE FROM template_slot WHERE template_id = $1")
            .bind(template.template_id)
            .execute(&mut *tx)
            .await?;
        insert_slots(&mut tx, template.template_id, &template.slots).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_template(
        &self,
        retired: &ScheduleTemplate,
        successor: &ScheduleTemplate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE schedule_template
            SET status = $2, updated_at = $3
            WHERE template_id = $1 AND status = $4
            "#,
        )
        .bind(retired.template_id)
        .bind(retired.status)
        .bind(retired.updated_at)
        .bind(TemplateStatus::Active)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM schedule_template WHERE template_id = $1")
                .bind(retired.template_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return Err(if exists {
                StoreError::StaleVersion
            } else {
                StoreError::NotFound {
                    entity: "template",
                    id: retired.template_id,
                }
            });
        }

        insert_template_row(&mut tx, successor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn template(&self, template_id: Uuid) -> Result<Option<ScheduleTemplate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT template_id, clinic_id, name, kind, status, version, parent_template_id, created_at, updated_at
            FROM schedule_template
            WHERE template_id = $1
            "#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let sql = format!("SELECT {SLOT_COLUMNS} FROM template_slot WHERE template_id = $1 ORDER BY position");
        let slots = sqlx::query_as::<_, TemplateSlot>(&sql)
            .bind(template_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(Some(ScheduleTemplate {
            template_id: row.try_get("template_id")?,
            clinic_id: row.try_get("clinic_id")?,
            name: row.try_get("name")?,
            kind: row.try_get::<TemplateKind, _>("kind")?,
            status: row.try_get::<TemplateStatus, _>("status")?,
            version: row.try_get("version")?,
            parent_template_id: row.try_get("parent_template_id")?,
            slots,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn insert_application(&self, application: &TemplateApplication) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO template_application ({APPLICATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#
        );
        sqlx::query(&sql)
            .bind(application.application_id)
            .bind(application.template_id)
            .bind(application.template_version)
            .bind(application.clinic_id)
            .bind(application.application_type)
            .bind(Json(&application.scope))
            .bind(Json(&application.filters))
            .bind(application.status)
            .bind(application.generated_slots)
            .bind(application.skipped_conflict)
            .bind(application.skipped_holiday)
            .bind(application.skipped_invalid)
            .bind(application.generated_through)
            .bind(application.applied_by)
            .bind(application.created_at)
            .bind(application.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_application(&self, application: &TemplateApplication) -> Result<(), StoreError> {
        // scope and filters are fixed at creation
        let result = sqlx::query(
            r#"
            UPDATE template_application
            SET status = $2,
                generated_slots = $3,
                skipped_conflict = $4,
                skipped_holiday = $5,
                skipped_invalid = $6,
                generated_through = $7,
                updated_at = $8
            WHERE application_id = $1
            "#,
        )
        .bind(application.application_id)
        .bind(application.status)
        .bind(application.generated_slots)
        .bind(application.skipped_conflict)
        .bind(application.skipped_holiday)
        .bind(application.skipped_invalid)
        .bind(application.generated_through)
        .bind(application.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "template_application",
                id: application.application_id,
            });
        }
        Ok(())
    }

    async fn application(&self, application_id: Uuid) -> Result<Option<TemplateApplication>, StoreError> {
        let sql = format!("SELECT {APPLICATION_COLUMNS} FROM template_application WHERE application_id = $1");
        let row = sqlx::query(&sql)
            .bind(application_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(application_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_flow(
        &self,
        flow: &PatientFlowState,
        history: &FlowStageHistory,
    ) -> Result<PatientFlowState, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"
            INSERT INTO patient_flow ({FLOW_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (appointment_id) DO NOTHING
            "#
        );
        let result = sqlx::query(&sql)
            .bind(flow.flow_id)
            .bind(flow.appointment_id)
            .bind(flow.clinic_id)
            .bind(flow.patient_id)
            .bind(flow.provider_id)
            .bind(flow.chair_id)
            .bind(flow.service_date)
            .bind(flow.stage)
            .bind(flow.priority)
            .bind(flow.scheduled_at)
            .bind(flow.checked_in_at)
            .bind(flow.called_at)
            .bind(flow.seated_at)
            .bind(flow.completed_at)
            .bind(flow.checked_out_at)
            .bind(flow.departed_at)
            .bind(flow.current_wait_started_at)
            .bind(flow.version)
            .bind(flow.updated_at)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return self
                .flow_for_appointment(flow.appointment_id)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "flow",
                    id: flow.flow_id,
                });
        }

        insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(flow.clone())
    }

    async fn flow_for_appointment(&self, appointment_id: Uuid) -> Result<Option<PatientFlowState>, StoreError> {
        let sql = format!("SELECT {FLOW_COLUMNS} FROM patient_flow WHERE appointment_id = $1");
        let row = sqlx::query_as::<_, PatientFlowState>(&sql)
            .bind(appointment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn flows_on(&self, clinic_id: Uuid, service_date: NaiveDate) -> Result<Vec<PatientFlowState>, StoreError> {
        let sql = format!(
            r#"
            SELECT {FLOW_COLUMNS}
            FROM patient_flow
            WHERE clinic_id = $1 AND service_date = $2
            ORDER BY scheduled_at, flow_id
            "#
        );
        let rows = sqlx::query_as::<_, PatientFlowState>(&sql)
            .bind(clinic_id)
            .bind(service_date)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn seated_flows(&self, clinic_id: Uuid) -> Result<Vec<PatientFlowState>, StoreError> {
        let sql = format!("SELECT {FLOW_COLUMNS} FROM patient_flow WHERE clinic_id = $1 AND stage = $2");
        let rows = sqlx::query_as::<_, PatientFlowState>(&sql)
            .bind(clinic_id)
            .bind(FlowStage::InChair)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn save_flow(&self, flow: &PatientFlowState, expected_version: i32) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_flow_row(&mut conn, flow, expected_version).await
    }

    async fn commit_flow_transition(&self, commit: &FlowCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        update_flow_row(&mut tx, &commit.flow, commit.expected_version).await?;
        insert_history(&mut tx, &commit.history).await?;

        if let Some(status) = commit.appointment_status {
            let result = sqlx::query(
                r#"
                UPDATE appointment
                SET status = $2, updated_at = $3
                WHERE appointment_id = $1 AND deleted_at IS NULL AND status <> $4
                "#,
            )
            .bind(commit.flow.appointment_id)
            .bind(status)
            .bind(commit.flow.updated_at)
            .bind(AppointmentStatus::Cancelled)
            .execute(&mut *tx)
            .await?;
            // cancelled or deleted since the flow was read
            if result.rows_affected() == 0 {
                return Err(StoreError::StaleVersion);
            }
        }

        for record in &commit.occupancy {
            upsert_occupancy(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn flow_history(&self, flow_id: Uuid) -> Result<Vec<FlowStageHistory>, StoreError> {
        let rows = sqlx::query_as::<_, FlowStageHistory>(
            r#"
            SELECT history_id, flow_id, appointment_id, stage, entered_at, triggered_by
            FROM flow_stage_history
            WHERE flow_id = $1
            ORDER BY entered_at, history_id
            "#,
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn occupancy(&self, resource_id: Uuid) -> Result<Option<ResourceOccupancy>, StoreError> {
        let sql = format!("SELECT {OCCUPANCY_COLUMNS} FROM resource_occupancy WHERE resource_id = $1");
        let row = sqlx::query_as::<_, ResourceOccupancy>(&sql)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn occupancy_for_clinic(&self, clinic_id: Uuid) -> Result<Vec<ResourceOccupancy>, StoreError> {
        let sql = format!("SELECT {OCCUPANCY_COLUMNS} FROM resource_occupancy WHERE clinic_id = $1");
        let rows = sqlx::query_as::<_, ResourceOccupancy>(&sql)
            .bind(clinic_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn put_occupancy(&self, occupancy: &ResourceOccupancy) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_occupancy(&mut conn, occupancy).await
    }
}

/* ============================================================
   Collaborators
   ============================================================ */

#[async_trait]
impl ResourceDirectory for PgStore {
    async fn is_active_provider(&self, provider_id: Uuid) -> Result<bool, StoreError> {
        let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM provider WHERE provider_id = $1")
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(active.unwrap_or(false))
    }

    async fn is_active_chair(&self, chair_id: Uuid) -> Result<bool, StoreError> {
        let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM chair WHERE chair_id = $1")
            .bind(chair_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(active.unwrap_or(false))
    }

    async fn is_active_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM room WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(active.unwrap_or(false))
    }

    async fn chairs(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar("SELECT chair_id FROM chair WHERE clinic_id = $1 AND is_active ORDER BY chair_id")
            .bind(clinic_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn rooms(&self, clinic_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar("SELECT room_id FROM room WHERE clinic_id = $1 AND is_active ORDER BY room_id")
            .bind(clinic_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn locate(&self, resource_id: Uuid) -> Result<Option<ResourceInfo>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT chair_id AS resource_id, clinic_id, $2 AS dimension, is_active FROM chair WHERE chair_id = $1
            UNION ALL
            SELECT room_id, clinic_id, $3, is_active FROM room WHERE room_id = $1
            "#,
        )
        .bind(resource_id)
        .bind(ResourceDimension::Chair)
        .bind(ResourceDimension::Room)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ResourceInfo {
            resource_id: row.try_get("resource_id")?,
            clinic_id: row.try_get("clinic_id")?,
            dimension: row.try_get::<ResourceDimension, _>("dimension")?,
            is_active: row.try_get("is_active")?,
        }))
    }
}

#[async_trait]
impl HolidayCalendar for PgStore {
    async fn is_closed(&self, clinic_id: Uuid, date: NaiveDate) -> Result<bool, StoreError> {
        let closed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM clinic_closure WHERE clinic_id = $1 AND closed_on = $2)",
        )
        .bind(clinic_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(closed)
    }
}

#[async_trait]
impl AppointmentTypeCatalog for PgStore {
    async fn appointment_type(&self, appointment_type_id: Uuid) -> Result<Option<AppointmentType>, StoreError> {
        let row = sqlx::query_as::<_, AppointmentType>(
            r#"
            SELECT appointment_type_id, clinic_id, display_name, min_duration_min, max_duration_min,
                   default_duration_min, cleanup_buffer_min, is_active
            FROM appointment_type
            WHERE appointment_type_id = $1
            "#,
        )
        .bind(appointment_type_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
