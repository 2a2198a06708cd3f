use async_trait::async_trait;
use orgrec_core::{ClosureEntry, DiffField, Employee, EmployeeId, FieldUpdate, SupervisorEdge};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::{ClosureBuilder, ClosureSwap, RosterStore, StoreError};

/// Postgres-backed roster using the `employees`, `supervisor_edges` and
/// `hierarchy_closure` tables from `migrations/`.
#[derive(Debug, Clone)]
pub struct PgRosterStore {
    pool: PgPool,
}

impl PgRosterStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(format!("connecting to postgres: {err}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("roster schema migrations applied");
        Ok(())
    }
}

fn employee_from_row(row: &PgRow) -> Result<Employee, sqlx::Error> {
    Ok(Employee {
        id: EmployeeId(row.try_get("id")?),
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        department: row.try_get("department")?,
        job_title: row.try_get("job_title")?,
        contact: row.try_get("contact")?,
        active: row.try_get("active")?,
    })
}

fn closure_from_row(row: &PgRow) -> Result<ClosureEntry, StoreError> {
    let level: i32 = row.try_get("level")?;
    let level = u32::try_from(level)
        .ok()
        .filter(|level| *level >= 1)
        .ok_or_else(|| StoreError::Corrupt(format!("closure level {level}")))?;
    Ok(ClosureEntry {
        report_id: EmployeeId(row.try_get("report_id")?),
        level,
        supervisor_id: EmployeeId(row.try_get("supervisor_id")?),
    })
}

async fn fetch_edges<'e, E>(executor: E) -> Result<Vec<SupervisorEdge>, StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT employee_id, supervisor_id FROM supervisor_edges ORDER BY employee_id",
    )
    .fetch_all(executor)
    .await?;
    rows.iter()
        .map(|row| -> Result<SupervisorEdge, StoreError> {
            Ok(SupervisorEdge {
                employee_id: EmployeeId(row.try_get("employee_id")?),
                supervisor_id: EmployeeId(row.try_get("supervisor_id")?),
            })
        })
        .collect()
}

/// Serializes every hierarchy writer; plain reads still proceed.
async fn lock_hierarchy(tx: &mut Transaction<'_, Postgres>) -> Result<(), StoreError> {
    sqlx::query("LOCK TABLE supervisor_edges, hierarchy_closure IN EXCLUSIVE MODE")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Replaces the closure with one built from the edges visible in `tx`. An
/// integrity error returns before any write; dropping `tx` rolls back.
async fn swap_closure(
    tx: &mut Transaction<'_, Postgres>,
    build: ClosureBuilder<'_>,
) -> Result<ClosureSwap, StoreError> {
    let edges = fetch_edges(&mut **tx).await?;
    let entries = build(&edges)?;

    let deleted = sqlx::query("DELETE FROM hierarchy_closure")
        .execute(&mut **tx)
        .await?
        .rows_affected();

    let mut report_ids = Vec::with_capacity(entries.len());
    let mut supervisor_ids = Vec::with_capacity(entries.len());
    let mut levels = Vec::with_capacity(entries.len());
    for entry in &entries {
        let level = i32::try_from(entry.level)
            .map_err(|_| StoreError::Corrupt(format!("closure level {}", entry.level)))?;
        report_ids.push(entry.report_id.0);
        supervisor_ids.push(entry.supervisor_id.0);
        levels.push(level);
    }
    sqlx::query(
        "INSERT INTO hierarchy_closure (report_id, supervisor_id, level) \
         SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::INTEGER[])",
    )
    .bind(report_ids)
    .bind(supervisor_ids)
    .bind(levels)
    .execute(&mut **tx)
    .await?;

    Ok(ClosureSwap {
        edges: edges.len(),
        previous_entries: deleted as usize,
        entries: entries.len(),
    })
}

#[async_trait]
impl RosterStore for PgRosterStore {
    async fn load_roster(&self) -> Result<Vec<Employee>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, first_name, last_name, department, job_title, contact, active \
             FROM employees ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Unavailable(format!("loading roster: {err}")))?;
        Ok(rows
            .iter()
            .map(employee_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn load_edges(&self) -> Result<Vec<SupervisorEdge>, StoreError> {
        fetch_edges(&self.pool).await
    }

    async fn load_closure(&self) -> Result<Vec<ClosureEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT report_id, supervisor_id, level FROM hierarchy_closure \
             ORDER BY report_id, level",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(closure_from_row).collect()
    }

    async fn ancestors_of(&self, report_id: EmployeeId) -> Result<Vec<ClosureEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT report_id, supervisor_id, level FROM hierarchy_closure \
             WHERE report_id = $1 ORDER BY level",
        )
        .bind(report_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(closure_from_row).collect()
    }

    async fn rebuild_closure(&self, build: ClosureBuilder<'_>) -> Result<ClosureSwap, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_hierarchy(&mut tx).await?;
        let swap = swap_closure(&mut tx, build).await?;
        tx.commit().await?;
        debug!(?swap, "closure swapped");
        Ok(swap)
    }

    async fn set_supervisor(
        &self,
        employee_id: EmployeeId,
        supervisor_id: Option<EmployeeId>,
        build: ClosureBuilder<'_>,
    ) -> Result<ClosureSwap, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_hierarchy(&mut tx).await?;
        for id in std::iter::once(employee_id).chain(supervisor_id) {
            let known: Option<i64> = sqlx::query_scalar("SELECT id FROM employees WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
            if known.is_none() {
                return Err(StoreError::UnknownEmployee(id));
            }
        }
        match supervisor_id {
            Some(supervisor_id) => {
                sqlx::query(
                    "INSERT INTO supervisor_edges (employee_id, supervisor_id) \
                     VALUES ($1, $2) ON CONFLICT (employee_id) \
                     DO UPDATE SET supervisor_id = EXCLUDED.supervisor_id",
                )
                .bind(employee_id.0)
                .bind(supervisor_id.0)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM supervisor_edges WHERE employee_id = $1")
                    .bind(employee_id.0)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        // The edge write is only committed together with a closure built from it.
        let swap = swap_closure(&mut tx, build).await?;
        tx.commit().await?;
        debug!(%employee_id, ?supervisor_id, ?swap, "supervisor set");
        Ok(swap)
    }

    async fn apply_field_updates(&self, updates: &[FieldUpdate]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0usize;
        for update in updates {
            let column = match update.field {
                DiffField::Department => "department",
                DiffField::JobTitle => "job_title",
            };
            let known: Option<String> =
                sqlx::query_scalar(&format!("SELECT {column} FROM employees WHERE id = $1"))
                    .bind(update.employee_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            match known {
                None => return Err(StoreError::UnknownEmployee(update.employee_id)),
                Some(current) if current == update.value => {}
                Some(_) => {
                    sqlx::query(&format!("UPDATE employees SET {column} = $1 WHERE id = $2"))
                        .bind(&update.value)
                        .bind(update.employee_id.0)
                        .execute(&mut *tx)
                        .await?;
                    changed += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(changed)
    }
}
