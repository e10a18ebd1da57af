//! PostgreSQL persistence gateway.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::store::{
    AssignmentRecord, DeliveryStatus, InstanceRecord, MessageRecord, PersistenceGateway,
};

refinery::embed_migrations!("migrations");

/// Pooled PostgreSQL store.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and verify the database is reachable.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let report = migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn parse_column<T>(row: &Row, column: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse().map_err(DatabaseError::Serialization)
}

fn instance_from_row(row: &Row) -> Result<InstanceRecord, DatabaseError> {
    Ok(InstanceRecord {
        agent_id: row.get("agent_id"),
        display_name: row.get("display_name"),
        status: parse_column(row, "status")?,
        qr_payload: row.get("qr_payload"),
        phone_number: row.get("phone_number"),
        last_connected_at: row.get("last_connected_at"),
        updated_at: row.get("updated_at"),
    })
}

fn assignment_from_row(row: &Row) -> AssignmentRecord {
    AssignmentRecord {
        contact_id: row.get("contact_id"),
        agent_id: row.get("agent_id"),
        is_group: row.get("is_group"),
        group_name: row.get("group_name"),
        last_message_at: row.get("last_message_at"),
    }
}

#[async_trait]
impl PersistenceGateway for PgStore {
    async fn get_instance(&self, agent_id: &str) -> Result<Option<InstanceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT agent_id, display_name, status, qr_payload, phone_number, \
                 last_connected_at, updated_at FROM instances WHERE agent_id = $1",
                &[&agent_id],
            )
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT agent_id, display_name, status, qr_payload, phone_number, \
                 last_connected_at, updated_at FROM instances ORDER BY agent_id",
                &[],
            )
            .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO instances (agent_id, display_name, status, qr_payload, phone_number, \
             last_connected_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (agent_id) DO UPDATE SET display_name = EXCLUDED.display_name, \
             status = EXCLUDED.status, qr_payload = EXCLUDED.qr_payload, \
             phone_number = EXCLUDED.phone_number, \
             last_connected_at = EXCLUDED.last_connected_at, updated_at = EXCLUDED.updated_at",
            &[
                &record.agent_id,
                &record.display_name,
                &record.status.as_str(),
                &record.qr_payload,
                &record.phone_number,
                &record.last_connected_at,
                &record.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_assignment(
        &self,
        contact_id: &str,
    ) -> Result<Option<AssignmentRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT contact_id, agent_id, is_group, group_name, last_message_at \
                 FROM assignments WHERE contact_id = $1",
                &[&contact_id],
            )
            .await?;
        Ok(row.as_ref().map(assignment_from_row))
    }

    async fn insert_assignment(&self, record: &AssignmentRecord) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "INSERT INTO assignments (contact_id, agent_id, is_group, group_name, last_message_at) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (contact_id) DO NOTHING",
                &[
                    &record.contact_id,
                    &record.agent_id,
                    &record.is_group,
                    &record.group_name,
                    &record.last_message_at,
                ],
            )
            .await?;
        Ok(n > 0)
    }

    async fn touch_assignment(
        &self,
        contact_id: &str,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE assignments SET last_message_at = $3 WHERE contact_id = $1 AND agent_id = $2",
                &[&contact_id, &agent_id, &at],
            )
            .await?;
        Ok(n > 0)
    }

    async fn reassign_assignment(
        &self,
        contact_id: &str,
        agent_id: &str,
        is_group: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn().await?;
        // Both CTEs read the same snapshot, so `previous` sees the owner
        // before the upsert lands.
        let row = conn
            .query_one(
                "WITH previous AS ( \
                     SELECT agent_id FROM assignments WHERE contact_id = $1 FOR UPDATE \
                 ), upserted AS ( \
                     INSERT INTO assignments (contact_id, agent_id, is_group, last_message_at) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (contact_id) DO UPDATE \
                     SET agent_id = EXCLUDED.agent_id, last_message_at = EXCLUDED.last_message_at \
                     RETURNING contact_id \
                 ) \
                 SELECT (SELECT agent_id FROM previous) AS previous_agent_id FROM upserted",
                &[&contact_id, &agent_id, &is_group, &at],
            )
            .await?;
        Ok(row.get("previous_agent_id"))
    }

    async fn list_assignments_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<AssignmentRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT contact_id, agent_id, is_group, group_name, last_message_at \
                 FROM assignments WHERE agent_id = $1 ORDER BY last_message_at DESC",
                &[&agent_id],
            )
            .await?;
        Ok(rows.iter().map(assignment_from_row).collect())
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let status = record.status.map(|s| s.as_str());
        conn.execute(
            "INSERT INTO messages (id, agent_id, contact_id, role, text, display_name, is_group, \
             status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id, agent_id) DO NOTHING",
            &[
                &record.id,
                &record.agent_id,
                &record.contact_id,
                &record.role.as_str(),
                &record.text,
                &record.display_name,
                &record.is_group,
                &status,
                &record.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn update_message_status(
        &self,
        agent_id: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE messages SET status = $3 \
                 WHERE id = $1 AND agent_id = $2 AND status IS NOT NULL",
                &[&message_id, &agent_id, &status.as_str()],
            )
            .await?;
        Ok(n > 0)
    }
}
