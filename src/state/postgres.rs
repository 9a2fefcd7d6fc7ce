//! PostgreSQL state store

use super::{StateStore, TransferStats};
use crate::bridge::{BridgeStatus, BridgeTransfer};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::sponsorship::SponsorshipBudget;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// State store for PostgreSQL persistence
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayerError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        // Tables are created inline rather than through sqlx::migrate!

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transfers (
                bridge_id UUID PRIMARY KEY,
                source_chain VARCHAR(64) NOT NULL,
                target_chain VARCHAR(64) NOT NULL,
                status VARCHAR(20) NOT NULL,
                idempotency_key VARCHAR(64) UNIQUE,
                amount NUMERIC(39, 0) NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_status
            ON bridge_transfers (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transitions (
                bridge_id UUID NOT NULL REFERENCES bridge_transfers (bridge_id),
                seq INTEGER NOT NULL,
                from_status VARCHAR(20) NOT NULL,
                to_status VARCHAR(20) NOT NULL,
                detail TEXT,
                at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (bridge_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_attestations (
                bridge_id UUID NOT NULL REFERENCES bridge_transfers (bridge_id),
                validator_id VARCHAR(42) NOT NULL,
                digest VARCHAR(66) NOT NULL,
                signature TEXT NOT NULL,
                signed_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (bridge_id, validator_id, digest)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sponsorship_budgets (
                identity VARCHAR(255) NOT NULL,
                tier VARCHAR(64) NOT NULL,
                day DATE NOT NULL,
                used_today BIGINT NOT NULL,
                daily_limit BIGINT NOT NULL,
                reset_epoch BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (identity, tier, day)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(data: &str) -> RelayerResult<BridgeTransfer> {
        Ok(serde_json::from_str(data)?)
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn save_transfer(&self, transfer: &BridgeTransfer) -> RelayerResult<()> {
        let data = serde_json::to_string(transfer)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO bridge_transfers
                (bridge_id, source_chain, target_chain, status, idempotency_key, amount,
                 data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7::JSONB, $8, $9)
            ON CONFLICT (bridge_id)
            DO UPDATE SET status = $4, idempotency_key = $5, data = $7::JSONB, updated_at = $9
            "#,
        )
        .bind(transfer.bridge_id)
        .bind(transfer.source_chain.as_str())
        .bind(transfer.target_chain.as_str())
        .bind(transfer.status.as_str())
        .bind(transfer.idempotency_key.as_deref())
        .bind(transfer.amount.to_string())
        .bind(&data)
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .execute(&mut *tx)
        .await?;

        for (seq, record) in transfer.history.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO bridge_transitions (bridge_id, seq, from_status, to_status, detail, at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (bridge_id, seq) DO NOTHING
                "#,
            )
            .bind(transfer.bridge_id)
            .bind(seq as i32)
            .bind(record.from.as_str())
            .bind(record.to.as_str())
            .bind(record.detail.as_deref())
            .bind(record.at)
            .execute(&mut *tx)
            .await?;
        }

        for attestation in &transfer.attestations {
            sqlx::query(
                r#"
                INSERT INTO bridge_attestations (bridge_id, validator_id, digest, signature, signed_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (bridge_id, validator_id, digest) DO NOTHING
                "#,
            )
            .bind(attestation.bridge_id)
            .bind(format!("{:?}", attestation.validator_id))
            .bind(format!("{:?}", attestation.digest))
            .bind(attestation.signature.to_string())
            .bind(attestation.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Saved bridge {} in state {}",
            transfer.bridge_id, transfer.status
        );
        Ok(())
    }

    async fn get_transfer(&self, bridge_id: Uuid) -> RelayerResult<Option<BridgeTransfer>> {
        let row = sqlx::query("SELECT data::TEXT AS data FROM bridge_transfers WHERE bridge_id = $1")
            .bind(bridge_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::decode(&r.get::<String, _>("data")))
            .transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> RelayerResult<Option<BridgeTransfer>> {
        let row = sqlx::query(
            "SELECT data::TEXT AS data FROM bridge_transfers WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::decode(&r.get::<String, _>("data")))
            .transpose()
    }

    async fn active_transfers(&self) -> RelayerResult<Vec<BridgeTransfer>> {
        let rows = sqlx::query(
            r#"
            SELECT data::TEXT AS data FROM bridge_transfers
            WHERE status NOT IN ($1, $2)
            ORDER BY created_at
            "#,
        )
        .bind(BridgeStatus::Minted.as_str())
        .bind(BridgeStatus::Refunded.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut active = Vec::with_capacity(rows.len());
        for row in rows {
            let transfer = Self::decode(&row.get::<String, _>("data"))?;
            // FAILED without a lock is terminal too
            if !transfer.is_terminal() {
                active.push(transfer);
            }
        }
        Ok(active)
    }

    async fn save_budget(&self, budget: &SponsorshipBudget) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sponsorship_budgets
                (identity, tier, day, used_today, daily_limit, reset_epoch, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (identity, tier, day)
            DO UPDATE SET used_today = $4, daily_limit = $5, reset_epoch = $6, updated_at = NOW()
            "#,
        )
        .bind(&budget.identity)
        .bind(&budget.tier)
        .bind(budget.day)
        .bind(budget.used_today as i64)
        .bind(budget.daily_limit as i64)
        .bind(budget.reset_epoch)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_budgets(&self, day: NaiveDate) -> RelayerResult<Vec<SponsorshipBudget>> {
        let rows = sqlx::query(
            r#"
            SELECT identity, tier, day, used_today, daily_limit, reset_epoch
            FROM sponsorship_budgets
            WHERE day = $1
            "#,
        )
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SponsorshipBudget {
                identity: row.get("identity"),
                tier: row.get("tier"),
                day: row.get("day"),
                used_today: row.get::<i64, _>("used_today") as u64,
                daily_limit: row.get::<i64, _>("daily_limit") as u64,
                reset_epoch: row.get("reset_epoch"),
            })
            .collect())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<TransferStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n FROM bridge_transfers GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TransferStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            if let Some(status) = BridgeStatus::parse(&status) {
                stats.add(status, n as u64);
            }
        }
        Ok(stats)
    }
}
