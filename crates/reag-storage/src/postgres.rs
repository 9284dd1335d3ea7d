use std::collections::BTreeMap;

use async_trait::async_trait;
use reag_core::{CanonicalPropertyRecord, Fingerprint};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::fingerprint::{fingerprint_digest, FingerprintStore, StoreError};

/// Postgres-backed store. The `properties` primary key is the fingerprint digest, so
/// concurrent runs racing on the same listing cannot both persist it.
#[derive(Debug, Clone)]
pub struct PgFingerprintStore {
    pool: PgPool,
}

impl PgFingerprintStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("properties schema up to date");
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for PgFingerprintStore {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let found: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM properties WHERE fingerprint = $1)")
            .bind(fingerprint_digest(fingerprint))
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn insert(&self, record: CanonicalPropertyRecord) -> Result<CanonicalPropertyRecord, StoreError> {
        record.validate()?;
        let fingerprint = record.fingerprint();
        let result = sqlx::query(
            r#"
            INSERT INTO properties
                (fingerprint, id, source_name, source_url, city, price, ai_processed, scraped_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint_digest(&fingerprint))
        .bind(record.id)
        .bind(&record.source.name)
        .bind(&record.source.url)
        .bind(&record.location.city)
        .bind(record.price)
        .bind(record.ai_processed)
        .bind(record.source.scraped_at)
        .bind(Json(&record))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(fingerprint));
        }
        Ok(record)
    }

    async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query("SELECT source_name, COUNT(*) AS n FROM properties GROUP BY source_name")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("source_name")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(name, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM properties").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
