use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One charging session, opened on charge start and closed on charge end or
/// shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub loadpoint: String,
    pub vehicle: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Energy baseline at charge start in Wh, from the best available source.
    pub start_energy_wh: f64,
    pub end_energy_wh: Option<f64>,
    pub charged_wh: f64,
    /// Charge meter counter at start/stop, when a dedicated meter exists.
    pub meter_start_wh: Option<f64>,
    pub meter_stop_wh: Option<f64>,
    pub price: Option<f64>,
    pub co2_g: Option<f64>,
}

impl Session {
    pub fn begin(loadpoint: &str, vehicle: Option<String>, start_energy_wh: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            loadpoint: loadpoint.to_string(),
            vehicle,
            started_at: Utc::now(),
            finished_at: None,
            start_energy_wh,
            end_energy_wh: None,
            charged_wh: 0.0,
            meter_start_wh: None,
            meter_stop_wh: None,
            price: None,
            co2_g: None,
        }
    }
}

/// Opaque persistence sink for sessions. Failures are reported but must not
/// abort the control loop; callers log and continue.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn persist(&self, session: &Session) -> anyhow::Result<()>;
}

/// Keeps sessions in memory. Default store when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<Vec<Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().clone()
    }

    pub fn total_charged_wh(&self) -> f64 {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.finished_at.is_some())
            .map(|s| s.charged_wh)
            .sum()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn persist(&self, session: &Session) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        Ok(())
    }
}

#[cfg(feature = "db")]
pub use sqlite::SqliteStore;

#[cfg(feature = "db")]
mod sqlite {
    use super::{Session, SessionStore};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePool;
    use tracing::info;

    /// SQLite-backed session history.
    pub struct SqliteStore {
        pool: SqlitePool,
    }

    impl SqliteStore {
        pub async fn connect(path: &str) -> Result<Self> {
            let pool = SqlitePool::connect(&format!("sqlite://{path}?mode=rwc"))
                .await
                .context("opening session database")?;
            let store = Self { pool };
            store.migrate().await?;
            Ok(store)
        }

        /// Applies startup migrations. A legacy `transactions` table from
        /// earlier releases is renamed in place.
        async fn migrate(&self) -> Result<()> {
            let legacy: Option<(String,)> = sqlx::query_as(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'transactions'",
            )
            .fetch_optional(&self.pool)
            .await?;

            if legacy.is_some() {
                info!("renaming legacy transactions table to sessions");
                sqlx::query("ALTER TABLE transactions RENAME TO sessions")
                    .execute(&self.pool)
                    .await?;
            }

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    loadpoint TEXT NOT NULL,
                    vehicle TEXT,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    start_energy_wh REAL NOT NULL,
                    end_energy_wh REAL,
                    charged_wh REAL NOT NULL,
                    meter_start_wh REAL,
                    meter_stop_wh REAL,
                    price REAL,
                    co2_g REAL
                )",
            )
            .execute(&self.pool)
            .await?;

            Ok(())
        }
    }

    #[async_trait]
    impl SessionStore for SqliteStore {
        async fn persist(&self, session: &Session) -> Result<()> {
            sqlx::query(
                "INSERT OR REPLACE INTO sessions (
                    id, loadpoint, vehicle, started_at, finished_at,
                    start_energy_wh, end_energy_wh, charged_wh,
                    meter_start_wh, meter_stop_wh, price, co2_g
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(session.id.to_string())
            .bind(&session.loadpoint)
            .bind(&session.vehicle)
            .bind(session.started_at.to_rfc3339())
            .bind(session.finished_at.map(|t| t.to_rfc3339()))
            .bind(session.start_energy_wh)
            .bind(session.end_energy_wh)
            .bind(session.charged_wh)
            .bind(session.meter_start_wh)
            .bind(session.meter_stop_wh)
            .bind(session.price)
            .bind(session.co2_g)
            .execute(&self.pool)
            .await?;

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_upserts_by_id() {
        let store = MemoryStore::new();
        let mut session = Session::begin("garage", Some("ev".into()), 100.0);

        store.persist(&session).await.unwrap();
        session.charged_wh = 2500.0;
        session.finished_at = Some(Utc::now());
        store.persist(&session).await.unwrap();

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].charged_wh, 2500.0);
        assert_eq!(store.total_charged_wh(), 2500.0);
    }
}
