use async_trait::async_trait;
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::{CommandKind, RemoteCommand, RemoteControl};
use crate::execution::StatusSnapshot;
use crate::Result;

/// The dashboard reads a single state row
const BOT_ID: i32 = 1;

/// Remote channel over the dashboard's Postgres database
pub struct PostgresControl {
    pool: PgPool,
    /// Strategy configuration echoed to the dashboard with every state push
    config: serde_json::Value,
}

impl PostgresControl {
    /// Connect and run the embedded migrations
    pub async fn connect(database_url: &str, config: serde_json::Value) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(3)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("☁️ Remote control channel connected");

        Ok(Self { pool, config })
    }
}

#[async_trait]
impl RemoteControl for PostgresControl {
    async fn poll_commands(&self) -> Result<Vec<RemoteCommand>> {
        // Claim and consume in one statement so a command is handed out once
        let rows = sqlx::query(
            r#"
            UPDATE commands
            SET status = 'EXECUTED', executed_at = NOW()
            WHERE id IN (
                SELECT id FROM commands
                WHERE status = 'PENDING'
                ORDER BY id
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, command
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let raw: String = row.get("command");
            match raw.parse::<CommandKind>() {
                Ok(kind) => commands.push(RemoteCommand { id, kind }),
                Err(e) => tracing::warn!("☁️ Ignoring command {}: {}", id, e),
            }
        }
        commands.sort_by_key(|c| c.id);
        Ok(commands)
    }

    async fn push_state(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let wrapper = json!({
            "positions": snapshot.positions,
            "config": self.config,
            "balance": snapshot.balance,
            "total_realized_pnl": snapshot.stats.realized_pnl,
            "wins": snapshot.stats.wins,
            "losses": snapshot.stats.losses,
            "break_evens": snapshot.stats.break_evens,
            "gross_profit": snapshot.stats.gross_profit,
            "gross_loss": snapshot.stats.gross_loss,
            "cycle_count": snapshot.cycle_count,
        });

        sqlx::query(
            r#"
            INSERT INTO bot_state (
                id, is_running, last_heartbeat, balance,
                active_positions_count, total_pnl, positions_json, updated_at
            )
            VALUES ($1, $2, NOW(), $3, $4, $5, $6, NOW())
            ON CONFLICT (id) DO UPDATE SET
                is_running = EXCLUDED.is_running,
                last_heartbeat = EXCLUDED.last_heartbeat,
                balance = EXCLUDED.balance,
                active_positions_count = EXCLUDED.active_positions_count,
                total_pnl = EXCLUDED.total_pnl,
                positions_json = EXCLUDED.positions_json,
                updated_at = NOW()
            "#,
        )
        .bind(BOT_ID)
        .bind(snapshot.running)
        .bind(snapshot.balance)
        .bind(snapshot.active_positions as i32)
        .bind(snapshot.total_unrealized_pnl)
        .bind(wrapper)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn push_log(&self, level: &str, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO logs (level, message, timestamp) VALUES ($1, $2, NOW())")
            .bind(level)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
