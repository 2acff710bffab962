use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tradelink_core::{CommandRecord, MagicKey, TokenInfo, UserId};

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Look up an unrevoked session token.
pub async fn find_token(pool: &PgPool, token: &str) -> Result<Option<TokenInfo>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT user_id, expires_at
         FROM user_sessions
         WHERE token = $1 AND revoked_at IS NULL",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| TokenInfo {
        user_id: UserId::new(r.get::<String, _>("user_id")),
        expires_at: r.get::<DateTime<Utc>, _>("expires_at"),
    }))
}

/// Mark a token revoked. Returns whether a live token was found.
pub async fn revoke_token(pool: &PgPool, token: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE user_sessions SET revoked_at = NOW()
         WHERE token = $1 AND revoked_at IS NULL",
    )
    .bind(token)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Magic keys owned by a user.
pub async fn magic_keys_for(pool: &PgPool, user_id: &UserId) -> Result<BTreeSet<MagicKey>, sqlx::Error> {
    let rows = sqlx::query("SELECT magic_key FROM magic_keys WHERE user_id = $1")
        .bind(user_id.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| MagicKey::new(r.get::<String, _>("magic_key")))
        .collect())
}

/// Append one command audit row.
pub async fn insert_command_record(pool: &PgPool, record: &CommandRecord) -> Result<(), sqlx::Error> {
    let command = &record.command;
    sqlx::query(
        "INSERT INTO command_audit (
            id, user_id, connection_id, source_class, magic_key,
            kind, seq, payload, status, reason, received_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(record.id)
    .bind(record.user_id.as_str())
    .bind(i64::try_from(command.source.get()).unwrap_or(i64::MAX))
    .bind(command.source_class.as_str())
    .bind(command.magic_key.as_str())
    .bind(command.kind.as_str())
    .bind(i64::try_from(command.seq).unwrap_or(i64::MAX))
    .bind(&command.payload)
    .bind(record.status.as_str())
    .bind(record.reason.map(|r| r.as_str()))
    .bind(command.received_at)
    .execute(pool)
    .await?;
    Ok(())
}
