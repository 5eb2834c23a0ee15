//! Organization and scoped-config reads, plus the OAuth token rows the
//! refresh job maintains.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bfr_schemas::OrganizationRef;

/// Fetch one organization; `Ok(None)` for unknown ids.
pub async fn fetch_organization(pool: &PgPool, org_id: Uuid) -> Result<Option<OrganizationRef>> {
    let row = sqlx::query("select id, name, is_active from organizations where id = $1")
        .bind(org_id)
        .fetch_optional(pool)
        .await
        .context("fetch_organization failed")?;

    row.map(|r| {
        Ok(OrganizationRef {
            id: r.try_get("id")?,
            name: r.try_get("name")?,
            is_active: r.try_get("is_active")?,
        })
    })
    .transpose()
}

/// Raw config JSON for one scope (`GLOBAL` or an org id string); missing
/// rows are an empty object.
pub async fn fetch_scope_config(pool: &PgPool, scope: &str) -> Result<Value> {
    let row = sqlx::query("select data from app_config where scope = $1")
        .bind(scope)
        .fetch_optional(pool)
        .await
        .context("fetch_scope_config failed")?;
    Ok(row
        .and_then(|r| r.try_get::<Value, _>("data").ok())
        .unwrap_or_else(|| Value::Object(Default::default())))
}

#[derive(Debug, Clone)]
pub struct IntegrationMappingRow {
    pub integration: String,
    pub entity_id: String,
    pub config: Value,
    pub oauth_token_id: Option<Uuid>,
}

/// Integration bindings for a scope. The fabric reads these only to seed
/// the execution context; mutation belongs to the API.
pub async fn list_integration_mappings(
    pool: &PgPool,
    org_id: Option<Uuid>,
) -> Result<Vec<IntegrationMappingRow>> {
    let rows = sqlx::query(
        r#"
        select integration, entity_id, config, oauth_token_id
        from integration_mappings
        where organization_id is not distinct from $1
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("list_integration_mappings failed")?;

    rows.iter()
        .map(|r| {
            Ok(IntegrationMappingRow {
                integration: r.try_get("integration")?,
                entity_id: r.try_get("entity_id")?,
                config: r.try_get("config")?,
                oauth_token_id: r.try_get("oauth_token_id")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// OAuth tokens (refresh job)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OAuthTokenRow {
    pub id: Uuid,
    pub refresh_token: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub expires_at: Option<NaiveDateTime>,
}

/// Tokens expiring within the given window that carry a refresh token.
pub async fn list_expiring_tokens(
    pool: &PgPool,
    within_seconds: i64,
) -> Result<Vec<OAuthTokenRow>> {
    let rows = sqlx::query(
        r#"
        select id, refresh_token, token_url, client_id, client_secret, expires_at
        from oauth_tokens
        where refresh_token is not null
          and expires_at is not null
          and expires_at < (now() at time zone 'utc') + make_interval(secs => $1)
        "#,
    )
    .bind(within_seconds as f64)
    .fetch_all(pool)
    .await
    .context("list_expiring_tokens failed")?;

    rows.iter()
        .map(|r| {
            Ok(OAuthTokenRow {
                id: r.try_get("id")?,
                refresh_token: r.try_get("refresh_token")?,
                token_url: r.try_get("token_url")?,
                client_id: r.try_get("client_id")?,
                client_secret: r.try_get("client_secret")?,
                expires_at: r.try_get("expires_at")?,
            })
        })
        .collect()
}

/// Store a refreshed access token (and rotated refresh token, when the
/// provider returns one).
pub async fn store_refreshed_token(
    pool: &PgPool,
    token_id: Uuid,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<NaiveDateTime>,
) -> Result<()> {
    sqlx::query(
        r#"
        update oauth_tokens
        set access_token = $2,
            refresh_token = coalesce($3, refresh_token),
            expires_at = coalesce($4, expires_at)
        where id = $1
        "#,
    )
    .bind(token_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("store_refreshed_token failed")?;
    Ok(())
}
