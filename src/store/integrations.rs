//! Integration and file persistence.
//!
//! Integrations are deduplicated per `(tenant_id, user_id, service,
//! server_url)` — the unique index makes re-adding the same server for the
//! same user an update, while the same URL under another user stays a
//! separate integration.

use base64::Engine as _;
use uuid::Uuid;

use crate::types::{FileRecord, Integration, ServiceKind};

use super::writer::WriteOp;
use super::{parse_timestamp, parse_uuid, Store, StoreError};

type IntegrationRow = (String, String, String, String, i64, String, String);
type FileRow = (String, String, String, Option<String>, String, String, String, String);

/// Extract the `server_url` hint from integration metadata, if present.
fn server_url_of(integration: &Integration) -> Option<String> {
    integration
        .metadata
        .get("server_url")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

impl Store {
    /// Insert or update an integration (dedupe key: tenant, user, service,
    /// server URL).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_integration(&self, integration: Integration) -> Result<(), StoreError> {
        let server_url = server_url_of(&integration);
        self.execute(WriteOp::UpsertIntegration {
            integration,
            server_url,
        })
        .await?;
        Ok(())
    }

    /// Enable or disable an integration. Pollers observe the change on
    /// their next tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_integration_enabled(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> Result<(), StoreError> {
        self.execute(WriteOp::SetIntegrationEnabled {
            id,
            tenant_id,
            enabled,
        })
        .await?;
        Ok(())
    }

    /// List enabled integrations of a service across a tenant (used by
    /// pollers).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_enabled_integrations(
        &self,
        tenant_id: Uuid,
        service: ServiceKind,
    ) -> Result<Vec<Integration>, StoreError> {
        let rows: Vec<IntegrationRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, service, enabled, credentials, metadata \
             FROM integrations \
             WHERE tenant_id = ?1 AND service = ?2 AND enabled = 1",
        )
        .bind(tenant_id.to_string())
        .bind(service.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(integration_from_row).collect()
    }

    /// List all integrations of a user.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_user_integrations(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Integration>, StoreError> {
        let rows: Vec<IntegrationRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, service, enabled, credentials, metadata \
             FROM integrations WHERE tenant_id = ?1 AND user_id = ?2",
        )
        .bind(tenant_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(integration_from_row).collect()
    }

    /// Insert a file record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_file(&self, file: FileRecord) -> Result<(), StoreError> {
        self.execute(WriteOp::InsertFile(file)).await?;
        Ok(())
    }

    /// List a user's files, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_files(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, session_id, name, mime, storage_ref, created_at \
             FROM files WHERE tenant_id = ?1 AND user_id = ?2 \
             ORDER BY created_at DESC",
        )
        .bind(tenant_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(file_from_row).collect()
    }
}

fn integration_from_row(row: IntegrationRow) -> Result<Integration, StoreError> {
    let (id, tenant_id, user_id, service, enabled, credentials, metadata) = row;
    let encrypted_credentials = base64::engine::general_purpose::STANDARD
        .decode(&credentials)
        .map_err(|e| StoreError::Corrupt(format!("bad credential blob: {e}")))?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| StoreError::Corrupt(format!("bad integration metadata: {e}")))?;
    Ok(Integration {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        user_id: parse_uuid(&user_id)?,
        service: ServiceKind::parse(&service)?,
        enabled: enabled != 0,
        encrypted_credentials,
        metadata,
    })
}

fn file_from_row(row: FileRow) -> Result<FileRecord, StoreError> {
    let (id, tenant_id, user_id, session_id, name, mime, storage_ref, created_at) = row;
    Ok(FileRecord {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        user_id: parse_uuid(&user_id)?,
        session_id: session_id.as_deref().map(parse_uuid).transpose()?,
        name,
        mime,
        storage_ref,
        created_at: parse_timestamp(&created_at)?,
    })
}
