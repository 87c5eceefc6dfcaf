//! Cloud account credentials

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use watchtower_core::{CloudVendor, Error, Result, TenantId};

use crate::executor::driver_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Success,
    Pending,
    Error,
}

/// A tenant's connection to one cloud account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub tenant: TenantId,
    pub vendor: CloudVendor,
    pub status: CredentialStatus,

    /// Vendor-specific configuration; `null` when never configured
    #[serde(default)]
    pub auth_payload: Value,

    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Connected and carrying a configuration
    pub fn is_usable(&self) -> bool {
        self.status == CredentialStatus::Success
            && match &self.auth_payload {
                Value::Null => false,
                Value::Object(fields) => !fields.is_empty(),
                _ => true,
            }
    }

    /// Gateway connection name of this credential
    pub fn profile_name(&self) -> String {
        format!("profile_{}", self.id.simple())
    }

    /// Text field of the payload
    pub fn field(&self, name: &str) -> Option<&str> {
        self.auth_payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Text field that has to be present for a profile to be built
    pub fn required(&self, name: &str) -> Result<&str> {
        self.field(name)
            .ok_or_else(|| Error::CredentialConfigurationMissing {
                credential: self.id.to_string(),
                reason: format!("missing {name}"),
            })
    }

    /// Assume-role credentials past their `token_expiration_time`
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.vendor != CloudVendor::Aws {
            return false;
        }
        self.field("token_expiration_time")
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            .is_some_and(|expires| now > expires.with_timezone(&Utc))
    }
}

/// Source of tenant credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn list_credentials(
        &self,
        tenant: TenantId,
        vendor: CloudVendor,
    ) -> Result<Vec<Credential>>;

    /// Every credential of every tenant
    async fn list_all(&self) -> Result<Vec<Credential>>;

    /// Exchange expired temporary credentials for fresh ones
    async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        Ok(credential.clone())
    }
}

/// Credentials kept in the `watchtower_cloud_credential` table
#[derive(Debug, Clone)]
pub struct PgCredentialProvider {
    pool: PgPool,
}

impl PgCredentialProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn credential_from_row(row: &PgRow) -> Result<Credential> {
    let vendor: String = row.try_get("vendor").map_err(driver_error)?;
    let status: String = row.try_get("status").map_err(driver_error)?;
    let payload: sqlx::types::Json<Value> = row.try_get("auth_payload").map_err(driver_error)?;
    Ok(Credential {
        id: row.try_get("id").map_err(driver_error)?,
        tenant: row.try_get("tenant_id").map_err(driver_error)?,
        vendor: vendor.parse()?,
        status: serde_json::from_value(Value::String(status))?,
        auth_payload: payload.0,
        updated_at: row.try_get("updated_at").map_err(driver_error)?,
    })
}

#[async_trait]
impl CredentialProvider for PgCredentialProvider {
    async fn list_credentials(
        &self,
        tenant: TenantId,
        vendor: CloudVendor,
    ) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            "SELECT * FROM watchtower_cloud_credential WHERE tenant_id = $1 ORDER BY updated_at",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(driver_error)?;

        // `azuread` rows normalise to azure when parsed
        let mut credentials = Vec::with_capacity(rows.len());
        for row in &rows {
            let credential = credential_from_row(row)?;
            if credential.vendor == vendor {
                credentials.push(credential);
            }
        }
        Ok(credentials)
    }

    async fn list_all(&self) -> Result<Vec<Credential>> {
        sqlx::query("SELECT * FROM watchtower_cloud_credential")
            .fetch_all(&self.pool)
            .await
            .map_err(driver_error)?
            .iter()
            .map(credential_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn credential(vendor: CloudVendor, payload: Value) -> Credential {
        Credential {
            id: Uuid::new_v4(),
            tenant: Uuid::new_v4(),
            vendor,
            status: CredentialStatus::Success,
            auth_payload: payload,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_usable_requires_success_and_payload() {
        assert!(credential(CloudVendor::Aws, json!({"access_key_id": "x"})).is_usable());
        assert!(!credential(CloudVendor::Aws, Value::Null).is_usable());
        assert!(!credential(CloudVendor::Aws, json!({})).is_usable());

        let mut pending = credential(CloudVendor::Aws, json!({"access_key_id": "x"}));
        pending.status = CredentialStatus::Pending;
        assert!(!pending.is_usable());
    }

    #[test]
    fn test_profile_name_uses_simple_uuid() {
        let cred = credential(CloudVendor::Gcp, json!({}));
        let name = cred.profile_name();
        assert!(name.starts_with("profile_"));
        assert!(!name.contains('-'));
    }

    #[test]
    fn test_aws_refresh_after_expiry() {
        let expired = (Utc::now() - Duration::minutes(5)).to_rfc3339();
        let cred = credential(CloudVendor::Aws, json!({"token_expiration_time": expired}));
        assert!(cred.needs_refresh(Utc::now()));

        let valid = (Utc::now() + Duration::minutes(30)).to_rfc3339();
        let cred = credential(CloudVendor::Aws, json!({"token_expiration_time": valid}));
        assert!(!cred.needs_refresh(Utc::now()));

        let okta = credential(CloudVendor::Okta, json!({"token_expiration_time": expired}));
        assert!(!okta.needs_refresh(Utc::now()));
    }

    #[test]
    fn test_required_field_reports_credential() {
        let cred = credential(CloudVendor::Heroku, json!({"email": "  "}));
        let err = cred.required("email").unwrap_err();
        assert!(matches!(err, Error::CredentialConfigurationMissing { .. }));
    }
}
