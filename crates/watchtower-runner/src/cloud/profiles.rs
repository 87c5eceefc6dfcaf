//! Gateway connection profiles
//!
//! Each usable credential becomes one or two `connection` blocks in the
//! gateway's configuration directory. Azure credentials also get a directory
//! connection (`azuread_<profile>`) for `azuread_*` tables.

use super::credentials::Credential;
use serde_json::Value;
use watchtower_core::{CloudVendor, Result};

const DEFAULT_AWS_REGIONS: &[&str] = &["us-east-1"];

/// Value of one attribute inside a connection block
enum Field {
    Text(String),
    List(Vec<String>),
}

fn text(value: &str) -> Field {
    Field::Text(value.to_string())
}

/// Render the configuration file for a credential
pub fn build_profile(credential: &Credential) -> Result<String> {
    let name = credential.profile_name();
    match credential.vendor {
        CloudVendor::Aws => aws_profile(credential, &name),
        CloudVendor::Gcp => gcp_profile(credential, &name),
        CloudVendor::Azure => azure_profile(credential, &name),
        CloudVendor::Heroku => Ok(connection(
            &name,
            "heroku",
            &[
                ("api_key", text(credential.required("api_key")?)),
                ("email", text(credential.required("email")?)),
            ],
        )),
        CloudVendor::Okta => Ok(connection(
            &name,
            "okta",
            &[
                ("domain", Field::Text(okta_domain(credential.required("subdomain")?))),
                ("token", text(credential.required("token")?)),
            ],
        )),
        CloudVendor::DigitalOcean => Ok(connection(
            &name,
            "digitalocean",
            &[("token", text(credential.required("token")?))],
        )),
    }
}

fn aws_profile(credential: &Credential, name: &str) -> Result<String> {
    let mut fields = vec![
        ("regions", regions(credential)),
        ("access_key", text(credential.required("access_key_id")?)),
        ("secret_key", text(credential.required("secret_access_key")?)),
    ];
    if let Some(token) = credential.field("session_token") {
        fields.push(("session_token", text(token)));
    }
    Ok(connection(name, "aws", &fields))
}

fn regions(credential: &Credential) -> Field {
    let listed: Vec<String> = credential
        .auth_payload
        .get("regions")
        .and_then(Value::as_array)
        .map(|regions| {
            regions
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if listed.is_empty() {
        Field::List(DEFAULT_AWS_REGIONS.iter().map(|r| r.to_string()).collect())
    } else {
        Field::List(listed)
    }
}

fn gcp_profile(credential: &Credential, name: &str) -> Result<String> {
    let project = credential.required("project_id")?.to_string();
    let key = match credential.auth_payload.get("credentials") {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(object @ Value::Object(_)) => object.to_string(),
        _ => credential.required("credentials")?.to_string(),
    };
    Ok(connection(
        name,
        "gcp",
        &[("project", Field::Text(project)), ("credentials", Field::Text(key))],
    ))
}

fn azure_profile(credential: &Credential, name: &str) -> Result<String> {
    let tenant_id = credential.required("tenant_id")?;
    let client_id = credential.required("client_id")?;
    let client_secret = credential.required("client_secret")?;
    let subscription_id = credential.required("subscription_id")?;

    let mut profile = connection(
        name,
        "azure",
        &[
            ("tenant_id", text(tenant_id)),
            ("subscription_id", text(subscription_id)),
            ("client_id", text(client_id)),
            ("client_secret", text(client_secret)),
        ],
    );
    profile.push('\n');
    profile.push_str(&connection(
        &format!("azuread_{name}"),
        "azuread",
        &[
            ("tenant_id", text(tenant_id)),
            ("client_id", text(client_id)),
            ("client_secret", text(client_secret)),
        ],
    ));
    Ok(profile)
}

/// Okta expects a full URL
pub fn okta_domain(subdomain: &str) -> String {
    let subdomain = subdomain.trim().trim_end_matches('/');
    if subdomain.starts_with("https://") {
        subdomain.to_string()
    } else if let Some(rest) = subdomain.strip_prefix("http://") {
        format!("https://{rest}")
    } else {
        format!("https://{subdomain}")
    }
}

fn connection(name: &str, plugin: &str, fields: &[(&str, Field)]) -> String {
    let mut block = format!("connection \"{name}\" {{\n  plugin = \"{plugin}\"\n");
    for (key, value) in fields {
        let rendered = match value {
            Field::Text(text) => format!("\"{}\"", escape(text)),
            Field::List(items) => {
                let items: Vec<String> =
                    items.iter().map(|item| format!("\"{}\"", escape(item))).collect();
                format!("[{}]", items.join(", "))
            }
        };
        block.push_str(&format!("  {key} = {rendered}\n"));
    }
    block.push_str("}\n");
    block
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::credentials::CredentialStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;
    use watchtower_core::Error;

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
    fn test_okta_domain_normalised() {
        assert_eq!(okta_domain("acme.okta.com"), "https://acme.okta.com");
        assert_eq!(okta_domain("http://acme.okta.com/"), "https://acme.okta.com");
        assert_eq!(okta_domain("https://acme.okta.com"), "https://acme.okta.com");
    }

    #[test]
    fn test_aws_profile() {
        let cred = credential(
            CloudVendor::Aws,
            json!({
                "access_key_id": "AKIA",
                "secret_access_key": "se\"cret",
                "regions": ["eu-west-1", "us-east-2"]
            }),
        );
        let profile = build_profile(&cred).unwrap();
        assert!(profile.starts_with(&format!("connection \"{}\"", cred.profile_name())));
        assert!(profile.contains("plugin = \"aws\""));
        assert!(profile.contains("regions = [\"eu-west-1\", \"us-east-2\"]"));
        assert!(profile.contains("secret_key = \"se\\\"cret\""));
        assert!(!profile.contains("session_token"));
    }

    #[test]
    fn test_aws_default_region() {
        let cred = credential(
            CloudVendor::Aws,
            json!({"access_key_id": "a", "secret_access_key": "b", "session_token": "t"}),
        );
        let profile = build_profile(&cred).unwrap();
        assert!(profile.contains("regions = [\"us-east-1\"]"));
        assert!(profile.contains("session_token = \"t\""));
    }

    #[test]
    fn test_azure_profile_has_directory_connection() {
        let cred = credential(
            CloudVendor::Azure,
            json!({
                "tenant_id": "t", "client_id": "c", "client_secret": "s", "subscription_id": "sub"
            }),
        );
        let profile = build_profile(&cred).unwrap();
        assert!(profile.contains(&format!("connection \"azuread_{}\"", cred.profile_name())));
        assert!(profile.contains("plugin = \"azuread\""));
    }

    #[test]
    fn test_missing_field_is_configuration_error() {
        let cred = credential(CloudVendor::DigitalOcean, json!({"other": "x"}));
        let err = build_profile(&cred).unwrap_err();
        match err {
            Error::CredentialConfigurationMissing { reason, .. } => {
                assert_eq!(reason, "missing token")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_gcp_key_object_serialised() {
        let cred = credential(
            CloudVendor::Gcp,
            json!({"project_id": "p", "credentials": {"type": "service_account"}}),
        );
        let profile = build_profile(&cred).unwrap();
        assert!(profile.contains("project = \"p\""));
        assert!(profile.contains("service_account"));
    }
}
