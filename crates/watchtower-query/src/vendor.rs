//! Cloud vendor table naming rules

use watchtower_core::CloudVendor;

/// Vendor serving a table, from the prefix before the first underscore
pub fn vendor_of_table(table: &str) -> Option<CloudVendor> {
    let (prefix, rest) = table.split_once('_')?;
    if rest.is_empty() {
        return None;
    }
    CloudVendor::from_prefix(prefix)
}

/// Directory tables live in a separate gateway schema per credential
pub fn is_directory_table(table: &str) -> bool {
    table.to_ascii_lowercase().starts_with("azuread_")
}

/// Gateway schema holding `table` for the profile named `profile`
pub fn profile_schema(table: &str, profile: &str) -> String {
    if is_directory_table(table) {
        format!("azuread_{profile}")
    } else {
        profile.to_string()
    }
}

/// Dependency tag refreshed when a vendor's credentials or inventory change
pub fn dependency_tag(vendor: CloudVendor) -> String {
    format!("{}_dependency", vendor.as_str())
}
