//! Content-type labels to dependency tags
//!
//! The host application reports changed resources by content type
//! (`policy_policy`, `user_user`, ...). Monitors are refreshed when one of
//! their FROM-list tables maps to a collected tag.

use crate::vendor::dependency_tag;
use std::collections::BTreeSet;
use watchtower_core::CloudVendor;

/// Tags for one content-type label
pub fn tags_for_content_type(content_type: &str) -> Vec<String> {
    let fixed: &[&str] = match content_type.to_ascii_lowercase().as_str() {
        "policy_policy" | "policy_policyversion" => &["policies_dependency"],
        "user_user" | "user_role" => &["people_dependency"],
        "monitor_monitor" | "monitor_tenantmonitor" => &["monitors_dependency"],
        "evidence_evidence" => &["documents_dependency"],
        "control_control" => &["controls_dependency"],
        "evidence_evidencerequest" => &["evidence_requests_dependency"],
        "vendor_vendor" => &["vendors_dependency"],
        "audit_audit" => &["audits_dependency"],
        "organization_team" | "organization_teammember" => &["teams_dependency"],
        "organization_officer" => &["officers_dependency"],
        "training_training" | "training_alumni" => &["training_dependency"],
        "action_item_actionitem" => &["action_items_dependency"],
        "program_task" | "program_subtask" => &["tasks_dependency"],
        "objects_object" | "objects_objecttype" => &["lo_dependency"],
        "integration_connectionaccount" => {
            return CloudVendor::ALL.iter().map(|v| dependency_tag(*v)).collect();
        }
        _ => &[],
    };
    fixed.iter().map(|tag| tag.to_string()).collect()
}

/// Union of tags for a burst of change signals
pub fn collect_tags<'a>(content_types: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    content_types
        .into_iter()
        .flat_map(tags_for_content_type)
        .collect()
}
