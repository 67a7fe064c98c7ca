use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

pub const TOOL_SEARCH_DONORS: &str = "search_donors";
pub const TOOL_CHECK_INVENTORY: &str = "check_inventory";
pub const TOOL_REGISTER_DONOR: &str = "register_donor";

/// A structured request from the voice session to run one named operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Reply to a [`ToolCall`], keyed by the originating call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub response: ToolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub result: Value,
}

impl ToolResponse {
    pub fn ok(call: &ToolCall, result: Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: ToolOutcome { result },
        }
    }

    /// Error descriptor result; the session sees `{"result": {"error": ...}}`.
    pub fn failed(call: &ToolCall, error: &ApiError) -> Self {
        Self::ok(
            call,
            serde_json::json!({ "error": error.message, "code": error.code }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.response.result.get("error").is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDonorsArgs {
    #[serde(default)]
    pub blood_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDonorArgs {
    pub name: String,
    pub blood_type: String,
    pub contact: String,
    pub location: String,
}
