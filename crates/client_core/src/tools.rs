//! The operations the voice assistant may call, and their execution.

use async_trait::async_trait;
use realtime_store::Record;
use serde_json::{json, Map, Value};
use shared::{
    domain::{BloodType, InventoryItem, NewDonor},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        RegisterDonorArgs, SearchDonorsArgs, ToolCall, ToolResponse, TOOL_CHECK_INVENTORY,
        TOOL_REGISTER_DONOR, TOOL_SEARCH_DONORS,
    },
};
use thiserror::Error;
use tracing::{debug, warn};
use voice_integration::{ParameterSchema, ToolDeclaration};

use crate::inventory;

/// What the tools read and write.
#[async_trait]
pub trait DonorDirectory: Send + Sync {
    async fn search_donors(
        &self,
        blood_type: Option<BloodType>,
        location: Option<String>,
    ) -> Result<Vec<Record>, ApiException>;
    /// Stock as currently shown on the board.
    async fn inventory(&self) -> [InventoryItem; 8];
    async fn register_donor(&self, donor: NewDonor) -> Result<(), ApiException>;
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: &'static str, reason: String },
    #[error(transparent)]
    Store(#[from] ApiException),
}

impl From<ToolError> for ApiError {
    fn from(value: ToolError) -> Self {
        match value {
            ToolError::Store(err) => err.into(),
            ToolError::UnknownTool(_) => ApiError::new(ErrorCode::NotFound, value.to_string()),
            ToolError::InvalidArguments { .. } => {
                ApiError::new(ErrorCode::Validation, value.to_string())
            }
        }
    }
}

pub fn declarations() -> Vec<ToolDeclaration> {
    let blood_types: Vec<&str> = BloodType::ALL.iter().map(|bt| bt.as_str()).collect();
    vec![
        ToolDeclaration {
            name: TOOL_SEARCH_DONORS.into(),
            description: "Search for blood donors in the database by blood type or location."
                .into(),
            parameters: ParameterSchema::object()
                .string(
                    "bloodType",
                    Some("The blood type to search for (e.g., O+, A-)"),
                )
                .string("location", Some("The city or area to search in")),
        },
        ToolDeclaration {
            name: TOOL_CHECK_INVENTORY.into(),
            description: "Get the current stock levels for all blood types.".into(),
            parameters: ParameterSchema::object(),
        },
        ToolDeclaration {
            name: TOOL_REGISTER_DONOR.into(),
            description: "Register a new donor into the HemoFlow system.".into(),
            parameters: ParameterSchema::object()
                .string("name", None)
                .one_of("bloodType", blood_types)
                .string("contact", None)
                .string("location", None)
                .required(["name", "bloodType", "contact", "location"]),
        },
    ]
}

/// Runs one call. Failures come back as an error descriptor result.
pub async fn execute_tool_call(directory: &dyn DonorDirectory, call: &ToolCall) -> ToolResponse {
    match run(directory, call).await {
        Ok(result) => ToolResponse::ok(call, result),
        Err(err) => {
            warn!(tool = %call.name, call_id = %call.id, "voice: tool call failed: {err}");
            ToolResponse::failed(call, &ApiError::from(err))
        }
    }
}

/// Runs calls one after another, in the order given.
pub async fn execute_tool_calls(
    directory: &dyn DonorDirectory,
    calls: &[ToolCall],
) -> Vec<ToolResponse> {
    let mut responses = Vec::with_capacity(calls.len());
    for call in calls {
        responses.push(execute_tool_call(directory, call).await);
    }
    responses
}

async fn run(directory: &dyn DonorDirectory, call: &ToolCall) -> Result<Value, ToolError> {
    debug!(tool = %call.name, call_id = %call.id, "voice: executing tool call");
    match call.name.as_str() {
        TOOL_SEARCH_DONORS => {
            let args: SearchDonorsArgs = parse_args(TOOL_SEARCH_DONORS, &call.args)?;
            let blood_type = match non_empty(args.blood_type) {
                Some(label) => Some(parse_blood_type(TOOL_SEARCH_DONORS, &label)?),
                None => None,
            };
            let rows = directory
                .search_donors(blood_type, non_empty(args.location))
                .await?;
            Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
        }
        TOOL_CHECK_INVENTORY => {
            let items = directory.inventory().await;
            let counts: Map<String, Value> = inventory::available_counts(&items)
                .into_iter()
                .map(|(blood_type, units)| (blood_type.as_str().to_string(), json!(units)))
                .collect();
            Ok(Value::Object(counts))
        }
        TOOL_REGISTER_DONOR => {
            let args: RegisterDonorArgs = parse_args(TOOL_REGISTER_DONOR, &call.args)?;
            let donor = NewDonor {
                blood_type: parse_blood_type(TOOL_REGISTER_DONOR, &args.blood_type)?,
                name: args.name,
                last_donation_date: None,
                contact: args.contact,
                location: args.location,
                is_available: true,
            };
            directory.register_donor(donor).await?;
            Ok(json!({ "status": "success", "message": "Donor registered successfully" }))
        }
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &'static str,
    args: &Value,
) -> Result<T, ToolError> {
    let args = if args.is_null() {
        Value::Object(Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|err| ToolError::InvalidArguments {
        tool,
        reason: err.to_string(),
    })
}

fn parse_blood_type(tool: &'static str, label: &str) -> Result<BloodType, ToolError> {
    label
        .parse()
        .map_err(|err: shared::domain::UnknownBloodType| ToolError::InvalidArguments {
            tool,
            reason: err.to_string(),
        })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use shared::domain::StockStatus;

    use super::*;

    #[derive(Default)]
    struct FakeDirectory {
        searches: Mutex<Vec<(Option<BloodType>, Option<String>)>>,
        registered: Mutex<Vec<NewDonor>>,
        fail_with: Option<ApiException>,
    }

    #[async_trait]
    impl DonorDirectory for FakeDirectory {
        async fn search_donors(
            &self,
            blood_type: Option<BloodType>,
            location: Option<String>,
        ) -> Result<Vec<Record>, ApiException> {
            self.searches
                .lock()
                .expect("searches")
                .push((blood_type, location));
            let mut row = Record::new();
            row.insert("name".into(), json!("Jane"));
            Ok(vec![row])
        }

        async fn inventory(&self) -> [InventoryItem; 8] {
            BloodType::ALL.map(|blood_type| {
                let units = if blood_type == BloodType::ONegative { 2 } else { 0 };
                InventoryItem {
                    blood_type,
                    units,
                    status: inventory::classify(units),
                }
            })
        }

        async fn register_donor(&self, donor: NewDonor) -> Result<(), ApiException> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.registered.lock().expect("registered").push(donor);
            Ok(())
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: format!("call-{name}"),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn declares_three_tools_with_register_requirements() {
        let tools = declarations();
        let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(
            names,
            vec![TOOL_SEARCH_DONORS, TOOL_CHECK_INVENTORY, TOOL_REGISTER_DONOR]
        );
        assert_eq!(
            tools[2].parameters.required,
            vec!["name", "bloodType", "contact", "location"]
        );
        assert_eq!(tools[2].parameters.properties[1].allowed_values.len(), 8);
    }

    #[tokio::test]
    async fn search_passes_parsed_filters() {
        let directory = FakeDirectory::default();
        let response = execute_tool_call(
            &directory,
            &call(
                TOOL_SEARCH_DONORS,
                json!({ "bloodType": "o negative", "location": "Brooklyn" }),
            ),
        )
        .await;
        assert!(!response.is_error());
        assert_eq!(response.id, "call-search_donors");
        assert_eq!(response.response.result[0]["name"], "Jane");
        assert_eq!(
            directory.searches.lock().expect("searches")[0],
            (Some(BloodType::ONegative), Some("Brooklyn".to_string()))
        );
    }

    #[tokio::test]
    async fn inventory_reports_only_stocked_types() {
        let directory = FakeDirectory::default();
        let response =
            execute_tool_call(&directory, &call(TOOL_CHECK_INVENTORY, Value::Null)).await;
        assert_eq!(response.response.result, json!({ "O-": 2 }));
        assert_eq!(inventory::classify(0), StockStatus::Critical);
    }

    #[tokio::test]
    async fn register_requires_all_fields() {
        let directory = FakeDirectory::default();
        let response = execute_tool_call(
            &directory,
            &call(TOOL_REGISTER_DONOR, json!({ "name": "Jane", "bloodType": "O+" })),
        )
        .await;
        assert!(response.is_error());
        assert_eq!(response.response.result["code"], "validation");
        assert!(directory.registered.lock().expect("registered").is_empty());
    }

    #[tokio::test]
    async fn store_failure_becomes_error_descriptor() {
        let directory = FakeDirectory {
            fail_with: Some(ApiException::unavailable("store offline")),
            ..FakeDirectory::default()
        };
        let response = execute_tool_call(
            &directory,
            &call(
                TOOL_REGISTER_DONOR,
                json!({
                    "name": "Jane",
                    "bloodType": "O+",
                    "contact": "555-0100",
                    "location": "Brooklyn",
                }),
            ),
        )
        .await;
        assert_eq!(
            response.response.result,
            json!({ "error": "store offline", "code": "unavailable" })
        );
    }

    #[tokio::test]
    async fn unknown_tool_and_ordering() {
        let directory = FakeDirectory::default();
        let calls = vec![
            call("launch_rocket", json!({})),
            call(TOOL_CHECK_INVENTORY, json!({})),
        ];
        let responses = execute_tool_calls(&directory, &calls).await;
        assert_eq!(responses.len(), 2);
        assert!(responses[0].is_error());
        assert_eq!(responses[0].response.result["code"], "not_found");
        assert_eq!(responses[1].id, "call-check_inventory");
    }
}
