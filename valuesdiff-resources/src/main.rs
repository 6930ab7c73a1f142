use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::{
    filter::LevelFilter, fmt::Layer as FmtLayer, layer::SubscriberExt as _, Layer as _, Registry,
};
use valuesdiff_core::{
    reconcile::{self, CycleInput, ReconciliationState, RESOURCE_ID},
    Gate, GateError, Snapshot,
};
use valuesdiff_resource::framework::{run_main, ResourceProvider};
use valuesdiff_resource::schema::v0;

#[derive(Default)]
struct DiffResourceProvider {
    gate: Gate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct DiffInProperties {
    values: Snapshot,
    #[serde(default)]
    commit_exp: Option<String>,
}

impl DiffInProperties {
    fn into_cycle_input(self) -> CycleInput {
        CycleInput {
            values: self.values,
            commit_expression: self.commit_exp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiffOutProperties {
    id: String,
    is_initiated: bool,
    last_values: Snapshot,
    created: Vec<String>,
    updated: Vec<String>,
    deleted: Vec<String>,
    commit_exp: String,
    is_committed: bool,
}

impl From<ReconciliationState> for DiffOutProperties {
    fn from(state: ReconciliationState) -> Self {
        DiffOutProperties {
            id: state.identifier,
            is_initiated: state.is_initiated,
            last_values: state.last_values,
            created: state.created,
            updated: state.updated,
            deleted: state.deleted,
            commit_exp: state.commit_expression,
            is_committed: state.is_committed,
        }
    }
}

impl DiffOutProperties {
    /// The outputs do not repeat `values`; those are the inputs the resource
    /// was last created or updated with.
    fn into_state(self, values: Snapshot) -> ReconciliationState {
        ReconciliationState {
            identifier: self.id,
            is_initiated: self.is_initiated,
            values,
            last_values: self.last_values,
            created: self.created,
            updated: self.updated,
            deleted: self.deleted,
            commit_expression: self.commit_exp,
            is_committed: self.is_committed,
        }
    }
}

impl ResourceProvider for DiffResourceProvider {
    fn create(&self, request: v0::CreateResourceRequest) -> Result<v0::CreateResourceResponse> {
        match request.type_.as_str() {
            RESOURCE_ID => {
                let inputs: DiffInProperties =
                    parse_input_properties(&request.input_properties, &request.type_)?;
                let state = reconcile::initiate(&inputs.into_cycle_input(), &self.gate)?;
                Ok(v0::CreateResourceResponse {
                    output_properties: output_properties(DiffOutProperties::from(state))?,
                })
            }
            t => bail!("DiffResourceProvider::create: unknown resource type: {}", t),
        }
    }

    fn update(&self, request: v0::UpdateResourceRequest) -> Result<v0::UpdateResourceResponse> {
        match request.resource.type_.as_str() {
            RESOURCE_ID => {
                let previous = previous_state(&request.resource)?;
                let inputs: DiffInProperties =
                    parse_input_properties(&request.input_properties, &request.resource.type_)?;
                let state =
                    reconcile::reconcile(&previous, &inputs.into_cycle_input(), &self.gate)?;
                Ok(v0::UpdateResourceResponse {
                    output_properties: output_properties(DiffOutProperties::from(state))?,
                })
            }
            t => bail!("DiffResourceProvider::update: unknown resource type: {}", t),
        }
    }

    fn plan(&self, request: v0::PlanResourceRequest) -> Result<v0::PlanResourceResponse> {
        match request.type_.as_str() {
            RESOURCE_ID => {
                let previous = request.resource.as_ref().map(previous_state).transpose()?;
                let inputs: DiffInProperties =
                    parse_input_properties(&request.input_properties, &request.type_)?;
                let transition = reconcile::preview(
                    previous.as_ref(),
                    &inputs.into_cycle_input(),
                    &self.gate,
                )?;
                Ok(v0::PlanResourceResponse {
                    output_properties: output_properties(DiffOutProperties::from(
                        transition.state,
                    ))?,
                })
            }
            t => bail!("DiffResourceProvider::plan: unknown resource type: {}", t),
        }
    }

    fn error_kind(&self, error: &anyhow::Error) -> Option<String> {
        error
            .chain()
            .find_map(|e| e.downcast_ref::<GateError>())
            .map(|e| e.tag().to_string())
    }
}

fn previous_state(resource: &v0::ExtantResource) -> Result<ReconciliationState> {
    let inputs: DiffInProperties =
        parse_input_properties(&resource.input_properties, &resource.type_)?;
    let outputs = resource.output_properties.as_ref().ok_or_else(|| {
        anyhow::anyhow!(
            "The update operation on a {} resource requires that the output properties are set",
            resource.type_
        )
    })?;
    let outputs: DiffOutProperties = serde_json::from_value(Value::Object(outputs.0.clone()))
        .with_context(|| {
            format!(
                "Could not deserialize output properties for {} resource",
                resource.type_
            )
        })?;
    Ok(outputs.into_state(inputs.values))
}

fn parse_input_properties<T: for<'de> Deserialize<'de>>(
    input_properties: &v0::InputProperties,
    resource_type: &str,
) -> Result<T> {
    serde_json::from_value(Value::Object(input_properties.0.clone())).with_context(|| {
        format!(
            "Could not deserialize input properties for {} resource",
            resource_type
        )
    })
}

fn output_properties(out: impl Serialize) -> Result<v0::OutputProperties> {
    match serde_json::to_value(out)? {
        Value::Object(o) => Ok(v0::OutputProperties(o)),
        _ => bail!("Expected object as output"),
    }
}

/// Stdout carries the protocol, so logs go to stderr, without colors.
fn set_up_logging() -> Result<()> {
    let fmt_layer = FmtLayer::new()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::INFO);
    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("failed to set up tracing: {}", e))
}

fn main() {
    if let Err(e) = set_up_logging() {
        eprintln!("warning: {:#}", e);
    }
    run_main(DiffResourceProvider::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use valuesdiff_resource::framework::handle_request;

    fn object(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(o) => o,
            _ => panic!("not an object: {}", value),
        }
    }

    fn create(inputs: Value) -> Result<v0::CreateResourceResponse> {
        DiffResourceProvider::default().create(v0::CreateResourceRequest {
            type_: v0::ResourceType("diff".to_string()),
            input_properties: v0::InputProperties(object(inputs)),
        })
    }

    fn extant(inputs: Value, outputs: &v0::OutputProperties) -> v0::ExtantResource {
        v0::ExtantResource {
            type_: v0::ResourceType("diff".to_string()),
            input_properties: v0::InputProperties(object(inputs)),
            output_properties: Some(outputs.clone()),
        }
    }

    #[test]
    fn test_create() {
        let response = create(json!({"values": {"1": "a", "2": "b", "3": "c"}})).unwrap();
        assert_eq!(
            Value::Object(response.output_properties.0),
            json!({
                "id": "diff",
                "is_initiated": true,
                "last_values": {},
                "created": ["1", "2", "3"],
                "updated": [],
                "deleted": [],
                "commit_exp": "true",
                "is_committed": true,
            })
        );
    }

    #[test]
    fn test_update_sequence() {
        let provider = DiffResourceProvider::default();
        let first_inputs = json!({"values": {"1": "a", "2": "b", "3": "c"}});
        let first = create(first_inputs.clone()).unwrap();

        let second_inputs = json!({
            "values": {"1": "a", "3": "cc", "4": "d", "5": "e"},
            "commit_exp": "created.length + updated.length <= 1",
        });
        let second = provider
            .update(v0::UpdateResourceRequest {
                resource: extant(first_inputs, &first.output_properties),
                input_properties: v0::InputProperties(object(second_inputs.clone())),
            })
            .unwrap();
        assert_eq!(
            Value::Object(second.output_properties.0.clone()),
            json!({
                "id": "diff",
                "is_initiated": false,
                "last_values": {"1": "a", "2": "b", "3": "c"},
                "created": ["4", "5"],
                "updated": ["3"],
                "deleted": ["2"],
                "commit_exp": "created.length + updated.length <= 1",
                "is_committed": false,
            })
        );

        // The rejected cycle did not move the baseline.
        let third = provider
            .update(v0::UpdateResourceRequest {
                resource: extant(second_inputs, &second.output_properties),
                input_properties: v0::InputProperties(object(json!({"values": {"1": "b"}}))),
            })
            .unwrap();
        assert_eq!(
            third.output_properties.get("last_values"),
            Some(&json!({"1": "a", "2": "b", "3": "c"}))
        );
        assert_eq!(third.output_properties.get("deleted"), Some(&json!(["2", "3"])));
        assert_eq!(third.output_properties.get("is_committed"), Some(&json!(true)));
    }

    #[test]
    fn test_plan_without_resource() {
        let response = DiffResourceProvider::default()
            .plan(v0::PlanResourceRequest {
                type_: v0::ResourceType("diff".to_string()),
                resource: None,
                input_properties: v0::InputProperties(object(json!({"values": {"k": "v"}}))),
            })
            .unwrap();
        assert_eq!(response.output_properties.get("is_initiated"), Some(&json!(true)));
        assert_eq!(response.output_properties.get("created"), Some(&json!(["k"])));
    }

    #[test]
    fn test_gate_error_kind() {
        let response = handle_request(
            &DiffResourceProvider::default(),
            v0::Request::CreateResourceRequest(v0::CreateResourceRequest {
                type_: v0::ResourceType("diff".to_string()),
                input_properties: v0::InputProperties(object(
                    json!({"values": {}, "commit_exp": "created.length >"}),
                )),
            }),
        );
        let v0::Response::ErrorResponse(e) = response else {
            panic!("expected an error response, got {:?}", response);
        };
        assert_eq!(e.kind.as_deref(), Some("SyntaxError"));
        assert!(e.message.contains("Syntax error in `commit_exp`"), "{}", e.message);
    }

    #[test]
    fn test_plan_syntax_error_kind() {
        let provider = DiffResourceProvider::default();
        let inputs = json!({"values": {"1": "a"}});
        let created = create(inputs.clone()).unwrap();
        let response = handle_request(
            &provider,
            v0::Request::PlanResourceRequest(v0::PlanResourceRequest {
                type_: v0::ResourceType("diff".to_string()),
                resource: Some(extant(inputs, &created.output_properties)),
                input_properties: v0::InputProperties(object(
                    json!({"values": {"1": "b"}, "commit_exp": "(("}),
                )),
            }),
        );
        let v0::Response::ErrorResponse(e) = response else {
            panic!("expected an error response, got {:?}", response);
        };
        assert_eq!(e.kind.as_deref(), Some("SyntaxError"));
        assert!(e.message.starts_with("Could not plan resource"), "{}", e.message);
    }

    #[test]
    fn test_update_requires_outputs() {
        let err = DiffResourceProvider::default()
            .update(v0::UpdateResourceRequest {
                resource: v0::ExtantResource {
                    type_: v0::ResourceType("diff".to_string()),
                    input_properties: v0::InputProperties(object(json!({"values": {}}))),
                    output_properties: None,
                },
                input_properties: v0::InputProperties(object(json!({"values": {}}))),
            })
            .unwrap_err();
        assert!(err.to_string().contains("requires that the output properties are set"));
    }

    #[test]
    fn test_non_string_values_rejected() {
        let err = create(json!({"values": {"k": 1}})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not deserialize input properties for diff resource"
        );
    }

    #[test]
    fn test_unknown_type() {
        let err = DiffResourceProvider::default()
            .create(v0::CreateResourceRequest {
                type_: v0::ResourceType("items".to_string()),
                input_properties: v0::InputProperties::default(),
            })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "DiffResourceProvider::create: unknown resource type: items"
        );
    }
}
