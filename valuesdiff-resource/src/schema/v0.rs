//! Version 0 of the provider wire format.
//!
//! Field names are camelCase on the wire. Requests and responses are
//! externally tagged with their type name, e.g.
//! `{"CreateResourceRequest": {"type": "diff", "inputProperties": {...}}}`.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The resource type, selecting the behavior inside a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(pub String);

impl Deref for ResourceType {
    type Target = String;
    fn deref(&self) -> &String {
        &self.0
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputProperties(pub Map<String, Value>);

impl Deref for InputProperties {
    type Target = Map<String, Value>;
    fn deref(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputProperties(pub Map<String, Value>);

impl Deref for OutputProperties {
    type Target = Map<String, Value>;
    fn deref(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// A resource that exists, as last recorded by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtantResource {
    #[serde(rename = "type")]
    pub type_: ResourceType,
    pub input_properties: InputProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_properties: Option<OutputProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceRequest {
    #[serde(rename = "type")]
    pub type_: ResourceType,
    pub input_properties: InputProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceResponse {
    pub output_properties: OutputProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResourceRequest {
    pub resource: ExtantResource,
    pub input_properties: InputProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResourceResponse {
    pub output_properties: OutputProperties,
}

/// Ask what a create (no `resource`) or update would produce, without
/// performing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResourceRequest {
    #[serde(rename = "type")]
    pub type_: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ExtantResource>,
    pub input_properties: InputProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResourceResponse {
    pub output_properties: OutputProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyResourceRequest {
    pub resource: ExtantResource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyResourceResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    /// A stable classification, when the provider has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    CreateResourceRequest(CreateResourceRequest),
    UpdateResourceRequest(UpdateResourceRequest),
    PlanResourceRequest(PlanResourceRequest),
    DestroyResourceRequest(DestroyResourceRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    CreateResourceResponse(CreateResourceResponse),
    UpdateResourceResponse(UpdateResourceResponse),
    PlanResourceResponse(PlanResourceResponse),
    DestroyResourceResponse(DestroyResourceResponse),
    ErrorResponse(ErrorResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_from_iter<T: IntoIterator<Item = (String, Value)>>(x: T) -> Map<String, Value> {
        Map::from_iter(x)
    }

    #[test]
    fn examples_v0_create_resource_request() {
        let json = include_str!("../../fixtures/v0/CreateResourceRequest.json");
        let value: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            value,
            Request::CreateResourceRequest(CreateResourceRequest {
                type_: ResourceType("diff".to_string()),
                input_properties: InputProperties(object_from_iter(vec![
                    (
                        "values".to_string(),
                        Value::Object(object_from_iter(vec![
                            ("1".to_string(), Value::String("a".to_string())),
                            ("2".to_string(), Value::String("b".to_string())),
                        ]))
                    ),
                    (
                        "commit_exp".to_string(),
                        Value::String("created.length < 3".to_string())
                    ),
                ])),
            })
        );
    }

    #[test]
    fn examples_v0_update_resource_request() {
        let json = include_str!("../../fixtures/v0/UpdateResourceRequest.json");
        let value: Request = serde_json::from_str(json).unwrap();
        let Request::UpdateResourceRequest(r) = value else {
            panic!("expected an update request, got {:?}", value);
        };
        assert_eq!(r.resource.type_.as_str(), "diff");
        let outputs = r.resource.output_properties.unwrap();
        assert_eq!(outputs.get("is_committed"), Some(&Value::Bool(true)));
        assert_eq!(r.input_properties.len(), 1);
    }

    #[test]
    fn test_error_response_omits_missing_kind() {
        let response = Response::ErrorResponse(ErrorResponse {
            message: "boom".to_string(),
            kind: None,
        });
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"ErrorResponse": {"message": "boom"}})
        );
    }

    #[test]
    fn test_create_request_ignores_unknown_fields() {
        let value: Request = serde_json::from_str(
            r#"{"CreateResourceRequest": {"type": "diff", "inputProperties": {}, "isStateful": true}}"#,
        )
        .unwrap();
        assert_eq!(
            value,
            Request::CreateResourceRequest(CreateResourceRequest {
                type_: ResourceType("diff".to_string()),
                input_properties: InputProperties::default(),
            })
        );
    }

    #[test]
    fn test_plan_request_without_resource() {
        let value: Request = serde_json::from_str(
            r#"{"PlanResourceRequest": {"type": "diff", "inputProperties": {"values": {}}}}"#,
        )
        .unwrap();
        let Request::PlanResourceRequest(r) = value else {
            panic!("expected a plan request");
        };
        assert!(r.resource.is_none());
    }
}
