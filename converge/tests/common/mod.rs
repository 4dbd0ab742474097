#![allow(dead_code)]

use converge::{interrupt::InterruptState, state::StateStore, Controller, ControllerOptions};
use converge_resource::{AttributeDef, AttributeValue, Attributes, Nesting, Schema};
use serde_json::json;

pub const GROUP_NAME: &str = "parameter-group-test-terraform";

/// A database parameter group: a named family of server parameters.
pub fn parameter_group_schema() -> Schema {
    let parameter = Schema::new([
        ("name", AttributeDef::string().required()),
        ("value", AttributeDef::string().required()),
        (
            "apply_method",
            AttributeDef::string()
                .with_default("immediate")
                .metadata()
                .describe("immediate or pending-reboot"),
        ),
    ])
    .unwrap();
    Schema::new([
        ("name", AttributeDef::string().required().forces_replace()),
        ("family", AttributeDef::string().required().forces_replace()),
        (
            "description",
            AttributeDef::string()
                .forces_replace()
                .with_default("Managed by Terraform"),
        ),
        ("arn", AttributeDef::string().computed()),
        (
            "parameter",
            AttributeDef::blocks(parameter, Nesting::Unordered),
        ),
    ])
    .unwrap()
}

pub fn attrs(value: serde_json::Value) -> Attributes {
    serde_json::from_value(value).unwrap()
}

pub fn parameter(name: &str, value: &str) -> AttributeValue {
    AttributeValue::Block(attrs(json!({
        "name": name,
        "value": value,
        "apply_method": "immediate",
    })))
}

pub fn five_parameters() -> Vec<AttributeValue> {
    vec![
        parameter("character_set_server", "utf8"),
        parameter("character_set_client", "utf8"),
        parameter("collation_server", "utf8_unicode_ci"),
        parameter("collation_connection", "utf8_unicode_ci"),
        parameter("character_set_results", "utf8"),
    ]
}

pub fn group_config(parameters: Vec<AttributeValue>) -> Attributes {
    let mut config = attrs(json!({
        "name": GROUP_NAME,
        "family": "mysql5.6",
        "description": "Test parameter group for terraform",
    }));
    config.insert("parameter".to_string(), AttributeValue::List(parameters));
    config
}

pub fn controller() -> Controller {
    controller_with(ControllerOptions::default(), InterruptState::new())
}

pub fn controller_with(options: ControllerOptions, interrupt: InterruptState) -> Controller {
    Controller::new(parameter_group_schema(), StateStore::new(), options, interrupt)
}
