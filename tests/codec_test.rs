use serde_json::{json, Value as Json};
use tf_data_client::provider::codec::{self, ValueType};
use tf_data_client::provider::tfplugin6;

fn attribute(name: &str, type_expr: &str) -> tfplugin6::schema::Attribute {
    tfplugin6::schema::Attribute {
        name: name.to_string(),
        r#type: type_expr.as_bytes().to_vec(),
        ..Default::default()
    }
}

fn block(attributes: Vec<tfplugin6::schema::Attribute>) -> tfplugin6::schema::Block {
    tfplugin6::schema::Block {
        attributes,
        ..Default::default()
    }
}

fn envelope(msgpack: Vec<u8>) -> tfplugin6::DynamicValue {
    tfplugin6::DynamicValue {
        msgpack,
        json: vec![],
    }
}

#[test]
fn parses_primitive_and_compound_type_expressions() {
    assert_eq!(codec::parse_type(&json!("string")).unwrap(), ValueType::String);
    assert_eq!(codec::parse_type(&json!("bool")).unwrap(), ValueType::Bool);
    assert_eq!(codec::parse_type(&json!("number")).unwrap(), ValueType::Number);
    assert_eq!(codec::parse_type(&json!("dynamic")).unwrap(), ValueType::Dynamic);

    assert_eq!(
        codec::parse_type(&json!(["list", "string"])).unwrap(),
        ValueType::List(Box::new(ValueType::String))
    );
    assert_eq!(
        codec::parse_type(&json!(["map", ["set", "number"]])).unwrap(),
        ValueType::Map(Box::new(ValueType::Set(Box::new(ValueType::Number))))
    );

    let object = codec::parse_type(&json!(["object", {"id": "string", "count": "number"}])).unwrap();
    let ValueType::Object(attrs) = object else {
        panic!("expected object type");
    };
    assert_eq!(attrs.get("id"), Some(&ValueType::String));
    assert_eq!(attrs.get("count"), Some(&ValueType::Number));

    assert_eq!(
        codec::parse_type(&json!(["tuple", ["string", "bool"]])).unwrap(),
        ValueType::Tuple(vec![ValueType::String, ValueType::Bool])
    );

    assert!(codec::parse_type(&json!("flavor")).is_err());
    assert!(codec::parse_type(&json!(42)).is_err());
}

#[test]
fn block_type_wraps_nested_blocks_by_nesting_mode() {
    let nested = block(vec![attribute("port", "\"number\"")]);
    let mut top = block(vec![attribute("name", "\"string\"")]);
    for (type_name, nesting) in [
        ("single_block", tfplugin6::schema::nested_block::NestingMode::Single),
        ("group_block", tfplugin6::schema::nested_block::NestingMode::Group),
        ("list_block", tfplugin6::schema::nested_block::NestingMode::List),
        ("set_block", tfplugin6::schema::nested_block::NestingMode::Set),
        ("map_block", tfplugin6::schema::nested_block::NestingMode::Map),
    ] {
        top.block_types.push(tfplugin6::schema::NestedBlock {
            type_name: type_name.to_string(),
            block: Some(nested.clone()),
            nesting: nesting as i32,
            ..Default::default()
        });
    }

    let ValueType::Object(attrs) = codec::block_type(&top).unwrap() else {
        panic!("expected object type");
    };

    let inner = ValueType::Object(
        [("port".to_string(), ValueType::Number)].into_iter().collect(),
    );
    assert_eq!(attrs.get("name"), Some(&ValueType::String));
    assert_eq!(attrs.get("single_block"), Some(&inner));
    assert_eq!(attrs.get("group_block"), Some(&inner));
    assert_eq!(attrs.get("list_block"), Some(&ValueType::List(Box::new(inner.clone()))));
    assert_eq!(attrs.get("set_block"), Some(&ValueType::Set(Box::new(inner.clone()))));
    assert_eq!(attrs.get("map_block"), Some(&ValueType::Map(Box::new(inner))));
}

#[test]
fn attribute_without_type_information_is_dynamic() {
    let schema = block(vec![tfplugin6::schema::Attribute {
        name: "anything".to_string(),
        ..Default::default()
    }]);
    let ValueType::Object(attrs) = codec::block_type(&schema).unwrap() else {
        panic!("expected object type");
    };
    assert_eq!(attrs.get("anything"), Some(&ValueType::Dynamic));
}

#[test]
fn nested_object_attribute_wraps_by_its_nesting_mode() {
    let schema = block(vec![tfplugin6::schema::Attribute {
        name: "rules".to_string(),
        nested_type: Some(tfplugin6::schema::Object {
            attributes: vec![attribute("action", "\"string\"")],
            nesting: tfplugin6::schema::object::NestingMode::List as i32,
        }),
        ..Default::default()
    }]);

    let ValueType::Object(attrs) = codec::block_type(&schema).unwrap() else {
        panic!("expected object type");
    };
    let expected = ValueType::List(Box::new(ValueType::Object(
        [("action".to_string(), ValueType::String)].into_iter().collect(),
    )));
    assert_eq!(attrs.get("rules"), Some(&expected));
}

#[test]
fn round_trips_an_object_value_through_msgpack() {
    let ty = codec::parse_type(&json!([
        "object",
        {
            "name": "string",
            "replicas": "number",
            "enabled": "bool",
            "tags": ["list", "string"],
            "limits": ["map", "number"],
        }
    ]))
    .unwrap();

    let value = json!({
        "name": "web",
        "replicas": 3,
        "enabled": true,
        "tags": ["a", "b"],
        "limits": {"cpu": 2, "memory": 512},
    });

    let bytes = codec::encode(&value, &ty).unwrap();
    let decoded = codec::decode(&envelope(bytes), &ty).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn missing_attributes_encode_as_explicit_nulls() {
    let ty = codec::parse_type(&json!(["object", {"name": "string", "region": "string"}])).unwrap();
    let bytes = codec::encode(&json!({"name": "web"}), &ty).unwrap();
    let decoded = codec::decode(&envelope(bytes), &ty).unwrap();
    assert_eq!(decoded, json!({"name": "web", "region": null}));
}

#[test]
fn null_input_encodes_as_null_value() {
    let ty = codec::parse_type(&json!(["object", {"name": "string"}])).unwrap();
    let bytes = codec::encode(&Json::Null, &ty).unwrap();
    let decoded = codec::decode(&envelope(bytes), &ty).unwrap();
    assert_eq!(decoded, Json::Null);
}

#[test]
fn unknown_attribute_in_input_is_rejected() {
    let ty = codec::parse_type(&json!(["object", {"name": "string"}])).unwrap();
    let err = codec::encode(&json!({"name": "x", "stray": 1}), &ty).unwrap_err();
    assert!(format!("{err:#}").contains("stray"));
}

#[test]
fn dynamic_values_round_trip_with_their_type() {
    let value = json!({"kind": "auto", "count": 2});
    let bytes = codec::encode(&value, &ValueType::Dynamic).unwrap();
    let decoded = codec::decode(&envelope(bytes), &ValueType::Dynamic).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn unknown_value_extension_decodes_to_null() {
    // cty marks not-yet-computed values with msgpack extension type 0.
    let mut bytes = Vec::new();
    rmpv::encode::write_value(
        &mut bytes,
        &rmpv::Value::Ext(0, vec![0]),
    )
    .unwrap();
    let decoded = codec::decode(&envelope(bytes), &ValueType::String).unwrap();
    assert_eq!(decoded, Json::Null);
}

#[test]
fn big_numbers_arrive_as_strings() {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &rmpv::Value::from("12345678901234567")).unwrap();
    let decoded = codec::decode(&envelope(bytes), &ValueType::Number).unwrap();
    assert_eq!(decoded, json!(12345678901234567i64));
}

#[test]
fn json_payload_is_the_fallback_encoding() {
    let dv = tfplugin6::DynamicValue {
        msgpack: vec![],
        json: br#"{"name":"web"}"#.to_vec(),
    };
    let ty = codec::parse_type(&json!(["object", {"name": "string"}])).unwrap();
    assert_eq!(codec::decode(&dv, &ty).unwrap(), json!({"name": "web"}));
}

#[test]
fn empty_envelope_decodes_to_null() {
    let dv = tfplugin6::DynamicValue {
        msgpack: vec![],
        json: vec![],
    };
    assert_eq!(codec::decode(&dv, &ValueType::String).unwrap(), Json::Null);
}

#[test]
fn type_mismatches_fail_decoding() {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &rmpv::Value::Boolean(true)).unwrap();
    assert!(codec::decode(&envelope(bytes.clone()), &ValueType::String).is_err());
    assert!(codec::decode(&envelope(bytes), &ValueType::Number).is_err());
}

#[test]
fn error_diagnostics_abort_with_summary_and_detail() {
    let diagnostics = vec![
        tfplugin6::Diagnostic {
            severity: tfplugin6::diagnostic::Severity::Warning as i32,
            summary: "deprecated field".to_string(),
            detail: String::new(),
            attribute: None,
        },
        tfplugin6::Diagnostic {
            severity: tfplugin6::diagnostic::Severity::Error as i32,
            summary: "invalid credentials".to_string(),
            detail: "token expired".to_string(),
            attribute: None,
        },
    ];

    let err = codec::check_diagnostics(&diagnostics).unwrap_err();
    assert_eq!(err.to_string(), "invalid credentials: token expired");
}

#[test]
fn warnings_alone_do_not_fail() {
    let diagnostics = vec![tfplugin6::Diagnostic {
        severity: tfplugin6::diagnostic::Severity::Warning as i32,
        summary: "deprecated field".to_string(),
        detail: String::new(),
        attribute: None,
    }];
    assert!(codec::check_diagnostics(&diagnostics).is_ok());
}
