use std::collections::HashMap;

use anyhow::Result;
use marathon::{
    models::{message::InputMessage, template::Template},
    workers::{
        builder::{render, topic_for},
        fetcher::merge_context,
    },
};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

/// Test: defaults fill every placeholder when the context is empty
#[test]
fn test_render_with_defaults_only() -> Result<()> {
    let context = merge_context(&sample_defaults(), &HashMap::new(), &bare_message());
    let (payload, unresolved) = render(&sample_body(), &context)?;

    assert_eq!(
        String::from_utf8(payload)?,
        r#"{"alert":"Someone just liked your village!"}"#
    );
    assert_eq!(unresolved, 0);

    Ok(())
}

/// Test: context values win over template defaults
#[test]
fn test_render_context_wins_over_defaults() -> Result<()> {
    let mut job_context = HashMap::new();
    job_context.insert("user_name".to_string(), json!("Camila"));
    job_context.insert("object_name".to_string(), json!("building"));

    let context = merge_context(&sample_defaults(), &job_context, &bare_message());
    let (payload, unresolved) = render(&sample_body(), &context)?;

    assert_eq!(
        String::from_utf8(payload)?,
        r#"{"alert":"Camila just liked your building!"}"#
    );
    assert_eq!(unresolved, 0);

    Ok(())
}

/// Test: a partial context mixes with defaults for the missing variables
#[test]
fn test_render_partial_context_mixes_with_defaults() -> Result<()> {
    let mut job_context = HashMap::new();
    job_context.insert("user_name".to_string(), json!("Camila"));

    let context = merge_context(&sample_defaults(), &job_context, &bare_message());
    let (payload, _) = render(&sample_body(), &context)?;

    assert_eq!(
        String::from_utf8(payload)?,
        r#"{"alert":"Camila just liked your village!"}"#
    );

    Ok(())
}

/// Test: unknown variables render as the empty string and are counted
#[test]
fn test_render_unknown_variable_is_empty_and_counted() -> Result<()> {
    let mut body = HashMap::new();
    body.insert("alert".to_string(), "Hi {{who}}, see {{what}}".to_string());

    let mut context = HashMap::new();
    context.insert("who".to_string(), json!("Ana"));

    let (payload, unresolved) = render(&body, &context)?;

    let rendered = String::from_utf8(payload)?;
    assert_eq!(rendered, r#"{"alert":"Hi Ana, see "}"#);
    assert!(
        !rendered.contains("{{"),
        "No literal placeholder may survive rendering"
    );
    assert_eq!(unresolved, 1);

    Ok(())
}

/// Test: rendering is pure, the same inputs yield byte-identical payloads
#[test]
fn test_render_is_deterministic() -> Result<()> {
    let mut job_context = HashMap::new();
    job_context.insert("user_name".to_string(), json!("Camila"));

    let context = merge_context(&sample_defaults(), &job_context, &bare_message());
    let (first, _) = render(&sample_body(), &context)?;
    let (second, _) = render(&sample_body(), &context)?;

    assert_eq!(first, second);

    Ok(())
}

/// Test: payload keys are serialized in sorted order
#[test]
fn test_render_sorts_payload_keys() -> Result<()> {
    let mut body = HashMap::new();
    body.insert("title".to_string(), "t".to_string());
    body.insert("alert".to_string(), "a".to_string());
    body.insert("badge".to_string(), "b".to_string());

    let (payload, _) = render(&body, &HashMap::new())?;

    assert_eq!(
        String::from_utf8(payload)?,
        r#"{"alert":"a","badge":"b","title":"t"}"#
    );

    Ok(())
}

/// Test: non-string context values render in their JSON string form
#[test]
fn test_render_stringifies_non_string_values() -> Result<()> {
    let mut body = HashMap::new();
    body.insert(
        "alert".to_string(),
        "{{count}} new, muted={{muted}}, note={{note}}".to_string(),
    );

    let mut context = HashMap::new();
    context.insert("count".to_string(), json!(3));
    context.insert("muted".to_string(), json!(false));
    context.insert("note".to_string(), JsonValue::Null);

    let (payload, unresolved) = render(&body, &context)?;

    assert_eq!(
        String::from_utf8(payload)?,
        r#"{"alert":"3 new, muted=false, note="}"#
    );
    assert_eq!(unresolved, 0, "Null is present in the context, not missing");

    Ok(())
}

/// Test: user fields override the job context in the merged context
#[test]
fn test_merge_context_user_fields_win() -> Result<()> {
    let mut message = bare_message();
    message.token = "device-token-1".to_string();
    message.locale = "pt".to_string();

    let mut job_context = HashMap::new();
    job_context.insert("locale".to_string(), json!("en"));

    let context = merge_context(&HashMap::new(), &job_context, &message);

    assert_eq!(context.get("locale"), Some(&json!("pt")));
    assert_eq!(context.get("token"), Some(&json!("device-token-1")));

    Ok(())
}

/// Test: topic names follow the bus fan-out scheme byte for byte
#[test]
fn test_topic_naming_scheme() {
    assert_eq!(topic_for("gcm", "myapp"), "push-gcm_myapp");
    assert_eq!(topic_for("apns", "other_app"), "push-apns_other_app");
}

/// Test: the compiled body tracks body changes in canonical sorted form
#[test]
fn test_compiled_body_follows_body_changes() -> Result<()> {
    let mut body = HashMap::new();
    body.insert("title".to_string(), "t".to_string());
    body.insert("alert".to_string(), "a".to_string());

    let mut template = Template::new(
        Uuid::new_v4(),
        "liked".to_string(),
        "en".to_string(),
        HashMap::new(),
        body,
        "tests".to_string(),
    )?;

    assert_eq!(template.compiled_body, r#"{"alert":"a","title":"t"}"#);

    template
        .body
        .insert("badge".to_string(), "b".to_string());
    template.recompile()?;

    assert_eq!(
        template.compiled_body,
        r#"{"alert":"a","badge":"b","title":"t"}"#
    );

    Ok(())
}

fn sample_body() -> HashMap<String, String> {
    let mut body = HashMap::new();
    body.insert(
        "alert".to_string(),
        "{{user_name}} just liked your {{object_name}}!".to_string(),
    );
    body
}

fn sample_defaults() -> HashMap<String, String> {
    let mut defaults = HashMap::new();
    defaults.insert("user_name".to_string(), "Someone".to_string());
    defaults.insert("object_name".to_string(), "village".to_string());
    defaults
}

fn bare_message() -> InputMessage {
    InputMessage {
        job_id: Uuid::new_v4(),
        app_name: "testapp".to_string(),
        service: "gcm".to_string(),
        template_name: "liked".to_string(),
        context: HashMap::new(),
        metadata: HashMap::new(),
        expires_at: 0,
        user_id: None,
        token: String::new(),
        locale: String::new(),
        tz: None,
    }
}
