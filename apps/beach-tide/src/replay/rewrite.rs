//! Per-participant identifier rewriting of recorded payloads.
//!
//! Networked-entity messages carry ids at the top level, in `data`, and in
//! each entry of `data.d`. Every level gets `owner` set to the local id and
//! `parent`/`networkId` suffixed with `-<local id>`; the top level also gets
//! `clientId`.
//!
//! Rewriting always works on a clone of the pristine recording: the suffix is
//! appended unconditionally, so a payload must never be localized twice.

use serde_json::{Map, Value};

use super::record::RecordedEvent;

/// Returns localized copies; `events` itself is never modified, so the same
/// loaded recording can be replayed any number of times.
pub fn localize(events: &[RecordedEvent], local_id: &str) -> Vec<RecordedEvent> {
    events
        .iter()
        .map(|event| {
            let mut event = event.clone();
            localize_payload(&mut event.payload, local_id);
            event
        })
        .collect()
}

pub fn localize_payload(payload: &mut Value, local_id: &str) {
    let Value::Object(top) = payload else {
        return;
    };
    top.insert("clientId".into(), Value::String(local_id.to_string()));
    rewrite_ids(top, local_id);

    let Some(Value::Object(data)) = top.get_mut("data") else {
        return;
    };
    rewrite_ids(data, local_id);
    if let Some(Value::Array(entries)) = data.get_mut("d") {
        for entry in entries.iter_mut() {
            if let Value::Object(entry) = entry {
                rewrite_ids(entry, local_id);
            }
        }
    }
}

fn rewrite_ids(object: &mut Map<String, Value>, local_id: &str) {
    if let Some(owner) = object.get_mut("owner") {
        *owner = Value::String(local_id.to_string());
    }
    let suffix = format!("-{local_id}");
    for key in ["parent", "networkId"] {
        if let Some(Value::String(id)) = object.get_mut(key) {
            id.push_str(&suffix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_owner_and_suffixes_ids() {
        let mut payload = json!({
            "owner": "bob",
            "parent": "entity-1",
            "networkId": "abc",
            "clientId": "bob"
        });
        localize_payload(&mut payload, "42");
        assert_eq!(
            payload,
            json!({
                "owner": "42",
                "parent": "entity-1-42",
                "networkId": "abc-42",
                "clientId": "42"
            })
        );
    }

    #[test]
    fn localizing_the_same_recording_twice_is_stable() {
        let events = vec![
            RecordedEvent::new(0, true, json!({"owner": "bob", "parent": "entity-1"})),
            RecordedEvent::new(5, false, json!({"data": {"networkId": "naf-1"}})),
        ];
        let first = localize(&events, "42");
        let second = localize(&events, "42");
        assert_eq!(first, second);
        assert_eq!(first[0].payload["parent"], "entity-1-42");
        assert_eq!(first[1].payload["data"]["networkId"], "naf-1-42");
    }

    #[test]
    fn suffix_is_appended_even_when_ids_look_localized() {
        let mut payload = json!({"parent": "entity-1", "networkId": "naf-1"});
        localize_payload(&mut payload, "1");
        assert_eq!(payload["parent"], "entity-1-1");
        assert_eq!(payload["networkId"], "naf-1-1");

        let distinct = vec![
            RecordedEvent::new(0, true, json!({"networkId": "a"})),
            RecordedEvent::new(0, true, json!({"networkId": "a-7"})),
        ];
        let localized = localize(&distinct, "7");
        assert_eq!(localized[0].payload["networkId"], "a-7");
        assert_eq!(localized[1].payload["networkId"], "a-7-7");
    }

    #[test]
    fn rewrites_nested_entity_updates() {
        let mut payload = json!({
            "dataType": "um",
            "data": {
                "owner": "alice",
                "networkId": "root",
                "d": [
                    {"networkId": "n1", "owner": "alice", "parent": null, "components": {}},
                    {"networkId": "n2", "owner": "alice", "parent": "n1"},
                    "not-an-object"
                ]
            }
        });
        localize_payload(&mut payload, "7");
        assert_eq!(payload["clientId"], "7");
        assert_eq!(payload["data"]["owner"], "7");
        assert_eq!(payload["data"]["networkId"], "root-7");
        assert_eq!(payload["data"]["d"][0]["networkId"], "n1-7");
        assert_eq!(payload["data"]["d"][0]["parent"], Value::Null);
        assert_eq!(payload["data"]["d"][1]["parent"], "n1-7");
        assert_eq!(payload["data"]["d"][2], "not-an-object");
    }

    #[test]
    fn absent_fields_are_not_invented() {
        let mut payload = json!({"type": "chat", "body": "hi"});
        localize_payload(&mut payload, "9");
        assert_eq!(payload, json!({"type": "chat", "body": "hi", "clientId": "9"}));

        let mut scalar = json!("plain");
        localize_payload(&mut scalar, "9");
        assert_eq!(scalar, json!("plain"));
    }

    #[test]
    fn localize_leaves_input_untouched() {
        let events = vec![RecordedEvent::new(0, true, json!({"owner": "bob"}))];
        let localized = localize(&events, "1");
        assert_eq!(events[0].payload["owner"], "bob");
        assert_eq!(localized[0].payload["owner"], "1");
    }
}
