//! Machine-scope enforcement shared by the three data-plane proxies
//! (cloud DB, local DB, object store).
//!
//! This is the core security property named in spec §4.5 and tested as
//! scenario 2 in spec §8: every read is filtered by
//! `robot_instance_id == this.machine_id`, and every write either injects
//! the local machine id or rejects a foreign one. Open Question resolved in
//! DESIGN.md: reject, don't silently overwrite.

use serde_json::Value;

use super::ProxyError;

pub const SCOPE_FIELD: &str = "robot_instance_id";

/// Applied to an outbound read query: adds/overwrites the scope filter so
/// the caller cannot widen a read beyond its own machine.
pub fn scope_query(mut query: Value, machine_id: &str) -> Value {
    if let Value::Object(ref mut map) = query {
        map.insert(SCOPE_FIELD.to_string(), Value::String(machine_id.to_string()));
    }
    query
}

/// Applied to an outbound write item.
///
/// - If the item has no `robot_instance_id`, one is injected.
/// - If it has one that matches `machine_id`, the item passes unchanged.
/// - If it has one that differs, the write is rejected (spec §8 scenario 2,
///   resolved in favor of rejection in SPEC_FULL §9).
pub fn enforce_write_scope(mut item: Value, machine_id: &str) -> Result<Value, ProxyError> {
    let Value::Object(ref mut map) = item else {
        return Err(ProxyError::Validation(
            "write item must be a JSON object".to_string(),
        ));
    };

    match map.get(SCOPE_FIELD) {
        None => {
            map.insert(SCOPE_FIELD.to_string(), Value::String(machine_id.to_string()));
        }
        Some(Value::String(existing)) if existing == machine_id => {}
        Some(Value::String(existing)) => {
            return Err(ProxyError::Authorization(format!(
                "write targeted robot_instance_id={existing} but this machine is {machine_id}"
            )));
        }
        Some(other) => {
            return Err(ProxyError::Validation(format!(
                "robot_instance_id must be a string, got {other}"
            )));
        }
    }

    Ok(item)
}

/// Applied to a page of read results: drops any item whose scope field does
/// not match, defense-in-depth against a backend that ignores the query
/// filter.
pub fn filter_read_results(items: Vec<Value>, machine_id: &str) -> Vec<Value> {
    items
        .into_iter()
        .filter(|item| {
            item.get(SCOPE_FIELD)
                .and_then(Value::as_str)
                .map(|v| v == machine_id)
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_machine_id_when_absent() {
        let item = json!({"id": "x"});
        let scoped = enforce_write_scope(item, "M1").unwrap();
        assert_eq!(scoped["robot_instance_id"], "M1");
    }

    #[test]
    fn passes_through_matching_machine_id() {
        let item = json!({"id": "x", "robot_instance_id": "M1"});
        let scoped = enforce_write_scope(item, "M1").unwrap();
        assert_eq!(scoped["robot_instance_id"], "M1");
    }

    #[test]
    fn rejects_foreign_machine_id() {
        let item = json!({"id": "x", "robot_instance_id": "M2"});
        let err = enforce_write_scope(item, "M1").unwrap_err();
        assert!(matches!(err, ProxyError::Authorization(_)));
    }

    #[test]
    fn filters_out_mismatched_reads() {
        let items = vec![
            json!({"id": "a", "robot_instance_id": "M1"}),
            json!({"id": "b", "robot_instance_id": "M2"}),
        ];
        let filtered = filter_read_results(items, "M1");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["id"], "a");
    }
}
