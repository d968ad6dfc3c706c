//! Forward-only checkpoint schema migrations.
//!
//! Migrations run on the raw JSON document before typed deserialisation. Each
//! step is gated on the document's version, only inserts keys that are missing,
//! and bumps the version. Documents without `schema_version` are v1; documents
//! from a newer version are returned untouched.
//!
//! | Step  | Adds |
//! |-------|------|
//! | v1→v2 | `session_nonce` (empty), `convergence` defaults |
//! | v2→v3 | `resource_name: null` on every phase record |
//! | v3→v4 | a pending record for every registry phase the document lacks |
//! | v4→v5 | `elapsed_ms`, `warnings`, `flags`, `config`, `status` |

use serde_json::{Map, Value, json};
use tracing::debug;

use super::model::CURRENT_SCHEMA_VERSION;
use crate::phase::PhaseRegistry;

/// Schema version of a raw document.
pub fn document_version(doc: &Value) -> u64 {
    doc.get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1)
}

/// Apply every pending migration step in order.
pub fn migrate(mut doc: Value, registry: &PhaseRegistry) -> Value {
    let from = document_version(&doc);
    if from >= CURRENT_SCHEMA_VERSION as u64 {
        return doc;
    }
    let Some(obj) = doc.as_object_mut() else {
        return doc;
    };

    if from < 2 {
        debug!("Migrating checkpoint v1 -> v2");
        insert_missing(obj, "session_nonce", json!(""));
        insert_missing(
            obj,
            "convergence",
            json!({ "round": 0, "max_rounds": 0, "tier": null, "history": [] }),
        );
    }

    if from < 3 {
        debug!("Migrating checkpoint v2 -> v3");
        if let Some(phases) = obj.get_mut("phases").and_then(Value::as_object_mut) {
            for record in phases.values_mut() {
                if let Some(record) = record.as_object_mut() {
                    insert_missing(record, "resource_name", Value::Null);
                }
            }
        }
    }

    if from < 4 {
        debug!("Migrating checkpoint v3 -> v4");
        let phases = obj
            .entry("phases")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(phases) = phases.as_object_mut() {
            for name in registry.names() {
                insert_missing(
                    phases,
                    name,
                    json!({
                        "status": "pending",
                        "artifact_path": null,
                        "artifact_hash": null,
                        "resource_name": null,
                    }),
                );
            }
        }
    }

    if from < 5 {
        debug!("Migrating checkpoint v4 -> v5");
        insert_missing(obj, "elapsed_ms", json!(0));
        insert_missing(obj, "warnings", json!([]));
        insert_missing(obj, "flags", json!({}));
        insert_missing(obj, "config", json!({}));
        insert_missing(obj, "status", json!("in_progress"));
    }

    obj.insert(
        "schema_version".to_string(),
        json!(CURRENT_SCHEMA_VERSION),
    );
    doc
}

fn insert_missing(obj: &mut Map<String, Value>, key: &str, value: Value) {
    if !obj.contains_key(key) {
        obj.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::model::Checkpoint;

    fn v1_document() -> Value {
        json!({
            "id": "arc-1",
            "plan_reference": "plans/a.md",
            "phases": {
                "forge": { "status": "completed", "artifact_path": "/tmp/a", "artifact_hash": "abc" },
                "plan_review": { "status": "pending" }
            },
            "started_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_missing_version_is_treated_as_v1() {
        assert_eq!(document_version(&v1_document()), 1);
        assert_eq!(document_version(&json!({ "schema_version": 3 })), 3);
    }

    #[test]
    fn test_v1_migrates_to_current_and_deserialises() {
        let registry = PhaseRegistry::default_arc();
        let migrated = migrate(v1_document(), &registry);

        assert_eq!(document_version(&migrated), CURRENT_SCHEMA_VERSION as u64);
        assert_eq!(migrated["session_nonce"], json!(""));
        assert_eq!(migrated["phases"]["forge"]["resource_name"], Value::Null);
        assert_eq!(migrated["phases"]["forge"]["artifact_hash"], json!("abc"));
        assert_eq!(migrated["phases"]["ship"]["status"], json!("pending"));
        assert_eq!(migrated["elapsed_ms"], json!(0));

        let checkpoint: Checkpoint = serde_json::from_value(migrated).unwrap();
        assert_eq!(checkpoint.phases.len(), 12);
        assert!(checkpoint.session_nonce.is_empty());
    }

    #[test]
    fn test_v3_only_gets_later_steps() {
        let registry = PhaseRegistry::default_arc();
        let doc = json!({
            "schema_version": 3,
            "phases": { "forge": { "status": "pending" } }
        });
        let migrated = migrate(doc, &registry);
        // v2 -> v3 already ran for this document, so it is not re-applied
        assert!(migrated["phases"]["forge"].get("resource_name").is_none());
        assert!(migrated.get("session_nonce").is_none());
        assert_eq!(migrated["phases"]["work"]["status"], json!("pending"));
        assert_eq!(migrated["warnings"], json!([]));
    }

    #[test]
    fn test_existing_values_are_never_overwritten() {
        let registry = PhaseRegistry::default_arc();
        let mut doc = v1_document();
        doc["session_nonce"] = json!("0123456789abcdef0123456789abcdef");
        doc["elapsed_ms"] = json!(42);
        let migrated = migrate(doc, &registry);
        assert_eq!(
            migrated["session_nonce"],
            json!("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(migrated["elapsed_ms"], json!(42));
    }

    #[test]
    fn test_newer_documents_are_untouched() {
        let registry = PhaseRegistry::default_arc();
        let doc = json!({ "schema_version": 99, "phases": {} });
        assert_eq!(migrate(doc.clone(), &registry), doc);
    }

    #[test]
    fn test_non_object_is_untouched() {
        let registry = PhaseRegistry::default_arc();
        assert_eq!(migrate(json!([1, 2]), &registry), json!([1, 2]));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    const STATUSES: [&str; 6] = [
        "pending",
        "in_progress",
        "completed",
        "failed",
        "skipped",
        "timeout",
    ];

    fn arb_document() -> impl Strategy<Value = Value> {
        let registry = PhaseRegistry::default_arc();
        let names: Vec<String> = registry.names().iter().map(|s| s.to_string()).collect();
        (
            prop::option::of(1u64..=7),
            prop::collection::btree_map(
                prop_oneof![prop::sample::select(names), "[a-z_]{1,12}"],
                (0usize..STATUSES.len(), any::<bool>()),
                0..14,
            ),
            any::<bool>(),
        )
            .prop_map(|(version, phases, with_nonce)| {
                let mut phase_map = Map::new();
                for (name, (status, with_resource)) in phases {
                    let mut record = json!({ "status": STATUSES[status] });
                    if with_resource {
                        record["resource_name"] = json!(format!("arc-{}", name));
                    }
                    phase_map.insert(name, record);
                }
                let mut doc = json!({ "id": "arc-1", "phases": phase_map });
                if let Some(v) = version {
                    doc["schema_version"] = json!(v);
                }
                if with_nonce {
                    doc["session_nonce"] = json!("0123456789abcdef0123456789abcdef");
                }
                doc
            })
    }

    proptest! {
        #[test]
        fn migration_is_idempotent(doc in arb_document()) {
            let registry = PhaseRegistry::default_arc();
            let once = migrate(doc, &registry);
            let twice = migrate(once.clone(), &registry);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn migration_is_monotonic(doc in arb_document()) {
            let registry = PhaseRegistry::default_arc();
            let before_version = document_version(&doc);
            let before_phases: Vec<String> = doc["phases"]
                .as_object()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();

            let after = migrate(doc.clone(), &registry);
            prop_assert!(document_version(&after) >= before_version);
            for key in before_phases {
                prop_assert!(after["phases"].get(&key).is_some(), "lost phase {}", key);
                prop_assert_eq!(&after["phases"][&key]["status"], &doc["phases"][&key]["status"]);
            }
        }
    }
}
