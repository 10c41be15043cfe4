//! Row-level edits on cached JSON data.
//!
//! Cached data is either a collection (a JSON array of row objects) or a
//! single row object. Rows are matched by an identity field, `"id"` unless
//! configured otherwise. These helpers are shared by optimistic mutations
//! and pushed realtime changes so both edit the cache the same way.

use serde_json::{Map, Value};
use stoop_core::{ChangeOperation, InsertPlacement};

use super::store::Modification;

/// Identity value of a row, if it is an object carrying `field`.
pub fn identity_of<'a>(row: &'a Value, field: &str) -> Option<&'a Value> {
    row.as_object().and_then(|object| object.get(field))
}

fn merge_rows(existing: &Value, incoming: &Value) -> Value {
    match (existing.as_object(), incoming.as_object()) {
        (Some(current), Some(changes)) => {
            let mut merged: Map<String, Value> = current.clone();
            for (column, value) in changes {
                merged.insert(column.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

/// Insert `row` into `data`, or merge it into the row with the same identity.
///
/// For a collection the row is merged in place when present, otherwise
/// placed per `placement`. For a single row object the merge only applies
/// when the identities match. Returns `None` when nothing applies.
pub fn upsert_row(
    data: &Value,
    row: &Value,
    field: &str,
    placement: InsertPlacement,
) -> Option<Value> {
    let id = identity_of(row, field)?;
    match data {
        Value::Array(rows) => {
            let mut rows = rows.clone();
            match rows
                .iter()
                .position(|existing| identity_of(existing, field) == Some(id))
            {
                Some(index) => {
                    rows[index] = merge_rows(&rows[index], row);
                }
                None => match placement {
                    InsertPlacement::Front => rows.insert(0, row.clone()),
                    InsertPlacement::Back => rows.push(row.clone()),
                },
            }
            Some(Value::Array(rows))
        }
        Value::Object(_) if identity_of(data, field) == Some(id) => Some(merge_rows(data, row)),
        _ => None,
    }
}

/// Remove the row with identity `id` from a collection.
///
/// Returns `None` if `data` is not a collection or holds no such row.
pub fn remove_row(data: &Value, id: &Value, field: &str) -> Option<Value> {
    let rows = data.as_array()?;
    let kept: Vec<Value> = rows
        .iter()
        .filter(|row| identity_of(row, field) != Some(id))
        .cloned()
        .collect();
    if kept.len() == rows.len() {
        None
    } else {
        Some(Value::Array(kept))
    }
}

/// Decide how a row change applies to one cached document.
///
/// `Delete` on a single row object with the deleted identity yields
/// [`Modification::Delete`]; everything that does not touch `data` yields
/// [`Modification::Keep`].
pub fn apply_change(
    data: Option<&Value>,
    operation: ChangeOperation,
    payload: &Value,
    field: &str,
    placement: InsertPlacement,
) -> Modification {
    let Some(data) = data else {
        return Modification::Keep;
    };
    match operation {
        ChangeOperation::Insert | ChangeOperation::Update => {
            match upsert_row(data, payload, field, placement) {
                Some(updated) if &updated != data => Modification::Replace(updated),
                _ => Modification::Keep,
            }
        }
        ChangeOperation::Delete => {
            let Some(id) = identity_of(payload, field) else {
                return Modification::Keep;
            };
            if data.is_object() {
                if identity_of(data, field) == Some(id) {
                    Modification::Delete
                } else {
                    Modification::Keep
                }
            } else {
                match remove_row(data, id, field) {
                    Some(updated) => Modification::Replace(updated),
                    None => Modification::Keep,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_merges_existing_row() {
        let data = json!([{"id": "a", "title": "Lamp", "price": 10}]);
        let updated = upsert_row(&data, &json!({"id": "a", "price": 8}), "id", InsertPlacement::Back);
        assert_eq!(updated, Some(json!([{"id": "a", "title": "Lamp", "price": 8}])));
    }

    #[test]
    fn test_upsert_placement() {
        let data = json!([{"id": "a"}]);
        let back = upsert_row(&data, &json!({"id": "b"}), "id", InsertPlacement::Back).unwrap();
        assert_eq!(back, json!([{"id": "a"}, {"id": "b"}]));

        let front = upsert_row(&data, &json!({"id": "b"}), "id", InsertPlacement::Front).unwrap();
        assert_eq!(front, json!([{"id": "b"}, {"id": "a"}]));
    }

    #[test]
    fn test_upsert_single_row_requires_same_identity() {
        let data = json!({"id": "a", "title": "Lamp"});
        assert!(upsert_row(&data, &json!({"id": "b"}), "id", InsertPlacement::Back).is_none());
        assert_eq!(
            upsert_row(&data, &json!({"id": "a", "title": "Desk"}), "id", InsertPlacement::Back),
            Some(json!({"id": "a", "title": "Desk"}))
        );
    }

    #[test]
    fn test_upsert_without_identity_is_ignored() {
        let data = json!([]);
        assert!(upsert_row(&data, &json!({"title": "x"}), "id", InsertPlacement::Back).is_none());
    }

    #[test]
    fn test_custom_identity_field() {
        let data = json!([{"listing_id": 1, "title": "Lamp"}]);
        let updated = upsert_row(
            &data,
            &json!({"listing_id": 1, "title": "Desk"}),
            "listing_id",
            InsertPlacement::Back,
        );
        assert_eq!(updated, Some(json!([{"listing_id": 1, "title": "Desk"}])));
    }

    #[test]
    fn test_remove_row() {
        let data = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(remove_row(&data, &json!("a"), "id"), Some(json!([{"id": "b"}])));
        assert_eq!(remove_row(&data, &json!("zzz"), "id"), None);
        assert_eq!(remove_row(&json!({"id": "a"}), &json!("a"), "id"), None);
    }

    #[test]
    fn test_apply_change_delete_on_single_row() {
        let data = json!({"id": "a"});
        let change = apply_change(
            Some(&data),
            ChangeOperation::Delete,
            &json!({"id": "a"}),
            "id",
            InsertPlacement::Back,
        );
        assert_eq!(change, Modification::Delete);
    }

    #[test]
    fn test_apply_change_identical_update_is_keep() {
        let data = json!([{"id": "a", "n": 1}]);
        let change = apply_change(
            Some(&data),
            ChangeOperation::Update,
            &json!({"id": "a", "n": 1}),
            "id",
            InsertPlacement::Back,
        );
        assert_eq!(change, Modification::Keep);
    }

    #[test]
    fn test_apply_change_without_data_is_keep() {
        let change = apply_change(
            None,
            ChangeOperation::Insert,
            &json!({"id": "a"}),
            "id",
            InsertPlacement::Back,
        );
        assert_eq!(change, Modification::Keep);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_rows() -> impl Strategy<Value = Vec<Value>> {
            prop::collection::btree_set("[a-f]", 0..6).prop_map(|ids| {
                ids.into_iter()
                    .enumerate()
                    .map(|(n, id)| json!({"id": id, "n": n}))
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn prop_upsert_is_idempotent(rows in arb_rows(), id in "[a-h]", n in 0u32..100) {
                let data = Value::Array(rows);
                let row = json!({"id": id, "n": n});
                let once = upsert_row(&data, &row, "id", InsertPlacement::Back).unwrap();
                let twice = upsert_row(&once, &row, "id", InsertPlacement::Back).unwrap();
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn prop_remove_after_upsert_drops_identity(rows in arb_rows(), id in "[a-h]") {
                let data = Value::Array(rows);
                let upserted = upsert_row(&data, &json!({"id": id.clone()}), "id", InsertPlacement::Front).unwrap();
                let removed = remove_row(&upserted, &json!(id.clone()), "id").unwrap();
                let remaining = removed.as_array().unwrap();
                prop_assert!(remaining.iter().all(|row| identity_of(row, "id") != Some(&json!(id))));
                prop_assert_eq!(remaining.len() + 1, upserted.as_array().unwrap().len());
            }
        }
    }
}
