//! Chunk merging and continuation detection.
//!
//! The first chunk of a response is adopted whole. Every later chunk only
//! contributes its variable-length part, which is appended in arrival order:
//! the `data` array for list controllers, `data.sightings` and `data.forms`
//! for observations. Header fields of later chunks are ignored.

use serde_json::Value;
use vn_sync_api_models::MergeStrategy;

use crate::request::ApiResponse;

/// Header carrying the opaque key of the next chunk.
pub const PAGINATION_KEY_HEADER: &str = "pagination_key";

/// Header announcing a chunked transfer.
pub const TRANSFER_ENCODING_HEADER: &str = "transfer-encoding";

/// Query parameter used to request the next chunk.
pub const PAGINATION_KEY_PARAM: &str = "pagination_key";

/// Returns the pagination key of the next chunk, if the response declares a
/// chunked transfer **and** carries a key.
#[must_use]
pub fn next_pagination_key(response: &ApiResponse) -> Option<String> {
    let chunked = response
        .header(TRANSFER_ENCODING_HEADER)
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));

    if !chunked {
        return None;
    }

    response
        .header(PAGINATION_KEY_HEADER)
        .filter(|key| !key.is_empty())
        .map(ToString::to_string)
}

/// Merges `chunk` into `accumulator`.
pub fn merge_chunk(accumulator: &mut Option<Value>, mut chunk: Value, strategy: MergeStrategy) {
    if accumulator.is_none() {
        *accumulator = Some(chunk);
        return;
    }
    let Some(document) = accumulator.as_mut() else {
        return;
    };

    let Some(chunk_data) = chunk.get_mut("data").map(Value::take) else {
        return;
    };

    match strategy {
        MergeStrategy::List => extend_array(document, "data", chunk_data),
        MergeStrategy::Sightings => {
            let Value::Object(mut chunk_data) = chunk_data else {
                log::warn!("Observation chunk without a data object, ignored");
                return;
            };
            let Value::Object(root) = document else {
                return;
            };
            let data = root
                .entry("data")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            for key in ["sightings", "forms"] {
                if let Some(items) = chunk_data.remove(key) {
                    extend_array(data, key, items);
                }
            }
        }
    }
}

/// Appends the elements of `items` to the array at `target[key]`, creating
/// it if missing.
fn extend_array(target: &mut Value, key: &str, items: Value) {
    let Value::Array(items) = items else {
        log::warn!("Chunk field {key} is not an array, ignored");
        return;
    };
    let Value::Object(map) = target else {
        return;
    };

    match map
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(existing) => existing.extend(items),
        other => {
            log::warn!("Accumulated field {key} is not an array, replacing it");
            *other = Value::Array(items);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn response(headers: &[(&str, &str)]) -> ApiResponse {
        ApiResponse {
            status: 200,
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
            body: String::new(),
        }
    }

    #[test]
    fn continuation_needs_both_headers() {
        assert_eq!(
            next_pagination_key(&response(&[
                ("transfer-encoding", "chunked"),
                ("pagination_key", "k1")
            ])),
            Some("k1".to_string())
        );
        assert_eq!(
            next_pagination_key(&response(&[("pagination_key", "k1")])),
            None
        );
        assert_eq!(
            next_pagination_key(&response(&[("transfer-encoding", "chunked")])),
            None
        );
    }

    #[test]
    fn list_chunks_concatenate_in_arrival_order() {
        let mut acc = None;
        merge_chunk(
            &mut acc,
            json!({"data": [{"id": 1}, {"id": 2}], "header": "first"}),
            MergeStrategy::List,
        );
        merge_chunk(
            &mut acc,
            json!({"data": [{"id": 3}], "header": "second"}),
            MergeStrategy::List,
        );
        merge_chunk(&mut acc, json!({"data": [{"id": 4}]}), MergeStrategy::List);

        let doc = acc.unwrap();
        let ids: Vec<i64> = doc["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(doc["header"], "first");
    }

    #[test]
    fn sightings_and_forms_are_appended_separately() {
        let mut acc = None;
        merge_chunk(
            &mut acc,
            json!({"data": {"sightings": [{"id": "a"}]}}),
            MergeStrategy::Sightings,
        );
        merge_chunk(
            &mut acc,
            json!({"data": {"sightings": [{"id": "b"}], "forms": [{"id": "f1"}]}}),
            MergeStrategy::Sightings,
        );
        merge_chunk(
            &mut acc,
            json!({"data": {"forms": [{"id": "f2"}]}}),
            MergeStrategy::Sightings,
        );

        let doc = acc.unwrap();
        assert_eq!(doc["data"]["sightings"], json!([{"id": "a"}, {"id": "b"}]));
        assert_eq!(doc["data"]["forms"], json!([{"id": "f1"}, {"id": "f2"}]));
    }

    #[test]
    fn chunk_without_data_leaves_accumulator_untouched() {
        let mut acc = Some(json!({"data": [1, 2]}));
        merge_chunk(&mut acc, json!({"status": "ok"}), MergeStrategy::List);
        assert_eq!(acc.unwrap(), json!({"data": [1, 2]}));
    }
}
