//! Observation records and the content hash used to reconcile scratch
//! output against the authoritative collection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{ActionId, Instant, TimeSpan};

/// The semantic fields compared for identity between two observations.
pub const COMPARE_FIELDS: [&str; 6] = [
    "analyzer_id",
    "conditions",
    "path",
    "sources",
    "time",
    "value",
];

/// Field set a scratch document must carry, identity fields plus its own id.
pub const SCRATCH_FIELDS: [&str; 7] = [
    "_id",
    "analyzer_id",
    "conditions",
    "path",
    "sources",
    "time",
    "value",
];

/// Either a single instant or a closed range on the time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSpec {
    Range { from: Instant, to: Instant },
    Instant(Instant),
}

impl TimeSpec {
    /// Whether the whole time spec falls within the given span.
    pub fn within(&self, span: &TimeSpan) -> bool {
        match self {
            TimeSpec::Instant(at) => span.0 <= *at && *at <= span.1,
            TimeSpec::Range { from, to } => span.0 <= *from && from <= to && *to <= span.1,
        }
    }
}

/// One entry of an observation's validity history, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityStamp {
    pub id: ActionId,
    pub valid: bool,
}

/// A record of the authoritative observations collection.
///
/// `action_ids` is an append-only audit trail of validity flips; the first
/// element reflects current validity and no prior element is ever rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub analyzer_id: String,
    pub conditions: Vec<String>,
    pub time: TimeSpec,
    pub path: Value,
    pub value: Value,
    pub sources: Value,
    pub action_ids: Vec<ValidityStamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Observation {
    pub fn is_valid(&self) -> bool {
        self.action_ids.first().map(|s| s.valid).unwrap_or(false)
    }

    /// The identity fields as one JSON document, keys in canonical order.
    pub fn compare_value(&self) -> Result<Value, serde_json::Error> {
        let mut map = serde_json::Map::new();
        map.insert("analyzer_id".into(), Value::String(self.analyzer_id.clone()));
        map.insert("conditions".into(), serde_json::to_value(&self.conditions)?);
        map.insert("path".into(), self.path.clone());
        map.insert("sources".into(), self.sources.clone());
        map.insert("time".into(), serde_json::to_value(&self.time)?);
        map.insert("value".into(), self.value.clone());
        Ok(Value::Object(map))
    }

    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        Ok(content_hash(&self.compare_value()?))
    }

    pub fn same_content(&self, other: &Observation) -> Result<bool, serde_json::Error> {
        Ok(self.compare_value()? == other.compare_value()?)
    }

    /// Upload-action ids referenced by a direct observation's `sources.upl`.
    pub fn source_upload_actions(&self) -> Vec<ActionId> {
        self.sources
            .get("upl")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    }
}

/// A candidate observation as an analyzer module wrote it into scratch:
/// the identity fields only, with the time axis parsed into canonical form
/// so comparison and hashing do not depend on the module's serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScratchObservation {
    pub analyzer_id: String,
    pub conditions: Vec<String>,
    pub time: TimeSpec,
    pub path: Value,
    pub value: Value,
    pub sources: Value,
}

impl ScratchObservation {
    pub fn compare_value(&self) -> Result<Value, serde_json::Error> {
        let mut map = serde_json::Map::new();
        map.insert("analyzer_id".into(), Value::String(self.analyzer_id.clone()));
        map.insert("conditions".into(), serde_json::to_value(&self.conditions)?);
        map.insert("path".into(), self.path.clone());
        map.insert("sources".into(), self.sources.clone());
        map.insert("time".into(), serde_json::to_value(&self.time)?);
        map.insert("value".into(), self.value.clone());
        Ok(Value::Object(map))
    }

    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        Ok(content_hash(&self.compare_value()?))
    }

    /// Promote into a live observation born valid under the given action.
    pub fn into_observation(self, action_id: ActionId) -> Result<Observation, serde_json::Error> {
        let hash = self.content_hash()?;

        Ok(Observation {
            analyzer_id: self.analyzer_id,
            conditions: self.conditions,
            time: self.time,
            path: self.path,
            value: self.value,
            sources: self.sources,
            action_ids: vec![ValidityStamp {
                id: action_id,
                valid: true,
            }],
            hash: Some(hash),
        })
    }
}

/// The identity subdocument of a raw scratch document.
pub fn compare_subdocument(doc: &Value) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(fields) = doc.as_object() {
        for key in COMPARE_FIELDS {
            if let Some(value) = fields.get(key) {
                map.insert(key.to_string(), value.clone());
            }
        }
    }
    Value::Object(map)
}

/// Deterministic content hash over a JSON document.
///
/// Object keys are visited in sorted order and every node is length-framed,
/// so the digest is invariant under key permutations and unambiguous for
/// nested sequences.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(&mut hasher, value);
    hex::encode(hasher.finalize())
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => {
            hasher.update([1u8]);
            hasher.update([*b as u8]);
        }
        Value::Number(n) => {
            let repr = n.to_string();
            hasher.update([2u8]);
            hasher.update((repr.len() as u64).to_be_bytes());
            hasher.update(repr.as_bytes());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            hasher.update([5u8]);
            hasher.update((keys.len() as u64).to_be_bytes());
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                if let Some(item) = map.get(key) {
                    hash_value(hasher, item);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(h: u32) -> Instant {
        Utc.with_ymd_and_hms(2016, 6, 12, h, 0, 0).unwrap()
    }

    fn observation() -> Observation {
        Observation {
            analyzer_id: "analyzer-x".into(),
            conditions: vec!["tcp-ttl".into()],
            time: TimeSpec::Instant(at(5)),
            path: json!(["src", "dst"]),
            value: json!(64),
            sources: json!({"upl": [0]}),
            action_ids: vec![ValidityStamp { id: 7, valid: true }],
            hash: None,
        }
    }

    #[test]
    fn hash_invariant_under_key_order() {
        let a = json!({"x": 1, "y": {"a": [1, 2], "b": "s"}});
        let b = json!({"y": {"b": "s", "a": [1, 2]}, "x": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_distinguishes_nesting() {
        let flat = json!([1, 2, 3, 4]);
        let nested = json!([[1, 2], [3, 4]]);
        assert_ne!(content_hash(&flat), content_hash(&nested));

        let shifted = json!([[1], [2, 3, 4]]);
        assert_ne!(content_hash(&nested), content_hash(&shifted));
    }

    #[test]
    fn hash_ignores_non_identity_fields() {
        let a = observation();
        let mut b = observation();
        b.action_ids = vec![
            ValidityStamp { id: 9, valid: false },
            ValidityStamp { id: 7, valid: true },
        ];
        b.hash = Some("stale".into());

        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert!(a.same_content(&b).unwrap());
    }

    #[test]
    fn hash_changes_with_identity_fields() {
        let a = observation();
        let mut b = observation();
        b.value = json!(65);

        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert!(!a.same_content(&b).unwrap());
    }

    #[test]
    fn validity_follows_newest_stamp() {
        let mut obs = observation();
        assert!(obs.is_valid());

        obs.action_ids.insert(0, ValidityStamp { id: 9, valid: false });
        assert!(!obs.is_valid());
    }

    #[test]
    fn timespec_within_span() {
        let span = (at(4), at(8));

        assert!(TimeSpec::Instant(at(4)).within(&span));
        assert!(TimeSpec::Instant(at(8)).within(&span));
        assert!(!TimeSpec::Instant(at(9)).within(&span));

        let range = TimeSpec::Range {
            from: at(5),
            to: at(7),
        };
        assert!(range.within(&span));

        let sticking_out = TimeSpec::Range {
            from: at(5),
            to: at(9),
        };
        assert!(!sticking_out.within(&span));
    }

    #[test]
    fn timespec_untagged_wire_shape() {
        let instant: TimeSpec = serde_json::from_value(json!("2016-06-12T05:00:00Z")).unwrap();
        assert_eq!(instant, TimeSpec::Instant(at(5)));

        let range: TimeSpec =
            serde_json::from_value(json!({"from": "2016-06-12T05:00:00Z", "to": "2016-06-12T07:00:00Z"}))
                .unwrap();
        assert_eq!(
            range,
            TimeSpec::Range {
                from: at(5),
                to: at(7)
            }
        );
    }

    #[test]
    fn source_upload_actions_reads_upl_member() {
        let obs = observation();
        assert_eq!(obs.source_upload_actions(), vec![0]);

        let mut derived = observation();
        derived.sources = json!([1, 2]);
        assert!(derived.source_upload_actions().is_empty());
    }
}
