//! Canonical cache keys for pricing requests.
//!
//! Every field is rendered as `name=value`, fields are sorted by name and
//! joined with `;`. Values carry a type prefix so that different kinds never
//! render the same:
//!
//! | Kind     | Encoding                                      |
//! |----------|-----------------------------------------------|
//! | text     | `s:<escaped>`                                 |
//! | number   | `n:<decimal>` (`-0` normalized to `0`)        |
//! | flag     | `b:true` / `b:false`                          |
//! | list     | `[<escaped>,<escaped>,...]`                   |
//! | unset    | `none`                                        |
//!
//! The structural characters `\ ; = , [ ]` are backslash-escaped inside
//! names and text, which keeps the encoding injective. Free-form attributes
//! are namespaced as `attr.<name>` so they can never shadow a core field.

use crate::error::ValidationError;
use crate::request::{AttrValue, PricingRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Canonical, order-independent identity of a pricing request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableKey(String);

impl StableKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 hex digest of the canonical token, for logs and telemetry.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    /// First 12 hex characters of [`digest`](Self::digest).
    pub fn short(&self) -> String {
        let mut digest = self.digest();
        digest.truncate(12);
        digest
    }
}

impl fmt::Display for StableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StableKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build the canonical key for `request`.
///
/// Pure: the same request always yields the same key. Fails with the
/// request's validation error before any encoding happens.
pub fn build_key(request: &PricingRequest) -> Result<StableKey, ValidationError> {
    request.validate()?;

    let mut fields: Vec<(String, String)> = Vec::with_capacity(9 + request.attributes.len());

    fields.push(("part_id".to_string(), text(&request.part_id)));
    fields.push(("process".to_string(), text(request.process.as_str())));
    fields.push(("material_id".to_string(), text(&request.material_id)));
    fields.push(("machine_id".to_string(), text(&request.machine_id)));
    fields.push(("quantity".to_string(), format!("n:{}", request.quantity)));
    fields.push(("finish_ids".to_string(), list(request.sorted_finishes())));
    fields.push(("tolerance_id".to_string(), optional(request.tolerance_id.as_deref())));
    fields.push(("lead_time_id".to_string(), optional(request.lead_time_id.as_deref())));
    fields.push(("is_rush".to_string(), flag(request.is_rush)));

    for (name, value) in &request.attributes {
        let mut field = String::from("attr.");
        escape_into(&mut field, name);
        fields.push((field, attribute(value)));
    }

    fields.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let capacity = fields.iter().map(|(n, v)| n.len() + v.len() + 2).sum();
    let mut token = String::with_capacity(capacity);
    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            token.push(';');
        }
        token.push_str(name);
        token.push('=');
        token.push_str(value);
    }

    Ok(StableKey(token))
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, '\\' | ';' | '=' | ',' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn text(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push_str("s:");
    escape_into(&mut out, s);
    out
}

fn optional(s: Option<&str>) -> String {
    s.map_or_else(|| "none".to_string(), text)
}

fn flag(b: bool) -> String {
    let encoded = if b { "b:true" } else { "b:false" };
    encoded.to_string()
}

fn number(n: f64) -> String {
    // validate() already rejected non-finite values
    let n = if n == 0.0 { 0.0 } else { n };
    format!("n:{}", n)
}

fn list<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::from("[");
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_into(&mut out, item);
    }
    out.push(']');
    out
}

fn attribute(value: &AttrValue) -> String {
    match value {
        AttrValue::Flag(b) => flag(*b),
        AttrValue::Number(n) => number(*n),
        AttrValue::Text(s) => text(s),
        AttrValue::List(items) => list(items.iter().map(String::as_str)),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ProcessType;

    fn request() -> PricingRequest {
        PricingRequest::builder()
            .part_id("bracket-rev-a")
            .process(ProcessType::CncMilling)
            .material_id("aluminum-6061")
            .machine_id("haas-vf2")
            .quantity(10)
            .build()
            .unwrap()
    }

    #[test]
    fn test_key_is_sorted_and_typed() {
        let key = build_key(&request()).unwrap();
        assert_eq!(
            key.as_str(),
            "finish_ids=[];is_rush=b:false;lead_time_id=none;machine_id=s:haas-vf2;\
             material_id=s:aluminum-6061;part_id=s:bracket-rev-a;process=s:cnc_milling;\
             quantity=n:10;tolerance_id=none"
        );
    }

    #[test]
    fn test_finish_order_does_not_change_key() {
        let mut a = request();
        a.finish_ids = vec!["anodize".into(), "bead-blast".into()];
        let mut b = request();
        b.finish_ids = vec!["bead-blast".into(), "anodize".into()];
        assert_eq!(build_key(&a).unwrap(), build_key(&b).unwrap());
    }

    #[test]
    fn test_unset_optional_differs_from_literal_none() {
        let mut a = request();
        a.tolerance_id = Some("none".into());
        let b = request();
        assert_ne!(build_key(&a).unwrap(), build_key(&b).unwrap());
    }

    #[test]
    fn test_separator_injection_does_not_collide() {
        let mut a = request();
        a.attributes
            .insert("x".into(), AttrValue::Text("1;attr.y=s:2".into()));
        let mut b = request();
        b.attributes.insert("x".into(), AttrValue::Text("1".into()));
        b.attributes.insert("y".into(), AttrValue::Text("2".into()));
        assert_ne!(build_key(&a).unwrap(), build_key(&b).unwrap());
    }

    #[test]
    fn test_negative_zero_is_normalized() {
        let mut a = request();
        a.attributes.insert("offset".into(), AttrValue::Number(0.0));
        let mut b = request();
        b.attributes.insert("offset".into(), AttrValue::Number(-0.0));
        assert_eq!(build_key(&a).unwrap(), build_key(&b).unwrap());
    }

    #[test]
    fn test_number_and_text_do_not_collide() {
        let mut a = request();
        a.attributes.insert("k".into(), AttrValue::Number(4.0));
        let mut b = request();
        b.attributes.insert("k".into(), AttrValue::Text("4".into()));
        assert_ne!(build_key(&a).unwrap(), build_key(&b).unwrap());
    }

    #[test]
    fn test_missing_required_field_fails_with_name() {
        let mut r = request();
        r.machine_id = String::new();
        assert_eq!(
            build_key(&r).unwrap_err(),
            ValidationError::missing("machine_id")
        );
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let key = build_key(&request()).unwrap();
        let digest = key.digest();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, build_key(&request()).unwrap().digest());
        assert_eq!(key.short(), digest[..12]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::request::ProcessType;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn process_strategy() -> impl Strategy<Value = ProcessType> {
        prop_oneof![
            Just(ProcessType::CncMilling),
            Just(ProcessType::CncTurning),
            Just(ProcessType::SheetMetal),
            Just(ProcessType::InjectionMolding),
        ]
    }

    /// Small value domains so that equal requests are generated often.
    fn word() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just("a;b".to_string()),
            Just("x=y".to_string()),
            Just("[c]".to_string()),
        ]
    }

    fn attr_strategy() -> impl Strategy<Value = AttrValue> {
        prop_oneof![
            any::<bool>().prop_map(AttrValue::Flag),
            (-3i32..3).prop_map(|n| AttrValue::Number(n as f64 / 2.0)),
            word().prop_map(AttrValue::Text),
            prop::collection::vec(word(), 0..3).prop_map(AttrValue::List),
        ]
    }

    fn request_strategy() -> impl Strategy<Value = PricingRequest> {
        (
            word(),
            process_strategy(),
            word(),
            word(),
            1u32..4,
            prop::collection::vec(word(), 0..3),
            prop::option::of(word()),
            prop::option::of(word()),
            any::<bool>(),
            prop::collection::btree_map(word(), attr_strategy(), 0..3),
        )
            .prop_map(
                |(
                    part_id,
                    process,
                    material_id,
                    machine_id,
                    quantity,
                    finish_ids,
                    tolerance_id,
                    lead_time_id,
                    is_rush,
                    attributes,
                )| PricingRequest {
                    part_id,
                    process,
                    material_id,
                    machine_id,
                    quantity,
                    finish_ids,
                    tolerance_id,
                    lead_time_id,
                    is_rush,
                    attributes,
                },
            )
    }

    /// Re-serialize a request as JSON with its object keys in reverse order.
    fn reversed_json(request: &PricingRequest) -> String {
        let value = serde_json::to_value(request).unwrap();
        let object = value.as_object().unwrap();
        let entries: Vec<String> = object
            .iter()
            .rev()
            .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap(), v))
            .collect();
        format!("{{{}}}", entries.join(","))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: field declaration order never changes the key.
        #[test]
        fn prop_key_ignores_field_order(request in request_strategy()) {
            let permuted: PricingRequest = serde_json::from_str(&reversed_json(&request)).unwrap();
            prop_assert_eq!(build_key(&request).unwrap(), build_key(&permuted).unwrap());
        }

        /// Property: finish order never changes the key.
        #[test]
        fn prop_key_ignores_finish_order(request in request_strategy()) {
            let mut reversed = request.clone();
            reversed.finish_ids.reverse();
            prop_assert_eq!(build_key(&request).unwrap(), build_key(&reversed).unwrap());
        }

        /// Property: keys are equal exactly when the requests are logically equal.
        #[test]
        fn prop_key_equality_matches_logical_equality(
            a in request_strategy(),
            b in request_strategy(),
        ) {
            let same_key = build_key(&a).unwrap() == build_key(&b).unwrap();
            prop_assert_eq!(same_key, a.diff(&b).is_empty());
        }

        /// Property: build_key is deterministic.
        #[test]
        fn prop_key_is_pure(request in request_strategy()) {
            prop_assert_eq!(build_key(&request).unwrap(), build_key(&request.clone()).unwrap());
        }

        /// Property: attribute insertion order never changes the key.
        #[test]
        fn prop_key_ignores_attribute_insertion_order(
            request in request_strategy(),
            pairs in prop::collection::vec((word(), attr_strategy()), 0..4),
        ) {
            let mut forward = request.clone();
            forward.attributes = pairs.iter().cloned().collect::<BTreeMap<_, _>>();
            let mut backward = request;
            backward.attributes = BTreeMap::new();
            // last write wins in both directions, so dedup by name first
            let mut seen = BTreeMap::new();
            for (k, v) in &pairs {
                seen.insert(k.clone(), v.clone());
            }
            for (k, v) in seen.into_iter().rev() {
                backward.attributes.insert(k, v);
            }
            prop_assert_eq!(build_key(&forward).unwrap(), build_key(&backward).unwrap());
        }
    }
}
