//! Key encoding, dot-notation update building, and keyed hashing.
//!
//! The store reserves `.` for dotted-path addressing and `$` as an operator
//! prefix, so any field name that may originate from variable input must be
//! passed through [`encode_key`] before it is stored. The escape character
//! `%` itself is escaped first so decoding is an exact inverse.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mongodb::bson::{Bson, Document};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Escape the reserved characters `%`, `.`, and `$` in a field name.
pub fn encode_key(name: &str) -> String {
    name.replace('%', "%25")
        .replace('.', "%2E")
        .replace('$', "%24")
}

/// Exact inverse of [`encode_key`]. The escape character is restored last so
/// decoded text is never re-decoded.
pub fn decode_key(name: &str) -> String {
    name.replace("%2E", ".")
        .replace("%24", "$")
        .replace("%25", "%")
}

/// Recursively encode every key of every nested document. Array elements are
/// processed recursively; scalars pass through untouched.
pub fn encode(value: Bson) -> Bson {
    transform_keys(value, encode_key)
}

/// Recursively decode every key of every nested document.
pub fn decode(value: Bson) -> Bson {
    transform_keys(value, decode_key)
}

fn transform_keys(value: Bson, map_key: fn(&str) -> String) -> Bson {
    match value {
        Bson::Document(doc) => {
            let mut out = Document::new();
            for (key, inner) in doc {
                out.insert(map_key(&key), transform_keys(inner, map_key));
            }
            Bson::Document(out)
        }
        Bson::Array(items) => Bson::Array(
            items
                .into_iter()
                .map(|item| transform_keys(item, map_key))
                .collect(),
        ),
        scalar => scalar,
    }
}

/// Filtering options for [`build_update`]. `filter` is mutually exclusive
/// with `include`/`exclude`.
#[derive(Default)]
pub struct UpdateOptions<'a> {
    /// Path prefix prepended to every produced key
    pub field: Option<String>,
    /// Keep a path only when this predicate returns true for it
    pub filter: Option<&'a dyn Fn(&str, &Bson) -> bool>,
    /// Allow-list: a dotted path survives only when it and every dotted
    /// intermediate level appear here
    pub include: Option<HashSet<String>>,
    /// Deny-list of encoded dotted paths
    pub exclude: Option<HashSet<String>>,
}

/// Flatten a nested document into a single level of dot-joined, key-encoded
/// paths, suitable for a partial-update operation.
///
/// Arrays are leaf values assigned whole, with their elements' keys encoded
/// recursively rather than flattened; an empty subdocument is likewise a
/// leaf, assigned whole so it overwrites whatever was stored at that path.
/// Supplying `filter` together with `include` or `exclude` fails before the
/// input is touched.
pub fn build_update(obj: &Document, options: &UpdateOptions<'_>) -> Result<Document> {
    if options.filter.is_some() && (options.include.is_some() || options.exclude.is_some()) {
        return Err(Error::Configuration(
            "build_update accepts either a filter predicate or include/exclude lists, not both"
                .to_string(),
        ));
    }
    let mut out = Document::new();
    let prefix = options.field.as_deref().unwrap_or("");
    flatten_into(obj, prefix, options, &mut out);
    Ok(out)
}

fn flatten_into(doc: &Document, prefix: &str, options: &UpdateOptions<'_>, out: &mut Document) {
    for (key, value) in doc {
        let encoded = encode_key(key);
        let path = if prefix.is_empty() {
            encoded
        } else {
            format!("{prefix}.{encoded}")
        };

        if let Some(filter) = options.filter {
            if !filter(&path, value) {
                continue;
            }
        }
        if let Some(ref exclude) = options.exclude {
            if exclude.contains(&path) {
                continue;
            }
        }
        if let Some(ref include) = options.include {
            // Every dotted level must be explicitly allowed, intermediate
            // subdocuments included; top-level keys always survive.
            if path.contains('.') && !include.contains(&path) {
                continue;
            }
        }

        match value {
            Bson::Document(nested) if !nested.is_empty() => {
                flatten_into(nested, &path, options, out);
            }
            leaf => {
                out.insert(path, encode(leaf.clone()));
            }
        }
    }
}

/// Deterministic one-way digest of a key into a fixed-length indexable
/// string: SHA-256 rendered as standard base64. Used to build lookup fields
/// without storing the raw key as an index.
pub fn hash(key: &str) -> String {
    BASE64.encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_encode_key_reserved_characters() {
        assert_eq!(encode_key("plain"), "plain");
        assert_eq!(encode_key("a.b"), "a%2Eb");
        assert_eq!(encode_key("$set"), "%24set");
        assert_eq!(encode_key("100%"), "100%25");
        assert_eq!(encode_key("%.$"), "%25%2E%24");
    }

    #[test]
    fn test_decode_key_is_inverse() {
        for key in ["plain", "a.b", "$set", "100%", "%.$", "%2E", "%25", ""] {
            assert_eq!(decode_key(&encode_key(key)), key, "roundtrip of {key:?}");
        }
    }

    #[test]
    fn test_encode_decode_documents() {
        let original = Bson::Document(doc! {
            "a.b": 1,
            "$op": { "inner.key": ["x", { "deep%": true }] },
            "plain": "value",
        });
        let encoded = encode(original.clone());
        let encoded_doc = encoded.as_document().unwrap();
        assert!(encoded_doc.contains_key("a%2Eb"));
        assert!(encoded_doc.contains_key("%24op"));
        assert_eq!(decode(encoded), original);
    }

    #[test]
    fn test_build_update_flattens() {
        let update = build_update(&doc! { "a": 1, "b": { "c": 2 } }, &UpdateOptions::default())
            .unwrap();
        assert_eq!(update, doc! { "a": 1, "b.c": 2 });
    }

    #[test]
    fn test_build_update_encodes_segments() {
        let update = build_update(
            &doc! { "a.b": { "c$d": 3 } },
            &UpdateOptions::default(),
        )
        .unwrap();
        assert_eq!(update, doc! { "a%2Eb.c%24d": 3 });
    }

    #[test]
    fn test_build_update_arrays_are_leaves() {
        let update = build_update(
            &doc! { "list": [{ "x.y": 1 }, 2] },
            &UpdateOptions::default(),
        )
        .unwrap();
        assert_eq!(update, doc! { "list": [{ "x%2Ey": 1 }, 2] });
    }

    #[test]
    fn test_build_update_field_prefix() {
        let options = UpdateOptions {
            field: Some("meta".to_string()),
            ..Default::default()
        };
        let update = build_update(&doc! { "a": 1, "b": { "c": 2 } }, &options).unwrap();
        assert_eq!(update, doc! { "meta.a": 1, "meta.b.c": 2 });
    }

    #[test]
    fn test_build_update_filter_and_lists_conflict() {
        let keep_all = |_: &str, _: &Bson| true;
        let options = UpdateOptions {
            filter: Some(&keep_all),
            exclude: Some(HashSet::from(["a".to_string()])),
            ..Default::default()
        };
        assert!(matches!(
            build_update(&doc! { "a": 1 }, &options),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_build_update_filter() {
        let no_secrets = |path: &str, _: &Bson| !path.starts_with("secret");
        let options = UpdateOptions {
            filter: Some(&no_secrets),
            ..Default::default()
        };
        let update =
            build_update(&doc! { "a": 1, "secret": { "token": "x" } }, &options).unwrap();
        assert_eq!(update, doc! { "a": 1 });
    }

    #[test]
    fn test_build_update_include() {
        let options = UpdateOptions {
            include: Some(HashSet::from(["b.c".to_string()])),
            ..Default::default()
        };
        let update = build_update(
            &doc! { "a": 1, "b": { "c": 2, "d": 3 } },
            &options,
        )
        .unwrap();
        // top-level "a" survives; only the included dotted path does.
        assert_eq!(update, doc! { "a": 1, "b.c": 2 });
    }

    #[test]
    fn test_build_update_include_checks_every_level() {
        // "b.x" is an intermediate dotted level; without it the deeper
        // leaf is dropped even when that leaf itself is listed.
        let options = UpdateOptions {
            include: Some(HashSet::from(["b.x.y".to_string()])),
            ..Default::default()
        };
        let input = doc! { "a": 1, "b": { "x": { "y": 2 } } };
        let update = build_update(&input, &options).unwrap();
        assert_eq!(update, doc! { "a": 1 });

        let options = UpdateOptions {
            include: Some(HashSet::from(["b.x".to_string(), "b.x.y".to_string()])),
            ..Default::default()
        };
        let update = build_update(&input, &options).unwrap();
        assert_eq!(update, doc! { "a": 1, "b.x.y": 2 });
    }

    #[test]
    fn test_build_update_empty_subdocument_is_a_leaf() {
        let update = build_update(&doc! { "a": 1, "b": {} }, &UpdateOptions::default()).unwrap();
        assert_eq!(update, doc! { "a": 1, "b": {} });
    }

    #[test]
    fn test_build_update_exclude() {
        let options = UpdateOptions {
            exclude: Some(HashSet::from(["b.c".to_string()])),
            ..Default::default()
        };
        let update = build_update(
            &doc! { "a": 1, "b": { "c": 2, "d": 3 } },
            &options,
        )
        .unwrap();
        assert_eq!(update, doc! { "a": 1, "b.d": 3 });
    }

    #[test]
    fn test_hash_deterministic_and_distinct() {
        assert_eq!(hash("session-key"), hash("session-key"));
        assert_ne!(hash("session-key"), hash("session-key2"));
        // SHA-256 in base64: 44 characters including padding.
        assert_eq!(hash("x").len(), 44);
    }
}
