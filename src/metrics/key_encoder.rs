//! Key encoding for label sets
//!
//! Encodes a label set into the string key stored in a dictionary entry,
//! and decodes stored keys back into label sets when aggregating.
//!
//! Key format: `name1=value1&name2=value2`, each name and value
//! form-urlencoded, labels in name order.
//!
//! Examples:
//! - `code=200&path=%2Fapi` (`{path: "/api", code: "200"}`)
//! - `le=%2BInf` (histogram bucket `+Inf`)
//! - `` (empty label set)

use url::form_urlencoded;

use super::types::LabelSet;

/// Encodes and decodes label set keys
pub struct LabelKeyEncoder;

impl LabelKeyEncoder {
    /// Encode a label set into its storage key
    pub fn encode(labels: &LabelSet) -> String {
        let mut key = String::new();
        for (name, value) in labels.iter() {
            if !key.is_empty() {
                key.push('&');
            }
            key.extend(form_urlencoded::byte_serialize(name.as_bytes()));
            key.push('=');
            key.extend(form_urlencoded::byte_serialize(value.as_bytes()));
        }
        key
    }

    /// Decode a storage key back into a label set.
    ///
    /// Keys written in any label order decode to the same set. When a name
    /// repeats, the first occurrence wins.
    pub fn decode(key: &str) -> LabelSet {
        let mut labels = LabelSet::empty();
        for (name, value) in form_urlencoded::parse(key.as_bytes()) {
            if labels.get(&name).is_none() {
                labels.insert(name.into_owned(), value.into_owned());
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_encode_sorted_pairs() {
        let labels = LabelSet::from_pairs(&[("foo", "bar"), ("code", "200")]);
        assert_eq!(LabelKeyEncoder::encode(&labels), "code=200&foo=bar");
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(LabelKeyEncoder::encode(&LabelSet::empty()), "");
        assert!(LabelKeyEncoder::decode("").is_empty());
    }

    #[test]
    fn test_encode_escapes_separators() {
        let labels = LabelSet::from_pairs(&[("path", "/a?b=c&d"), ("le", "+Inf")]);
        let key = LabelKeyEncoder::encode(&labels);

        assert_eq!(key, "le=%2BInf&path=%2Fa%3Fb%3Dc%26d");
        assert_eq!(LabelKeyEncoder::decode(&key), labels);
    }

    #[test]
    fn test_space_encoded_as_plus() {
        let labels = LabelSet::from_pairs(&[("msg", "hello world")]);
        let key = LabelKeyEncoder::encode(&labels);
        assert_eq!(key, "msg=hello+world");
        assert_eq!(LabelKeyEncoder::decode(&key).get("msg"), Some("hello world"));
    }

    #[test]
    fn test_decode_unsorted_key() {
        // Keys written by a writer that did not sort its labels
        let decoded = LabelKeyEncoder::decode("foo=bar&code=200");
        assert_eq!(decoded, LabelSet::from_pairs(&[("code", "200"), ("foo", "bar")]));
    }

    #[test]
    fn test_decode_duplicate_first_wins() {
        let decoded = LabelKeyEncoder::decode("foo=bar&foo=baz");
        assert_eq!(decoded.get("foo"), Some("bar"));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_same_labels_same_key() {
        let a = LabelSet::from_pairs(&[("a", "1"), ("b", "2")]);
        let b = LabelSet::from_pairs(&[("b", "2"), ("a", "1")]);
        assert_eq!(LabelKeyEncoder::encode(&a), LabelKeyEncoder::encode(&b));
    }

    #[test]
    fn test_random_labels_survive_encoding() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let alphabet: Vec<char> = "ab =&%+/?é日\u{0}".chars().collect();

        for _ in 0..200 {
            let mut labels = LabelSet::empty();
            for _ in 0..rng.gen_range(0..5) {
                let name: String = (0..rng.gen_range(1..6))
                    .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                    .collect();
                let value: String = (0..rng.gen_range(0..8))
                    .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                    .collect();
                labels.insert(name, value);
            }

            let key = LabelKeyEncoder::encode(&labels);
            assert_eq!(LabelKeyEncoder::decode(&key), labels, "key {:?}", key);
        }
    }
}
