//! Text fixups applied to bulk responses before they are parsed.
//!
//! Some indexes report date values as a scalar timestamp or as a
//! `"<start>/<end>"` string. Both are rewritten into `{"gte":..,"lte":..}`
//! range objects so every consumer sees one shape.

use regex::{Captures, Regex};
use std::borrow::Cow;

const TIMESTAMP: &str = r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?";

#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    scalar: Regex,
    range: Regex,
}

impl ResponseNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            scalar: Regex::new(&format!(r#""value"\s*:\s*"({ts})""#, ts = TIMESTAMP))?,
            range: Regex::new(&format!(r#""value"\s*:\s*"({ts})?/({ts})?""#, ts = TIMESTAMP))?,
        })
    }

    /// Rewrites timestamp values into range objects. Applying it to its own
    /// output changes nothing.
    pub fn normalize<'a>(&self, body: &'a str) -> Cow<'a, str> {
        let ranged = self.range.replace_all(body, |caps: &Captures| {
            let gte = caps.get(1).map(|m| m.as_str());
            let lte = caps.get(2).map(|m| m.as_str());
            if gte.is_none() && lte.is_none() {
                return caps[0].to_string();
            }
            format!(r#""value":{}"#, range_object(gte, lte))
        });

        if !self.scalar.is_match(&ranged) {
            return ranged;
        }
        let rewritten = self
            .scalar
            .replace_all(&ranged, |caps: &Captures| {
                format!(r#""value":{}"#, range_object(Some(&caps[1]), Some(&caps[1])))
            })
            .into_owned();
        Cow::Owned(rewritten)
    }
}

fn range_object(gte: Option<&str>, lte: Option<&str>) -> String {
    let bounds: Vec<String> = [("gte", gte), ("lte", lte)]
        .into_iter()
        .filter_map(|(key, bound)| bound.map(|b| format!(r#""{}":"{}""#, key, b)))
        .collect();
    format!("{{{}}}", bounds.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(body: &str) -> String {
        ResponseNormalizer::new().unwrap().normalize(body).into_owned()
    }

    #[test]
    fn test_scalar_timestamp_becomes_range() {
        assert_eq!(
            normalize(r#"{"dates":[{"value":"2020-01-31T10:00:00Z"}]}"#),
            r#"{"dates":[{"value":{"gte":"2020-01-31T10:00:00Z","lte":"2020-01-31T10:00:00Z"}}]}"#
        );
    }

    #[test]
    fn test_slash_range_becomes_range() {
        assert_eq!(
            normalize(r#"{"value": "2019-01-01/2020-12-31"}"#),
            r#"{"value":{"gte":"2019-01-01","lte":"2020-12-31"}}"#
        );
    }

    #[test]
    fn test_empty_bounds_are_omitted() {
        assert_eq!(normalize(r#"{"value":"2019-01-01/"}"#), r#"{"value":{"gte":"2019-01-01"}}"#);
        assert_eq!(normalize(r#"{"value":"/2020-12-31"}"#), r#"{"value":{"lte":"2020-12-31"}}"#);
        assert_eq!(normalize(r#"{"value":"/"}"#), r#"{"value":"/"}"#);
    }

    #[test]
    fn test_other_values_are_untouched() {
        let body = r#"{"value":"not a date","took":3,"value2":"2020-01-01"}"#;
        assert_eq!(normalize(body), body);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let body = r#"{"a":{"value":"2020-01-01"},"b":{"value":"2019-01-01/2020-01-01"}}"#;
        let once = normalize(body);
        assert_eq!(normalize(&once), once);
    }
}
