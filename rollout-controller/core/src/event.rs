use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An image-publication event.
///
/// The wire form is exactly `{"image":"<registry>/<path>","tags":["<tag>",...]}`.
/// `image` is a repository reference without tag or digest; `tags` is the
/// ordered list of tags the CI run published. Any other key is rejected at
/// parse time, so both halves of the system agree on the contract byte for
/// byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub image: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("tags[{0}] is empty")]
    EmptyTag(usize),

    #[error("image {image:?} does not start with allowed prefix {prefix:?}")]
    PrefixMismatch { image: String, prefix: String },

    #[error("image {0:?} is not a valid container image reference")]
    InvalidImage(String),
}

impl Event {
    /// Parses `bytes` as a strict event envelope and validates every field.
    ///
    /// Unknown keys, trailing content after the JSON value, and wrong-typed
    /// fields are all rejected. Error messages are safe to echo back to HTTP
    /// clients.
    pub fn parse_and_validate(bytes: &[u8], allowed_prefix: &str) -> Result<Self, EventError> {
        let mut de = serde_json::Deserializer::from_slice(bytes);
        let value = serde_json::Value::deserialize(&mut de)
            .map_err(|e| EventError::InvalidJson(e.to_string()))?;
        de.end()
            .map_err(|e| EventError::InvalidJson(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| EventError::InvalidJson("expected a JSON object".to_string()))?;
        for key in obj.keys() {
            if key != "image" && key != "tags" {
                return Err(EventError::UnknownField(key.clone()));
            }
        }
        if !obj.contains_key("image") {
            return Err(EventError::MissingField("image"));
        }
        if !obj.contains_key("tags") {
            return Err(EventError::MissingField("tags"));
        }

        let event: Event =
            serde_json::from_value(value).map_err(|e| EventError::InvalidJson(e.to_string()))?;
        event.validate(allowed_prefix)?;
        Ok(event)
    }

    /// Field checks on an already-parsed event.
    pub fn validate(&self, allowed_prefix: &str) -> Result<(), EventError> {
        if self.image.is_empty() {
            return Err(EventError::MissingField("image"));
        }
        if self.tags.is_empty() {
            return Err(EventError::MissingField("tags"));
        }
        for (i, tag) in self.tags.iter().enumerate() {
            if tag.is_empty() {
                return Err(EventError::EmptyTag(i));
            }
        }
        if !self.image.starts_with(allowed_prefix) {
            return Err(EventError::PrefixMismatch {
                image: self.image.clone(),
                prefix: allowed_prefix.to_string(),
            });
        }
        if !self.image.contains('/') {
            return Err(EventError::InvalidImage(self.image.clone()));
        }
        Ok(())
    }

    /// The fully-qualified `image:tag` references, one per tag in declared
    /// order. Duplicate tags produce duplicate references; deduplication
    /// happens at match aggregation.
    pub fn image_refs(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{}", self.image, tag))
            .collect()
    }

    /// Serializes to the canonical wire form: `image` then `tags`, no
    /// whitespace, tag order preserved.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "ghcr.io/acme/";

    fn parse(json: &str) -> Result<Event, EventError> {
        Event::parse_and_validate(json.as_bytes(), PREFIX)
    }

    #[test]
    fn accepts_valid_envelope() {
        let event = parse(r#"{"image":"ghcr.io/acme/svc","tags":["dev","v1.2.3"]}"#).unwrap();
        assert_eq!(event.image, "ghcr.io/acme/svc");
        assert_eq!(event.tags, vec!["dev", "v1.2.3"]);
    }

    #[test]
    fn rejects_missing_image() {
        assert!(matches!(
            parse(r#"{"tags":["dev"]}"#),
            Err(EventError::MissingField("image"))
        ));
        assert!(matches!(
            parse(r#"{"image":"","tags":["dev"]}"#),
            Err(EventError::MissingField("image"))
        ));
    }

    #[test]
    fn rejects_missing_or_empty_tags() {
        assert!(matches!(
            parse(r#"{"image":"ghcr.io/acme/svc"}"#),
            Err(EventError::MissingField("tags"))
        ));
        assert!(matches!(
            parse(r#"{"image":"ghcr.io/acme/svc","tags":[]}"#),
            Err(EventError::MissingField("tags"))
        ));
    }

    #[test]
    fn rejects_empty_tag_entry() {
        assert!(matches!(
            parse(r#"{"image":"ghcr.io/acme/svc","tags":["dev",""]}"#),
            Err(EventError::EmptyTag(1))
        ));
    }

    #[test]
    fn rejects_unknown_field() {
        match parse(r#"{"image":"ghcr.io/acme/svc","tags":["dev"],"extra":1}"#) {
            Err(EventError::UnknownField(key)) => assert_eq!(key, "extra"),
            other => panic!("expected unknown field error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_trailing_content() {
        assert!(matches!(
            parse(r#"{"image":"ghcr.io/acme/svc","tags":["dev"]} trailing"#),
            Err(EventError::InvalidJson(_))
        ));
    }

    #[test]
    fn rejects_wrong_typed_fields() {
        assert!(matches!(
            parse(r#"{"image":"ghcr.io/acme/svc","tags":"dev"}"#),
            Err(EventError::InvalidJson(_))
        ));
        assert!(matches!(
            parse(r#"{"image":7,"tags":["dev"]}"#),
            Err(EventError::InvalidJson(_))
        ));
        assert!(matches!(parse(r#"[1,2]"#), Err(EventError::InvalidJson(_))));
    }

    #[test]
    fn rejects_prefix_mismatch() {
        assert!(matches!(
            parse(r#"{"image":"docker.io/other/svc","tags":["dev"]}"#),
            Err(EventError::PrefixMismatch { .. })
        ));
    }

    #[test]
    fn rejects_image_without_slash() {
        let err = Event::parse_and_validate(r#"{"image":"svc","tags":["dev"]}"#.as_bytes(), "")
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidImage(_)));
    }

    #[test]
    fn image_refs_follow_tag_order() {
        let event = parse(r#"{"image":"ghcr.io/acme/svc","tags":["v1","latest","v1"]}"#).unwrap();
        assert_eq!(
            event.image_refs(),
            vec![
                "ghcr.io/acme/svc:v1",
                "ghcr.io/acme/svc:latest",
                "ghcr.io/acme/svc:v1",
            ]
        );
    }

    #[test]
    fn canonical_json_is_minimal_and_ordered() {
        let event = parse(r#"{ "image" : "ghcr.io/acme/svc", "tags" : ["b","a"] }"#).unwrap();
        assert_eq!(
            event.to_canonical_json().unwrap(),
            br#"{"image":"ghcr.io/acme/svc","tags":["b","a"]}"#.to_vec()
        );
    }

    #[test]
    fn canonical_json_round_trips() {
        let event = Event {
            image: "ghcr.io/acme/svc".to_string(),
            tags: vec!["v1".to_string(), "latest".to_string()],
        };
        let bytes = event.to_canonical_json().unwrap();
        let reparsed = Event::parse_and_validate(&bytes, PREFIX).unwrap();
        assert_eq!(reparsed, event);
    }
}
