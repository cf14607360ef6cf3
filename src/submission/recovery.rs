use regex::Regex;

use super::bulk::BulkItemError;

/// Recognizes bulk errors caused by a single unparsable field.
#[derive(Debug, Clone)]
pub struct FieldRecovery {
    pattern: Regex,
}

impl FieldRecovery {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"failed to parse(?: field)? \[([^\]]+)\]")?,
        })
    }

    /// Top-level field named by `error` or one of its causes, if the error
    /// has the "failed to parse [<field-path>]" shape.
    pub fn offending_field(&self, error: &BulkItemError) -> Option<String> {
        error.chain().find_map(|error| {
            let caps = self.pattern.captures(&error.reason)?;
            let path = caps.get(1)?.as_str().trim();
            path.split('.')
                .next()
                .filter(|field| !field.is_empty())
                .map(str::to_string)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(reason: &str, caused_by: Option<BulkItemError>) -> BulkItemError {
        BulkItemError {
            error_type: "mapper_parsing_exception".to_string(),
            reason: reason.to_string(),
            caused_by: caused_by.map(Box::new),
        }
    }

    #[test]
    fn test_field_from_reason() {
        let recovery = FieldRecovery::new().unwrap();
        let err = error("failed to parse [publicationYear] of type [integer]", None);
        assert_eq!(recovery.offending_field(&err).as_deref(), Some("publicationYear"));

        let err = error("failed to parse field [dates.value] of type [date_range]", None);
        assert_eq!(recovery.offending_field(&err).as_deref(), Some("dates"));
    }

    #[test]
    fn test_field_from_nested_cause() {
        let recovery = FieldRecovery::new().unwrap();
        let err = error(
            "object mapping rejected",
            Some(error("failed to parse [creators.name]", None)),
        );
        assert_eq!(recovery.offending_field(&err).as_deref(), Some("creators"));
    }

    #[test]
    fn test_unrecognized_shape() {
        let recovery = FieldRecovery::new().unwrap();
        assert!(recovery.offending_field(&error("version conflict", None)).is_none());
        assert!(recovery.offending_field(&error("failed to parse []", None)).is_none());
    }
}
