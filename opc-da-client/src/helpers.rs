//! Display formatting for values read through the async façade and the CLI.

use chrono::{DateTime, Local, Utc};

use crate::errors::{ItemError, friendly_hresult_hint};
use crate::provider::TagValue;
use crate::records::ItemValue;

/// Formats a source timestamp in local time, or `N/A` when the server sent
/// none.
pub fn timestamp_to_string(timestamp: Option<DateTime<Utc>>) -> String {
    timestamp.map_or_else(
        || "N/A".to_string(),
        |utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}

/// Describes a per-item failure, preferring the actionable hint when one
/// exists for the code.
pub fn item_error_to_string(error: &ItemError) -> String {
    match friendly_hresult_hint(error.code()) {
        Some(hint) => format!("{} ({hint})", error.code()),
        None => error.to_string(),
    }
}

/// Builds the display row for one item of a read.
pub fn tag_value(tag_id: &str, outcome: Result<&ItemValue, &ItemError>) -> TagValue {
    match outcome {
        Ok(value) => TagValue {
            tag_id: tag_id.to_string(),
            value: value.value.to_string(),
            quality: value.quality.label(),
            timestamp: timestamp_to_string(value.timestamp),
        },
        Err(error) => TagValue {
            tag_id: tag_id.to_string(),
            value: "Error".to_string(),
            quality: format!("Bad: {}", item_error_to_string(error)),
            timestamp: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::StatusCode;
    use crate::records::{ItemHandle, Quality};
    use crate::variant::Value;

    #[test]
    fn test_timestamp_to_string_none() {
        assert_eq!(timestamp_to_string(None), "N/A");
    }

    #[test]
    fn test_timestamp_to_string_formats_local_time() {
        let utc = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let expected = utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
        assert_eq!(timestamp_to_string(Some(utc)), expected);
    }

    #[test]
    fn test_item_error_uses_hint() {
        let text = item_error_to_string(&ItemError::from_code(StatusCode::OPC_E_BADRIGHTS));
        assert!(text.starts_with("0xC0040006"), "{text}");
        assert!(text.contains("read-only"), "{text}");
    }

    #[test]
    fn test_tag_value_good_and_failed() {
        let value = ItemValue {
            client_handle: ItemHandle(1),
            value: Value::I32(42),
            quality: Quality::GOOD,
            timestamp: None,
        };
        let row = tag_value("X.Y", Ok(&value));
        assert_eq!(row.value, "42");
        assert_eq!(row.quality, "Good");
        assert_eq!(row.timestamp, "N/A");

        let error = ItemError::from_code(StatusCode::OPC_E_UNKNOWNITEMID);
        let row = tag_value("Nope", Err(&error));
        assert_eq!(row.value, "Error");
        assert!(row.quality.starts_with("Bad: "));
    }
}
