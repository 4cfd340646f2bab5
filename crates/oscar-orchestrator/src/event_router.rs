//! Translates an object-store bucket-notification payload into the name of
//! the function that owns it.
//!
//! Per spec.md §4.6, only the first record is consulted (`Records[0]`); the
//! whole original notification is what gets forwarded as the invocation body
//! by the caller of [`route`], not just the object key.

use oscar_common::{function_name_from_input_bucket, BucketNotification};

/// Returns the owning function's name for `notification.Records[0]`, or
/// `None` if there are no records or the bucket name has no `-in` suffix.
pub fn route(notification: &BucketNotification) -> Option<String> {
    let bucket = &notification.records.first()?.s3.bucket.name;
    function_name_from_input_bucket(bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_maps_first_record_input_bucket_to_function_name() {
        let notification: BucketNotification = serde_json::from_value(serde_json::json!({
            "Records": [
                { "s3": { "bucket": {"name": "echo-in"}, "object": {"key": "hello.txt"} } }
            ]
        }))
        .unwrap();

        assert_eq!(route(&notification).as_deref(), Some("echo"));
    }

    #[test]
    fn route_returns_none_for_bucket_with_no_owning_function() {
        let notification: BucketNotification = serde_json::from_value(serde_json::json!({
            "Records": [
                { "s3": { "bucket": {"name": "unrelated"}, "object": {"key": "x"} } }
            ]
        }))
        .unwrap();

        assert_eq!(route(&notification), None);
    }

    #[test]
    fn route_returns_none_for_empty_records() {
        let notification: BucketNotification = serde_json::from_value(serde_json::json!({
            "Records": []
        }))
        .unwrap();

        assert_eq!(route(&notification), None);
    }
}
