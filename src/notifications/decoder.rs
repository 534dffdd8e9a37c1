//! Event decoder: maps an event payload to a notification.
//!
//! Routing is by the last two dot-separated segments of the payload's `topic`,
//! so both `likes.created` and `events.likes.created` decode the same way.

use serde_json::Value;

use super::{Category, Notification};
use crate::bus::publisher::TOPIC_FIELD;
use crate::bus::EventPayload;

/// Which payload fields carry the recipient and the content.
enum Fields {
    /// `user_id` and `content`.
    Content,
    /// `user_id` and `id`, for deletions.
    Id,
    /// `follower_id` and `followee_id`.
    Follow,
}

fn route(topic: &str) -> Option<(Category, Fields)> {
    let mut segments = topic.rsplit('.');
    let action = segments.next()?;
    let entity = segments.next()?;

    let route = match (entity, action) {
        ("posts", "created" | "updated") => (Category::Post, Fields::Content),
        ("posts", "deleted") => (Category::Post, Fields::Id),
        ("comments", "created" | "updated") => (Category::Comment, Fields::Content),
        ("comments", "deleted") => (Category::Comment, Fields::Id),
        ("likes", "created") => (Category::Like, Fields::Content),
        ("likes", "deleted") => (Category::Like, Fields::Id),
        ("shares", "created") => (Category::Share, Fields::Content),
        ("shares", "deleted") => (Category::Share, Fields::Id),
        ("followers", "created") => (Category::Follow, Fields::Follow),
        _ => return None,
    };
    Some(route)
}

/// String field, or "" when missing or not a string.
fn read<'a>(payload: &'a EventPayload, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Decode an event payload into an unstored, unread notification.
///
/// Never fails: missing or mistyped fields become empty strings and an
/// unrecognized topic yields `Category::Unknown`.
pub fn decode(payload: &EventPayload) -> Notification {
    let topic = read(payload, TOPIC_FIELD);

    match route(topic) {
        Some((category, Fields::Content)) => {
            Notification::new(read(payload, "user_id"), category, read(payload, "content"))
        }
        Some((category, Fields::Id)) => {
            Notification::new(read(payload, "user_id"), category, read(payload, "id"))
        }
        Some((category, Fields::Follow)) => Notification::new(
            read(payload, "follower_id"),
            category,
            read(payload, "followee_id"),
        ),
        None => Notification::new(read(payload, "user_id"), Category::Unknown, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> EventPayload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_created_uses_content() {
        let n = decode(&payload(json!({
            "topic": "likes.created",
            "user_id": "u1",
            "content": "post-123",
            "timestamp": 1,
        })));

        assert_eq!(n.user_id, "u1");
        assert_eq!(n.category, Category::Like);
        assert_eq!(n.content, "post-123");
        assert!(!n.is_read);
        assert!(n.id.is_empty());
    }

    #[test]
    fn test_decode_deleted_uses_id() {
        let n = decode(&payload(json!({
            "topic": "posts.deleted",
            "user_id": "u1",
            "id": "X",
            "content": "ignored",
        })));

        assert_eq!(n.category, Category::Post);
        assert_eq!(n.content, "X");
    }

    #[test]
    fn test_decode_follow_uses_follower_as_recipient() {
        let n = decode(&payload(json!({
            "topic": "followers.created",
            "follower_id": "A",
            "followee_id": "B",
            "user_id": "ignored",
        })));

        assert_eq!(n.user_id, "A");
        assert_eq!(n.category, Category::Follow);
        assert_eq!(n.content, "B");
    }

    #[test]
    fn test_decode_table() {
        let cases = [
            ("posts.created", Category::Post, "c"),
            ("posts.updated", Category::Post, "c"),
            ("posts.deleted", Category::Post, "i"),
            ("comments.created", Category::Comment, "c"),
            ("comments.updated", Category::Comment, "c"),
            ("comments.deleted", Category::Comment, "i"),
            ("likes.created", Category::Like, "c"),
            ("likes.deleted", Category::Like, "i"),
            ("shares.created", Category::Share, "c"),
            ("shares.deleted", Category::Share, "i"),
        ];

        for (topic, category, content) in cases {
            let n = decode(&payload(json!({
                "topic": topic,
                "user_id": "u",
                "content": "c",
                "id": "i",
            })));
            assert_eq!(n.category, category, "{topic}");
            assert_eq!(n.content, content, "{topic}");
        }
    }

    #[test]
    fn test_decode_matches_prefixed_topic() {
        let n = decode(&payload(json!({
            "topic": "events.comments.created",
            "user_id": "u1",
            "content": "nice",
        })));
        assert_eq!(n.category, Category::Comment);
        assert_eq!(n.content, "nice");
    }

    #[test]
    fn test_decode_missing_and_mistyped_fields_default_to_empty() {
        let n = decode(&payload(json!({
            "topic": "likes.created",
            "user_id": 42,
        })));
        assert_eq!(n.user_id, "");
        assert_eq!(n.content, "");
        assert_eq!(n.category, Category::Like);
    }

    #[test]
    fn test_decode_unknown_topic() {
        let n = decode(&payload(json!({"topic": "users.created", "user_id": "u1"})));
        assert_eq!(n.category, Category::Unknown);

        let n = decode(&EventPayload::new());
        assert_eq!(n.category, Category::Unknown);

        let n = decode(&payload(json!({"topic": "followers.deleted"})));
        assert_eq!(n.category, Category::Unknown);
    }
}
