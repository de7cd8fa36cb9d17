//! Topic filter matching and validation
//!
//! Filters follow MQTT wildcard rules: `+` matches exactly one level,
//! `#` matches the level it sits on plus everything below it and is only
//! legal as the final level. Shared subscriptions (`$share/<name>/<filter>`)
//! match as if the prefix were absent.

const SHARE_PREFIX: &str = "$share/";

/// Characters that may never appear in a topic used for publishing
const FORBIDDEN_PUBLISH_CHARS: [char; 9] =
    ['+', '#', '\u{8}', '\u{c}', '\n', '\r', '\t', '\u{b}', '\0'];

/// Strip a `$share/<name>/` prefix, returning the filter the broker matches on.
///
/// The share name must be non-empty and free of `/`, `+` and `#`; anything
/// else is returned unchanged.
pub fn strip_shared_prefix(filter: &str) -> &str {
    let Some(rest) = filter.strip_prefix(SHARE_PREFIX) else {
        return filter;
    };
    match rest.split_once('/') {
        Some((name, inner))
            if !name.is_empty() && !name.contains('+') && !name.contains('#') =>
        {
            inner
        }
        _ => filter,
    }
}

/// Returns true when `topic` is delivered to a subscription on `filter`.
///
/// Never fails: malformed filters simply do not match.
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter == "#" {
        return true;
    }
    let filter = strip_shared_prefix(filter);

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(level) = filter_levels.next() {
        if level == "#" {
            return filter_levels.peek().is_none();
        }
        match topic_levels.next() {
            None => return false,
            Some(topic_level) => {
                if level == "+" {
                    if topic_level.is_empty() {
                        return false;
                    }
                } else if level != topic_level {
                    return false;
                }
            }
        }
    }

    topic_levels.next().is_none()
}

/// Validate a subscription filter.
///
/// Accepts exactly `#`, or `/`-separated levels where every level is `+` or a
/// literal free of wildcards, and the last level may additionally be `#`.
pub fn is_valid_subscription_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    if filter == "#" {
        return true;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(index, level)| {
        *level == "+"
            || (index == last && *level == "#")
            || (!level.contains('+') && !level.contains('#'))
    })
}

/// Validate a topic used for publishing: non-empty, no wildcards and no
/// control characters.
pub fn is_valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(FORBIDDEN_PUBLISH_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_alone_matches_everything() {
        assert!(matches("#", "a"));
        assert!(matches("#", "a/b/c"));
        assert!(matches("#", ""));
    }

    #[test]
    fn test_plus_matches_single_level() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/x/c"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(!matches("a/+", "a/"));
    }

    #[test]
    fn test_trailing_hash_matches_parent_and_children() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c"));
        assert!(!matches("a/#", "ab"));
        assert!(!matches("a/#", "b/a"));
    }

    #[test]
    fn test_hash_not_last_never_matches() {
        assert!(!matches("a/#/c", "a/b/c"));
        assert!(!matches("a/#/c", "a/#/c"));
    }

    #[test]
    fn test_shared_subscription_prefix_is_transparent() {
        assert!(matches("$share/group/sensors/+", "sensors/temp"));
        assert!(matches("$share/group/#", "anything/at/all"));
        assert!(!matches("$share/group/sensors/+", "$share/group/sensors/temp"));
        assert_eq!(strip_shared_prefix("$share//x"), "$share//x");
        assert_eq!(strip_shared_prefix("$share/g+/x"), "$share/g+/x");
    }

    #[test]
    fn test_matching_is_case_sensitive_and_exact() {
        assert!(!matches("Sensors/temp", "sensors/temp"));
        assert!(!matches("a.b", "aXb"));
        assert!(!matches("a/b", "a/b/"));
        assert!(matches("/a", "/a"));
        assert!(!matches("/a", "a"));
    }

    #[test]
    fn test_subscription_filter_validation() {
        assert!(is_valid_subscription_filter("#"));
        assert!(is_valid_subscription_filter("+"));
        assert!(is_valid_subscription_filter("a/b/c"));
        assert!(is_valid_subscription_filter("a/+/c"));
        assert!(is_valid_subscription_filter("a/+/#"));
        assert!(is_valid_subscription_filter("$share/g/a/#"));
        assert!(!is_valid_subscription_filter(""));
        assert!(!is_valid_subscription_filter("a/#/c"));
        assert!(!is_valid_subscription_filter("a/b#"));
        assert!(!is_valid_subscription_filter("a+/b"));
        assert!(!is_valid_subscription_filter("#/a"));
    }

    #[test]
    fn test_publish_topic_validation() {
        assert!(is_valid_publish_topic("out_topic"));
        assert!(is_valid_publish_topic("a/b/c"));
        assert!(!is_valid_publish_topic(""));
        assert!(!is_valid_publish_topic("a/+"));
        assert!(!is_valid_publish_topic("a/#"));
        assert!(!is_valid_publish_topic("a\nb"));
        assert!(!is_valid_publish_topic("a\0b"));
        assert!(!is_valid_publish_topic("tab\there"));
    }

    proptest! {
        #[test]
        fn literal_filter_matches_only_itself(topic in "[a-z]{1,4}(/[a-z]{1,4}){0,4}") {
            prop_assert!(matches(&topic, &topic));
            let longer = format!("{topic}/x");
            prop_assert!(!matches(&topic, &longer));
        }

        #[test]
        fn trailing_hash_matches_every_descendant(
            prefix in "[a-z]{1,4}(/[a-z]{1,4}){0,2}",
            suffix in "(/[a-z]{0,4}){0,3}",
        ) {
            let filter = format!("{prefix}/#");
            let topic = format!("{prefix}{suffix}");
            prop_assert!(matches(&filter, &topic));
        }

        #[test]
        fn plus_replaces_any_single_level(levels in proptest::collection::vec("[a-z0-9]{1,5}", 1..5), index in 0usize..5) {
            let index = index % levels.len();
            let topic = levels.join("/");
            let mut filter_levels = levels.clone();
            filter_levels[index] = "+".to_string();
            prop_assert!(matches(&filter_levels.join("/"), &topic));
        }

        #[test]
        fn shared_prefix_never_changes_the_result(
            name in "[a-z]{1,6}",
            filter in "[a-z+]{1,3}(/[a-z+]{1,3}){0,3}",
            topic in "[a-z]{1,3}(/[a-z]{1,3}){0,3}",
        ) {
            let shared = format!("$share/{name}/{filter}");
            prop_assert_eq!(matches(&shared, &topic), matches(&filter, &topic));
        }

        #[test]
        fn valid_publish_topics_contain_no_wildcards(topic in "\\PC{1,20}") {
            if is_valid_publish_topic(&topic) {
                prop_assert!(!topic.contains('+') && !topic.contains('#'));
            }
        }
    }
}
