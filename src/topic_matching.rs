//! Topic name and topic filter validation, and filter matching with `+` and `#`
use crate::constants::limits::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};

/// Matches a topic name against a topic filter
///
/// `+` matches exactly one level (an empty one included) and `#` matches the
/// parent level and everything below it. Filters starting with a wildcard do
/// not match topics starting with `$`.
///
/// # Examples
/// ```
/// # use mqtt_comms::topic_matching::matches;
/// assert!(matches("sport/tennis/player1/wimbledon", "sport/+/player1/#"));
/// assert!(matches("sport", "sport/#"));
/// assert!(!matches("sport/tennis/player2", "sport/+/player1/#"));
/// ```
#[must_use]
pub fn matches(topic: &str, filter: &str) -> bool {
    if !is_valid_topic_name(topic) || !is_valid_topic_filter(filter) {
        return false;
    }
    if topic == filter {
        return true;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

/// A topic name used in PUBLISH: non-empty, no wildcards, no NUL
#[must_use]
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= usize::from(MAX_STRING_LENGTH)
        && !topic.contains(['+', '#', '\0'])
}

/// A subscription filter: `#` only as the whole last level, `+` only as a
/// whole level
#[must_use]
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > usize::from(MAX_STRING_LENGTH) || filter.contains('\0')
    {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| {
        if level.contains('#') {
            *level == "#" && i == last
        } else {
            !level.contains('+') || *level == "+"
        }
    })
}

/// # Errors
///
/// Returns `InvalidTopicName` if the topic is empty, too long or contains a
/// wildcard or NUL
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if is_valid_topic_name(topic) {
        Ok(())
    } else {
        Err(MqttError::InvalidTopicName(topic.to_string()))
    }
}

/// # Errors
///
/// Returns `InvalidTopicFilter` if the filter misplaces a wildcard
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if is_valid_topic_filter(filter) {
        Ok(())
    } else {
        Err(MqttError::InvalidTopicFilter(filter.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_topics() {
        let cases = [
            ("sport/tennis/player1/#", "sport/tennis/player1"),
            ("sport/tennis/player1/#", "sport/tennis/player1/ranking"),
            ("sport/tennis/player1/#", "sport/tennis/player1/score/wimbledon"),
            ("sport/#", "sport"),
            ("#", "sport/tennis/player1"),
            ("sport/tennis/player1/#", "sport/tennis/player1//wimbledon"),
            ("sport/+/player1/#", "sport/tennis/player1/wimbledon"),
            ("sport/+/player1/#", "sport/soccer/player1/UEFA"),
            ("+/+", "sport/hockey"),
            ("/+", "/sport"),
            ("+/+", "/sport"),
            ("sport/+", "sport/"),
        ];
        for (filter, topic) in cases {
            assert!(matches(topic, filter), "{filter} should match {topic}");
        }
    }

    #[test]
    fn test_non_matching_topics() {
        let cases = [
            ("sport/+/player1/#", "sport/tennis/player2"),
            ("sport/tennis/player1/#", "sport/tennis/player2"),
            ("sport1/#", "sport2"),
            ("sport/tennis1/player/#", "sport/tennis2/player"),
            ("sport//tennis/player1/#", "sport/tennis/player1//wimbledon"),
            ("+/+", "a/b/c"),
            ("+", "/sport"),
            ("sport/+", "sport"),
        ];
        for (filter, topic) in cases {
            assert!(!matches(topic, filter), "{filter} should not match {topic}");
        }
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("$SYS/broker/load", "#"));
        assert!(!matches("$SYS/broker/load", "+/broker/load"));
        assert!(matches("$SYS/broker/load", "$SYS/#"));
    }

    #[test]
    fn test_invalid_filters() {
        for filter in [
            "sport/tennis#",
            "sport/tennis/#/ranking",
            "sport+",
            "sport/+aa",
            "sport/#/ball/+/aa",
            "",
        ] {
            assert!(!is_valid_topic_filter(filter), "{filter} should be invalid");
            assert!(matches!(
                validate_topic_filter(filter),
                Err(MqttError::InvalidTopicFilter(_))
            ));
        }
        for filter in ["#", "+", "+/+", "/#", "sport/+/player1/#", "a//b"] {
            assert!(is_valid_topic_filter(filter), "{filter} should be valid");
        }
    }

    #[test]
    fn test_topic_names() {
        assert!(is_valid_topic_name("sport/tennis"));
        assert!(is_valid_topic_name("/"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("sport/+"));
        assert!(!is_valid_topic_name("sport/#"));
        assert!(!is_valid_topic_name("bad\0topic"));
        assert!(matches!(
            validate_topic_name("a/#"),
            Err(MqttError::InvalidTopicName(_))
        ));
    }
}
