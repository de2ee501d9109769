//! Versioned and revision properties

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property value
pub type PropertyValue = String;

/// Properties attached to a node or a revision.
///
/// Kept sorted so that serialized node records are deterministic and two
/// nodes with the same properties share a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Set when `value` is present, delete otherwise. Returns whether the set changed.
    pub fn apply(&mut self, name: &str, value: Option<&str>) -> bool {
        match value {
            Some(v) => self.properties.insert(name.to_string(), v.to_string()).as_deref() != Some(v),
            None => self.properties.remove(name).is_some(),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter()
    }
}

impl FromIterator<(String, PropertyValue)> for PropertySet {
    fn from_iter<T: IntoIterator<Item = (String, PropertyValue)>>(iter: T) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}

/// SVN standard properties
pub mod svn_props {
    pub const EXECUTABLE: &str = "svn:executable";
    pub const MIME_TYPE: &str = "svn:mime-type";
    pub const IGNORE: &str = "svn:ignore";
    pub const EOL_STYLE: &str = "svn:eol-style";
    pub const KEYWORDS: &str = "svn:keywords";
    pub const NEEDS_LOCK: &str = "svn:needs-lock";
    pub const SPECIAL: &str = "svn:special";
    pub const EXTERNALS: &str = "svn:externals";
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    /// Value for svn:executable
    pub const EXECUTABLE_VALUE: &str = "*";

    /// Revision author
    pub const AUTHOR: &str = "svn:author";
    /// Commit time, RFC 3339 UTC with microseconds
    pub const DATE: &str = "svn:date";
    /// Log message
    pub const LOG: &str = "svn:log";

    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }
}

/// Format a commit time the way `svn:date` stores it
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_property_set_basic_operations() {
        let mut prop_set = PropertySet::new();
        assert!(prop_set.get("test").is_none());

        prop_set.set("test", "value");
        assert_eq!(prop_set.get("test").map(String::as_str), Some("value"));
        assert!(prop_set.contains("test"));

        assert_eq!(prop_set.remove("test"), Some("value".to_string()));
        assert!(prop_set.is_empty());
    }

    #[test]
    fn test_apply_reports_changes() {
        let mut props = PropertySet::new();
        assert!(props.apply("svn:eol-style", Some("native")));
        assert!(!props.apply("svn:eol-style", Some("native")));
        assert!(props.apply("svn:eol-style", Some("LF")));
        assert!(props.apply("svn:eol-style", None));
        assert!(!props.apply("svn:eol-style", None));
    }

    #[test]
    fn test_list_is_sorted() {
        let props: PropertySet = [
            ("zeta".to_string(), "1".to_string()),
            ("alpha".to_string(), "2".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(props.list(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_empty_property_value() {
        let mut prop_set = PropertySet::new();
        prop_set.set("empty", "");
        assert_eq!(prop_set.get("empty").map(String::as_str), Some(""));
    }

    #[test]
    fn test_svn_standard_properties() {
        use svn_props::*;
        assert!(is_svn_property(AUTHOR));
        assert!(is_svn_property(MIME_TYPE));
        assert!(!is_svn_property("custom:myprop"));
        assert_eq!(EXECUTABLE_VALUE, "*");
    }

    #[test]
    fn test_date_format() {
        let date = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let text = format_date(&date);
        assert_eq!(text, "2024-03-09T14:05:07.000000Z");
        assert_eq!(parse_date(&text), Some(date));
        assert_eq!(parse_date("yesterday"), None);
    }
}
