//! HTTP header map with lower-cased names.
//!
//! Names are normalized to ASCII lowercase on the way in, so lookups, the wire
//! output and anything handed to validators all see one spelling per header.

use std::fmt;

/// An order-preserving, multi-value HTTP header map.
///
/// [`append`](Self::append) keeps earlier values for the same name (RFC 9110 §5.3);
/// [`set`](Self::set) replaces them, which is what responses need when a handler's
/// headers are copied over middleware-provided ones.
///
/// # Examples
///
/// ```
/// use rttp_kernel::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.append("Content-Type", "text/html; charset=utf-8");
/// headers.append("X-Custom", "first");
/// headers.append("X-Custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// let all: Vec<_> = headers.get_all("X-CUSTOM").collect();
/// assert_eq!(all, vec!["first", "second"]);
/// assert!(headers.iter().all(|(name, _)| name == name.to_ascii_lowercase()));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    // Entries stored under `name`. Stored names are already lower-case.
    fn named<'s, 'n>(
        &'s self,
        name: &'n str,
    ) -> impl Iterator<Item = &'s (String, String)> + use<'s, 'n> {
        self.entries
            .iter()
            .filter(move |(stored, _)| stored.eq_ignore_ascii_case(name))
    }

    /// Add a value, keeping any already stored under the same name.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        self.entries.push((name, value.into()));
    }

    /// Replace every value stored under `name` with `value`.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        self.entries.retain(|(stored, _)| *stored != name);
        self.entries.push((name, value.into()));
    }

    /// First value stored under `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.named(name).next().map(|(_, value)| value.as_str())
    }

    /// Every value stored under `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.named(name).map(|(_, value)| value.as_str())
    }

    /// Drop `name` entirely. `false` when it was absent.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(stored, _)| !stored.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named(name).next().is_some()
    }

    /// Number of entries; a repeated name counts once per value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// JSON view used by header validators: single values become strings,
    /// repeated names become arrays.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.entries {
            match map.get_mut(name) {
                Some(serde_json::Value::Array(values)) => {
                    values.push(value.clone().into());
                }
                Some(existing) => {
                    let first = existing.take();
                    *existing = serde_json::Value::Array(vec![first, value.clone().into()]);
                }
                None => {
                    map.insert(name.clone(), value.clone().into());
                }
            }
        }
        serde_json::Value::Object(map)
    }
}

// Wire form: one `name: value` line per entry.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter()
            .try_for_each(|(name, value)| write!(f, "{name}: {value}\r\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased() {
        let mut h = Headers::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.iter().next(), Some(("content-type", "text/plain")));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn append_keeps_every_value() {
        let mut h = Headers::new();
        h.append("Set-Cookie", "a=1");
        h.append("set-cookie", "b=2");
        let vals: Vec<_> = h.get_all("Set-Cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_previous_values() {
        let mut h = Headers::new();
        h.append("X-Foo", "bar");
        h.append("X-Foo", "baz");
        h.set("x-foo", "qux");
        assert_eq!(h.get_all("x-foo").collect::<Vec<_>>(), vec!["qux"]);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn values_outlive_the_lookup_name() {
        let mut h = Headers::new();
        h.append("X-Request-Id", "abc");
        let value = {
            let name = String::from("x-request-id");
            h.get(&name)
        };
        assert_eq!(value, Some("abc"));
        assert!(h.contains(&String::from("X-REQUEST-ID")));
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.append("Authorization", "Bearer token");
        assert!(h.contains("authorization"));
        assert!(h.remove("AUTHORIZATION"));
        assert!(h.is_empty());
        assert!(!h.remove("authorization"));
    }

    #[test]
    fn json_view_groups_repeated_names() {
        let mut h = Headers::new();
        h.append("Accept", "text/html");
        h.append("X-Tag", "a");
        h.append("X-Tag", "b");
        assert_eq!(
            h.to_json(),
            serde_json::json!({"accept": "text/html", "x-tag": ["a", "b"]})
        );
    }
}
