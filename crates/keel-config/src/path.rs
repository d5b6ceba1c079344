use serde::{Deserialize, Serialize};

/// A slash-separated path into the config tree. Segments never contain
/// slashes; the empty path addresses the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(into = "String", try_from = "String")]
pub struct TopicPath(Vec<String>);

impl TopicPath {
    pub fn root() -> Self {
        TopicPath(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicPath(segments.into_iter().map(Into::into).collect())
    }

    pub fn parse(s: &str) -> Self {
        TopicPath(
            s.split('/')
                .filter(|seg| !seg.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segs = self.0.clone();
        segs.push(segment.into());
        TopicPath(segs)
    }

    /// Whether `self` is `prefix` or lies below it.
    pub fn starts_with(&self, prefix: &TopicPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    pub fn parent(&self) -> Option<TopicPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(TopicPath(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn leaf_name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl std::fmt::Display for TopicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<TopicPath> for String {
    fn from(p: TopicPath) -> String {
        p.to_string()
    }
}

impl TryFrom<String> for TopicPath {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(TopicPath::parse(&s))
    }
}

impl From<&str> for TopicPath {
    fn from(s: &str) -> Self {
        TopicPath::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_empty_segments() {
        let p = TopicPath::parse("/services//main/version/");
        assert_eq!(p.segments(), &["services", "main", "version"]);
    }

    #[test]
    fn prefix_matching() {
        let prefix = TopicPath::parse("services/main");
        assert!(TopicPath::parse("services/main/runtime/state").starts_with(&prefix));
        assert!(TopicPath::parse("services/main").starts_with(&prefix));
        assert!(!TopicPath::parse("services/mainline").starts_with(&prefix));
        assert!(TopicPath::parse("services/main").starts_with(&TopicPath::root()));
    }

    #[test]
    fn display_round_trip() {
        let p = TopicPath::parse("a/b/c");
        assert_eq!(TopicPath::parse(&p.to_string()), p);
    }

    #[test]
    fn parent_and_leaf() {
        let p = TopicPath::parse("a/b");
        assert_eq!(p.leaf_name(), Some("b"));
        assert_eq!(p.parent().unwrap(), TopicPath::parse("a"));
        assert!(TopicPath::root().parent().is_none());
    }
}
