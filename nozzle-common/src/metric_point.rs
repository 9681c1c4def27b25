//! # Metric points
//!
//! The unit accepted by the metrics proxy, and its line representation:
//!
//! ```text
//! "<name>" <value> <timestamp> source="<source>" "<key>"="<value>" ...
//! ```

#[derive(Clone, Debug, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub source: String,
    pub tags: Vec<(String, String)>,
}

impl MetricPoint {
    pub fn new(name: impl Into<String>, value: f64, timestamp: i64, source: &str) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            source: source.to_owned(),
            tags: Vec::new(),
        }
    }

    /// Add a point tag. Empty values are skipped, the proxy rejects them.
    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.tags.push((key.to_owned(), value));
        }
        self
    }

    pub fn tags<'a, I>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in tags {
            self = self.tag(key, value);
        }
        self
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render this point as a single newline-terminated proxy line.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "\"{}\" {} {} source=\"{}\"",
            escape(&self.name),
            self.value,
            self.timestamp,
            escape(&self.source)
        );
        for (key, value) in &self.tags {
            line.push_str(&format!(" \"{}\"=\"{}\"", escape(key), escape(value)));
        }
        line.push('\n');
        line
    }
}

/// Quote-safe rendering: backslashes and quotes are escaped, line breaks become spaces.
fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' | '\r' => escaped.push(' '),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Replace every character the proxy does not accept in a metric name with `_`.
pub fn sanitize_metric_name(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let point = MetricPoint::new("pcf.gorouter.requests.total", 1000.0, 1_700_000_000, "10.0.0.1")
            .tag("deployment", "cf")
            .tag("job", "router");

        assert_eq!(
            point.to_line(),
            "\"pcf.gorouter.requests.total\" 1000 1700000000 source=\"10.0.0.1\" \"deployment\"=\"cf\" \"job\"=\"router\"\n"
        );
    }

    #[test]
    fn test_fractional_values_keep_precision() {
        let point = MetricPoint::new("cpu", 12.5, 1, "s");
        assert!(point.to_line().starts_with("\"cpu\" 12.5 1 "));
    }

    #[test]
    fn test_quotes_are_escaped() {
        let point = MetricPoint::new("m", 1.0, 1, "s").tag("applicationName", "my \"app\"");

        assert!(point
            .to_line()
            .ends_with(" \"applicationName\"=\"my \\\"app\\\"\"\n"));
    }

    #[test]
    fn test_trailing_backslash_does_not_escape_the_quote() {
        let point = MetricPoint::new("m", 1.0, 1, "s")
            .tag("path", "C:\\dir\\")
            .tag("job", "x");

        assert!(point
            .to_line()
            .ends_with(" \"path\"=\"C:\\\\dir\\\\\" \"job\"=\"x\"\n"));
    }

    #[test]
    fn test_line_breaks_become_spaces() {
        let point = MetricPoint::new("m", 1.0, 1, "s").tag("message", "a\r\nb");

        assert!(point.to_line().ends_with(" \"message\"=\"a  b\"\n"));
    }

    #[test]
    fn test_empty_tags_are_skipped() {
        let point = MetricPoint::new("m", 1.0, 1, "s")
            .tag("index", "")
            .tags([("ip", "10.0.0.1"), ("job", "")]);

        assert_eq!(point.tags, vec![("ip".to_owned(), "10.0.0.1".to_owned())]);
        assert_eq!(point.get_tag("ip"), Some("10.0.0.1"));
        assert_eq!(point.get_tag("job"), None);
    }

    #[test]
    fn test_sanitize_metric_name() {
        assert_eq!(
            sanitize_metric_name("pcf.doppler.messages/sec total"),
            "pcf.doppler.messages_sec_total"
        );
        assert_eq!(sanitize_metric_name("ok.name-1_2"), "ok.name-1_2");
    }
}
