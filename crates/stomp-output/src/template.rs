//! `%{field}` reference expansion for destinations and header values.

/// Expand every `%{reference}` in `template` using `lookup`.
///
/// References `lookup` cannot resolve stay in the output verbatim, so
/// `/topic/%{missing}` expands to itself. An unterminated `%{` is copied
/// through unchanged.
pub fn expand<F>(template: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let reference = &after[..end];
        match lookup(reference) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Split a reference into its field path.
///
/// `host` is a single segment; `[a][b]` names the nested field `b` inside
/// `a`. Returns `None` for malformed bracket syntax.
pub fn field_path(reference: &str) -> Option<Vec<&str>> {
    if reference.is_empty() {
        return None;
    }
    if !reference.starts_with('[') {
        return Some(vec![reference]);
    }

    let mut segments = Vec::new();
    let mut rest = reference;
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        let segment = &inner[..close];
        if segment.is_empty() {
            return None;
        }
        segments.push(segment);
        rest = &inner[close + 1..];
    }
    Some(segments)
}

/// Whether `template` contains at least one reference.
pub fn has_references(template: &str) -> bool {
    template
        .find("%{")
        .is_some_and(|start| template[start..].contains('}'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn fields() -> HashMap<&'static str, &'static str> {
        HashMap::from([("host", "web-1"), ("type", "nginx")])
    }

    fn lookup(reference: &str) -> Option<String> {
        fields().get(reference).map(|v| v.to_string())
    }

    #[test]
    fn test_expand_single_reference() {
        assert_eq!(expand("/topic/%{host}", lookup), "/topic/web-1");
    }

    #[test]
    fn test_expand_multiple_references() {
        assert_eq!(expand("/queue/%{type}.%{host}", lookup), "/queue/nginx.web-1");
    }

    #[test]
    fn test_missing_reference_is_literal() {
        assert_eq!(expand("/topic/%{nope}", lookup), "/topic/%{nope}");
        assert_eq!(expand("%{nope}-%{host}", lookup), "%{nope}-web-1");
    }

    #[test]
    fn test_unterminated_reference_is_literal() {
        assert_eq!(expand("/topic/%{host", lookup), "/topic/%{host");
        assert_eq!(expand("%{host}/%{", lookup), "web-1/%{");
    }

    #[test]
    fn test_plain_template_unchanged() {
        assert_eq!(expand("/topic/logstash", lookup), "/topic/logstash");
        assert_eq!(expand("100% sure", lookup), "100% sure");
        assert!(!has_references("/topic/logstash"));
        assert!(has_references("/topic/%{host}"));
    }

    #[test]
    fn test_field_path() {
        assert_eq!(field_path("host"), Some(vec!["host"]));
        assert_eq!(field_path("[a][b]"), Some(vec!["a", "b"]));
        assert_eq!(field_path("[a]"), Some(vec!["a"]));
        assert_eq!(field_path("[a][b"), None);
        assert_eq!(field_path("[]"), None);
        assert_eq!(field_path(""), None);
    }
}
