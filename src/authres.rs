use serde::{Deserialize, Serialize};

/// One method entry destined for the Authentication-Results header,
/// e.g. `dkim=pass (1024-bit rsa key) header.d=example.com`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub method: String,
    pub result: String,
    pub comment: Option<String>,
    pub props: Vec<(String, String)>,
}

impl Fragment {
    pub fn new(method: &str, result: &str) -> Self {
        Fragment {
            method: method.to_string(),
            result: result.to_string(),
            comment: None,
            props: Vec::new(),
        }
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn prop(mut self, key: &str, value: impl Into<String>) -> Self {
        self.props.push((key.to_string(), value.into()));
        self
    }

    /// Render this fragment as a single `method=result [comment] key=value ...`
    /// entry. Interior whitespace in values is collapsed so the header stays
    /// parseable.
    pub fn render_entry(&self) -> String {
        let mut out = format!("{}={}", normalize(&self.method), normalize(&self.result));
        if let Some(comment) = &self.comment {
            out.push_str(" (");
            out.push_str(comment.trim());
            out.push(')');
        }
        for (key, value) in &self.props {
            out.push(' ');
            out.push_str(&normalize(key));
            out.push('=');
            out.push_str(&normalize(value));
        }
        out
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Concatenate fragments into the value of a single Authentication-Results
/// header. Deterministic: the same fragment list yields byte-identical
/// output. An empty list yields `<server-id>; none`.
pub fn assemble(server_id: &str, fragments: &[Fragment]) -> String {
    if fragments.is_empty() {
        return format!("{server_id}; none");
    }
    let entries: Vec<String> = fragments.iter().map(Fragment::render_entry).collect();
    format!("{server_id}; {}", entries.join(";\n\t"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_empty() {
        assert_eq!(assemble("mx.example.com", &[]), "mx.example.com; none");
    }

    #[test]
    fn test_assemble_single_method() {
        let frag = Fragment::new("spf", "pass").prop("smtp.mailfrom", "user@example.com");
        assert_eq!(
            assemble("mx.example.com", &[frag]),
            "mx.example.com; spf=pass smtp.mailfrom=user@example.com"
        );
    }

    #[test]
    fn test_comment_precedes_properties() {
        let frag = Fragment::new("dkim", "pass")
            .comment("2048-bit rsa key")
            .prop("header.d", "example.com")
            .prop("header.b", "AbCdEfGh");
        assert_eq!(
            frag.render_entry(),
            "dkim=pass (2048-bit rsa key) header.d=example.com header.b=AbCdEfGh"
        );
    }

    #[test]
    fn test_multiple_signatures_repeat_method() {
        let frags = vec![
            Fragment::new("dkim", "pass").prop("header.d", "example.com"),
            Fragment::new("dkim", "fail").prop("header.d", "example.org"),
        ];
        let header = assemble("mx", &frags);
        assert_eq!(
            header,
            "mx; dkim=pass header.d=example.com;\n\tdkim=fail header.d=example.org"
        );
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let frag = Fragment::new("spf", "pass").prop("smtp.helo", "mx\t .example.\ncom");
        assert_eq!(frag.render_entry(), "spf=pass smtp.helo=mx .example. com");
        let frag = Fragment::new(" spf ", "pass");
        assert_eq!(frag.render_entry(), "spf=pass");
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let frags = vec![
            Fragment::new("iprev", "pass").comment("mail.example.com"),
            Fragment::new("spf", "neutral"),
        ];
        let a = assemble("gw.example.net", &frags);
        let b = assemble("gw.example.net", &frags);
        assert_eq!(a, b);
    }
}
