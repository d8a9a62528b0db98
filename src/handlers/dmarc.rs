use crate::authres::Fragment;
use crate::config::Config;
use crate::context::SessionContext;
use crate::dns::{DnsError, QueryType, Resolver};
use crate::handler::{Handler, HandlerResult, Stage};
use std::collections::HashMap;
use std::sync::Arc;

pub fn factory(_config: &Config, resolver: Arc<Resolver>) -> anyhow::Result<Box<dyn Handler>> {
    Ok(Box::new(DmarcHandler { resolver }))
}

/// Domain-based message authentication policy.
///
/// Reads the SPF and DKIM fragments its peers already appended to the
/// shared context (hence the eom ordering dependency on both), aligns
/// them against the From domain, and applies the published `_dmarc`
/// policy to the disposition.
pub struct DmarcHandler {
    resolver: Arc<Resolver>,
}

#[derive(Default)]
struct DmarcState {
    from_domain: Option<String>,
}

#[derive(Debug, PartialEq)]
enum PolicyAction {
    None,
    Quarantine,
    Reject,
}

struct Policy {
    action: PolicyAction,
    adkim_strict: bool,
    aspf_strict: bool,
}

impl Handler for DmarcHandler {
    fn name(&self) -> &'static str {
        "dmarc"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::EnvFrom, Stage::Header, Stage::Eom]
    }

    fn requires_before(&self, stage: Stage) -> &'static [&'static str] {
        if stage == Stage::Eom {
            &["dkim", "spf"]
        } else {
            &[]
        }
    }

    fn envfrom(&mut self, ctx: &mut SessionContext, _from: &str) -> HandlerResult {
        *ctx.handler_state_mut::<DmarcState>("dmarc") = DmarcState::default();
        Ok(())
    }

    fn header(&mut self, ctx: &mut SessionContext, name: &str, value: &str) -> HandlerResult {
        if name.eq_ignore_ascii_case("from") {
            let state = ctx.handler_state_mut::<DmarcState>("dmarc");
            if state.from_domain.is_none() {
                state.from_domain = super::dkim::address_domain(value);
            }
        }
        Ok(())
    }

    fn eom(&mut self, ctx: &mut SessionContext) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }
        let Some(domain) = ctx
            .handler_state::<DmarcState>("dmarc")
            .and_then(|s| s.from_domain.clone())
        else {
            ctx.add_auth_header(
                Fragment::new("dmarc", "permerror").comment("no From domain"),
            );
            return Ok(());
        };

        let policy = match self.fetch_policy(&domain) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                ctx.add_auth_header(
                    Fragment::new("dmarc", "none")
                        .comment("no policy")
                        .prop("header.from", domain),
                );
                return Ok(());
            }
            Err(err) => {
                ctx.add_auth_header(
                    Fragment::new("dmarc", "temperror")
                        .comment(err.to_string())
                        .prop("header.from", domain),
                );
                return Ok(());
            }
        };

        let aligned = aligned_pass(ctx, &domain, &policy);
        let result = if aligned { "pass" } else { "fail" };
        let action_label = match policy.action {
            PolicyAction::None => "none",
            PolicyAction::Quarantine => "quarantine",
            PolicyAction::Reject => "reject",
        };
        ctx.add_auth_header(
            Fragment::new("dmarc", result)
                .comment(format!("p={action_label}"))
                .prop("header.from", domain.clone()),
        );

        if !aligned {
            match policy.action {
                PolicyAction::Reject => {
                    ctx.set_reject(&format!("DMARC policy reject for {domain}"));
                }
                PolicyAction::Quarantine => {
                    ctx.set_quarantine(&format!("DMARC policy quarantine for {domain}"));
                }
                PolicyAction::None => {}
            }
        }
        Ok(())
    }
}

impl DmarcHandler {
    fn fetch_policy(&self, domain: &str) -> Result<Option<Policy>, DnsError> {
        let qname = format!("_dmarc.{domain}");
        let records = match self.resolver.lookup(&qname, QueryType::Txt) {
            Ok(records) => records,
            Err(DnsError::NxDomain) => return Ok(None),
            Err(err) => return Err(err),
        };
        for record in records.iter() {
            if let Some(policy) = parse_policy(record) {
                return Ok(Some(policy));
            }
        }
        Ok(None)
    }
}

fn parse_policy(record: &str) -> Option<Policy> {
    let mut tags = HashMap::new();
    for part in record.split(';') {
        if let Some((key, value)) = part.split_once('=') {
            tags.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    if !tags.get("v").map(|v| v.eq_ignore_ascii_case("DMARC1")).unwrap_or(false) {
        return None;
    }
    let action = match tags.get("p").map(String::as_str) {
        Some("quarantine") => PolicyAction::Quarantine,
        Some("reject") => PolicyAction::Reject,
        _ => PolicyAction::None,
    };
    Some(Policy {
        action,
        adkim_strict: tags.get("adkim").map(String::as_str) == Some("s"),
        aspf_strict: tags.get("aspf").map(String::as_str) == Some("s"),
    })
}

/// Does an identifier domain align with the From domain under the given
/// mode?
fn aligned(identifier: &str, from_domain: &str, strict: bool) -> bool {
    if identifier.eq_ignore_ascii_case(from_domain) {
        return true;
    }
    if strict {
        return false;
    }
    let id = identifier.to_ascii_lowercase();
    let from = from_domain.to_ascii_lowercase();
    id.ends_with(&format!(".{from}")) || from.ends_with(&format!(".{id}"))
}

/// Scan the SPF and DKIM fragments already in the context for an aligned
/// pass.
fn aligned_pass(ctx: &SessionContext, from_domain: &str, policy: &Policy) -> bool {
    for fragment in ctx.result_fragments() {
        if fragment.result != "pass" {
            continue;
        }
        match fragment.method.as_str() {
            "spf" => {
                for (key, value) in &fragment.props {
                    let identifier = match key.as_str() {
                        "smtp.mailfrom" => value.rsplit_once('@').map(|(_, d)| d).unwrap_or(value),
                        "smtp.helo" => value.as_str(),
                        _ => continue,
                    };
                    if aligned(identifier, from_domain, policy.aspf_strict) {
                        return true;
                    }
                }
            }
            "dkim" => {
                for (key, value) in &fragment.props {
                    if key == "header.d" && aligned(value, from_domain, policy.adkim_strict) {
                        return true;
                    }
                }
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        let policy = parse_policy("v=DMARC1; p=reject; adkim=s; aspf=r").unwrap();
        assert_eq!(policy.action, PolicyAction::Reject);
        assert!(policy.adkim_strict);
        assert!(!policy.aspf_strict);

        assert!(parse_policy("v=spf1 -all").is_none());
        let relaxed = parse_policy("v=DMARC1; p=none").unwrap();
        assert_eq!(relaxed.action, PolicyAction::None);
    }

    #[test]
    fn test_alignment_modes() {
        assert!(aligned("example.com", "example.com", true));
        assert!(aligned("mail.example.com", "example.com", false));
        assert!(!aligned("mail.example.com", "example.com", true));
        assert!(!aligned("example.org", "example.com", false));
        assert!(aligned("Example.COM", "example.com", true));
    }

    #[test]
    fn test_aligned_pass_via_dkim() {
        let mut ctx = SessionContext::new();
        ctx.add_auth_header(
            Fragment::new("dkim", "pass").prop("header.d", "mail.example.com"),
        );
        let policy = parse_policy("v=DMARC1; p=reject").unwrap();
        assert!(aligned_pass(&ctx, "example.com", &policy));

        let strict = parse_policy("v=DMARC1; p=reject; adkim=s").unwrap();
        assert!(!aligned_pass(&ctx, "example.com", &strict));
    }

    #[test]
    fn test_aligned_pass_via_spf_mailfrom() {
        let mut ctx = SessionContext::new();
        ctx.add_auth_header(
            Fragment::new("spf", "pass").prop("smtp.mailfrom", "bounce@example.com"),
        );
        let policy = parse_policy("v=DMARC1; p=none").unwrap();
        assert!(aligned_pass(&ctx, "example.com", &policy));
        assert!(!aligned_pass(&ctx, "example.net", &policy));
    }

    #[test]
    fn test_failed_peers_do_not_align() {
        let mut ctx = SessionContext::new();
        ctx.add_auth_header(Fragment::new("dkim", "fail").prop("header.d", "example.com"));
        ctx.add_auth_header(
            Fragment::new("spf", "softfail").prop("smtp.mailfrom", "a@example.com"),
        );
        let policy = parse_policy("v=DMARC1; p=reject").unwrap();
        assert!(!aligned_pass(&ctx, "example.com", &policy));
    }
}
