use crate::authres::Fragment;
use crate::config::Config;
use crate::context::SessionContext;
use crate::dns::{DnsError, QueryType, Resolver};
use crate::handler::{Handler, HandlerResult, Stage};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::sync::Arc;

/// RFC 7208 limit on DNS-requiring mechanisms per evaluation.
const MAX_DNS_MECHANISMS: usize = 10;

pub fn factory(_config: &Config, resolver: Arc<Resolver>) -> anyhow::Result<Box<dyn Handler>> {
    Ok(Box::new(SpfHandler { resolver }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfResult {
    fn as_token(self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

/// Envelope-sender policy evaluation against the domain's published
/// `v=spf1` record. Macro terms are not expanded; a term carrying one is
/// skipped rather than guessed at.
pub struct SpfHandler {
    resolver: Arc<Resolver>,
}

impl Handler for SpfHandler {
    fn name(&self) -> &'static str {
        "spf"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::EnvFrom]
    }

    fn envfrom(&mut self, ctx: &mut SessionContext, from: &str) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }
        let Some(ip) = ctx.client_ip else {
            return Ok(());
        };

        let sender = strip_angles(from);
        let helo = ctx.helo_name.clone().unwrap_or_default();
        // The null sender is evaluated against the HELO identity.
        let (domain, helo_scope) = match sender.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => (domain.to_string(), false),
            _ => (helo.clone(), true),
        };
        if domain.is_empty() {
            return Ok(());
        }

        let mut eval = Evaluator {
            resolver: &self.resolver,
            lookups: 0,
        };
        let result = eval.check(ip, &domain);
        ctx.dbg(&format!("spf {} for {domain}", result.as_token()));

        let mut fragment = Fragment::new("spf", result.as_token());
        if helo_scope {
            fragment = fragment.prop("smtp.helo", helo);
        } else {
            fragment = fragment.prop("smtp.mailfrom", sender);
        }
        ctx.add_auth_header(fragment);
        Ok(())
    }
}

pub fn strip_angles(addr: &str) -> String {
    addr.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

struct Evaluator<'a> {
    resolver: &'a Resolver,
    lookups: usize,
}

impl Evaluator<'_> {
    fn check(&mut self, ip: IpAddr, domain: &str) -> SpfResult {
        match self.fetch_record(domain) {
            Ok(Some(record)) => self.eval_record(ip, domain, &record),
            Ok(None) => SpfResult::None,
            Err(result) => result,
        }
    }

    fn fetch_record(&mut self, domain: &str) -> Result<Option<String>, SpfResult> {
        match self.resolver.lookup(domain, QueryType::Txt) {
            Ok(records) => Ok(select_spf_record(&records)?),
            Err(DnsError::NxDomain) => Ok(None),
            Err(_) => Err(SpfResult::TempError),
        }
    }

    fn eval_record(&mut self, ip: IpAddr, domain: &str, record: &str) -> SpfResult {
        let mut redirect = None;
        for term in record.split_whitespace().skip(1) {
            if let Some(target) = term.strip_prefix("redirect=") {
                redirect = Some(target.to_string());
                continue;
            }
            if term.contains('=') {
                continue; // unknown modifier
            }
            let (qualifier, mech) = split_qualifier(term);
            if mech.contains('%') {
                // Macro expansion is unsupported; never guess a match.
                log::debug!("skipping macro term \"{term}\" in SPF record for {domain}");
                continue;
            }
            match self.matches(ip, domain, mech) {
                Ok(true) => return qualifier,
                Ok(false) => continue,
                Err(result) => return result,
            }
        }

        if let Some(target) = redirect {
            if target.contains('%') {
                return SpfResult::PermError;
            }
            return match self.check(ip, &target) {
                SpfResult::None => SpfResult::PermError,
                other => other,
            };
        }
        SpfResult::Neutral
    }

    fn matches(&mut self, ip: IpAddr, domain: &str, mech: &str) -> Result<bool, SpfResult> {
        let lower = mech.to_ascii_lowercase();
        if lower == "all" {
            return Ok(true);
        }
        if let Some(arg) = lower.strip_prefix("ip4:") {
            return Ok(ipv4_matches(ip, arg)?);
        }
        if let Some(arg) = lower.strip_prefix("ip6:") {
            return Ok(ipv6_matches(ip, arg)?);
        }
        if lower == "a" || lower.starts_with("a:") || lower.starts_with("a/") {
            let (target, prefix) = parse_domain_spec(&lower[1..], domain)?;
            return self.address_matches(ip, &target, prefix);
        }
        if lower == "mx" || lower.starts_with("mx:") || lower.starts_with("mx/") {
            let (target, prefix) = parse_domain_spec(&lower[2..], domain)?;
            self.budget()?;
            let exchanges = self.answers(&target, QueryType::Mx)?;
            for exchange in exchanges.iter().take(10) {
                if self.address_matches(ip, exchange, prefix)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if let Some(target) = lower.strip_prefix("include:") {
            self.budget()?;
            return match self.check(ip, target) {
                SpfResult::Pass => Ok(true),
                SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                SpfResult::TempError => Err(SpfResult::TempError),
                SpfResult::None | SpfResult::PermError => Err(SpfResult::PermError),
            };
        }
        if let Some(target) = lower.strip_prefix("exists:") {
            self.budget()?;
            return Ok(!self.answers(target, QueryType::A)?.is_empty());
        }
        if lower == "ptr" || lower.starts_with("ptr:") {
            let target = lower.strip_prefix("ptr:").unwrap_or(domain).to_string();
            self.budget()?;
            return self.ptr_matches(ip, &target);
        }
        // Unrecognized mechanism.
        Err(SpfResult::PermError)
    }

    fn address_matches(
        &mut self,
        ip: IpAddr,
        target: &str,
        prefix: Option<u8>,
    ) -> Result<bool, SpfResult> {
        self.budget()?;
        let qtype = if ip.is_ipv4() { QueryType::A } else { QueryType::Aaaa };
        for addr in self.answers(target, qtype)?.iter() {
            let Ok(addr) = addr.parse::<IpAddr>() else {
                continue;
            };
            let matched = match prefix {
                None => addr == ip,
                Some(len) => match IpNet::new(addr, len) {
                    Ok(net) => net.trunc().contains(&ip),
                    Err(_) => return Err(SpfResult::PermError),
                },
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn ptr_matches(&mut self, ip: IpAddr, target: &str) -> Result<bool, SpfResult> {
        let names = match self.resolver.reverse(ip) {
            Ok(names) => names,
            Err(DnsError::NxDomain) => return Ok(false),
            Err(err) if err.is_temporary() => return Err(SpfResult::TempError),
            Err(_) => return Ok(false),
        };
        for name in names.iter().take(10) {
            if !in_domain(name, target) {
                continue;
            }
            match self.resolver.forward_confirms(name, ip) {
                Ok(true) => return Ok(true),
                Ok(false) | Err(DnsError::NxDomain) => continue,
                Err(err) if err.is_temporary() => return Err(SpfResult::TempError),
                Err(_) => continue,
            }
        }
        Ok(false)
    }

    fn answers(&mut self, name: &str, qtype: QueryType) -> Result<Arc<Vec<String>>, SpfResult> {
        match self.resolver.lookup(name, qtype) {
            Ok(values) => Ok(values),
            Err(DnsError::NxDomain) => Ok(Arc::new(Vec::new())),
            Err(_) => Err(SpfResult::TempError),
        }
    }

    fn budget(&mut self) -> Result<(), SpfResult> {
        self.lookups += 1;
        if self.lookups > MAX_DNS_MECHANISMS {
            return Err(SpfResult::PermError);
        }
        Ok(())
    }
}

/// Exactly one `v=spf1` record may exist; more is a permanent error.
fn select_spf_record(records: &[String]) -> Result<Option<String>, SpfResult> {
    let mut found = None;
    for record in records {
        let trimmed = record.trim();
        if trimmed.to_ascii_lowercase() == "v=spf1"
            || trimmed.to_ascii_lowercase().starts_with("v=spf1 ")
        {
            if found.is_some() {
                return Err(SpfResult::PermError);
            }
            found = Some(trimmed.to_string());
        }
    }
    Ok(found)
}

fn split_qualifier(term: &str) -> (SpfResult, &str) {
    match term.as_bytes().first() {
        Some(b'+') => (SpfResult::Pass, &term[1..]),
        Some(b'-') => (SpfResult::Fail, &term[1..]),
        Some(b'~') => (SpfResult::SoftFail, &term[1..]),
        Some(b'?') => (SpfResult::Neutral, &term[1..]),
        _ => (SpfResult::Pass, term),
    }
}

/// `[:domain][/prefix]` after an `a` or `mx` mechanism name.
fn parse_domain_spec(rest: &str, default_domain: &str) -> Result<(String, Option<u8>), SpfResult> {
    let (domain_part, prefix_part) = match rest.split_once('/') {
        Some((d, p)) => (d, Some(p)),
        None => (rest, None),
    };
    let domain = match domain_part.strip_prefix(':') {
        Some(d) if !d.is_empty() => d.to_string(),
        Some(_) => return Err(SpfResult::PermError),
        None if domain_part.is_empty() => default_domain.to_string(),
        None => return Err(SpfResult::PermError),
    };
    let prefix = match prefix_part {
        Some(p) => Some(p.parse::<u8>().map_err(|_| SpfResult::PermError)?),
        None => None,
    };
    Ok((domain, prefix))
}

fn ipv4_matches(ip: IpAddr, arg: &str) -> Result<bool, SpfResult> {
    let IpAddr::V4(ip) = ip else {
        return Ok(false);
    };
    let net = if arg.contains('/') {
        arg.parse::<Ipv4Net>().map_err(|_| SpfResult::PermError)?
    } else {
        Ipv4Net::new(arg.parse().map_err(|_| SpfResult::PermError)?, 32).unwrap()
    };
    Ok(net.trunc().contains(&ip))
}

fn ipv6_matches(ip: IpAddr, arg: &str) -> Result<bool, SpfResult> {
    let IpAddr::V6(ip) = ip else {
        return Ok(false);
    };
    let net = if arg.contains('/') {
        arg.parse::<Ipv6Net>().map_err(|_| SpfResult::PermError)?
    } else {
        Ipv6Net::new(arg.parse().map_err(|_| SpfResult::PermError)?, 128).unwrap()
    };
    Ok(net.trunc().contains(&ip))
}

fn in_domain(name: &str, domain: &str) -> bool {
    name.eq_ignore_ascii_case(domain)
        || name
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(record: &str, ip: &str) -> SpfResult {
        let resolver = Resolver::new(None, 16).unwrap();
        let mut eval = Evaluator {
            resolver: &resolver,
            lookups: 0,
        };
        eval.eval_record(ip.parse().unwrap(), "example.com", record)
    }

    #[test]
    fn test_ip4_mechanism() {
        assert_eq!(eval("v=spf1 ip4:192.0.2.0/24 -all", "192.0.2.57"), SpfResult::Pass);
        assert_eq!(eval("v=spf1 ip4:192.0.2.0/24 -all", "198.51.100.1"), SpfResult::Fail);
        assert_eq!(eval("v=spf1 ip4:192.0.2.9 -all", "192.0.2.9"), SpfResult::Pass);
    }

    #[test]
    fn test_ip6_mechanism() {
        assert_eq!(
            eval("v=spf1 ip6:2001:db8::/32 ~all", "2001:db8::beef"),
            SpfResult::Pass
        );
        assert_eq!(eval("v=spf1 ip6:2001:db8::/32 ~all", "2001:db9::1"), SpfResult::SoftFail);
        // An ip6 mechanism never matches a v4 client.
        assert_eq!(eval("v=spf1 ip6:2001:db8::/32 ?all", "192.0.2.1"), SpfResult::Neutral);
    }

    #[test]
    fn test_qualifiers() {
        assert_eq!(eval("v=spf1 -all", "192.0.2.1"), SpfResult::Fail);
        assert_eq!(eval("v=spf1 ~all", "192.0.2.1"), SpfResult::SoftFail);
        assert_eq!(eval("v=spf1 ?all", "192.0.2.1"), SpfResult::Neutral);
        assert_eq!(eval("v=spf1 +all", "192.0.2.1"), SpfResult::Pass);
        assert_eq!(eval("v=spf1 all", "192.0.2.1"), SpfResult::Pass);
    }

    #[test]
    fn test_empty_record_is_neutral() {
        assert_eq!(eval("v=spf1", "192.0.2.1"), SpfResult::Neutral);
    }

    #[test]
    fn test_macro_terms_are_skipped() {
        assert_eq!(
            eval("v=spf1 exists:%{ir}.sbl.example.org -all", "192.0.2.1"),
            SpfResult::Fail
        );
    }

    #[test]
    fn test_unknown_mechanism_is_permerror() {
        assert_eq!(eval("v=spf1 futuremech:x -all", "192.0.2.1"), SpfResult::PermError);
    }

    #[test]
    fn test_select_spf_record() {
        let records = vec![
            "google-site-verification=abc".to_string(),
            "v=spf1 -all".to_string(),
        ];
        assert_eq!(select_spf_record(&records).unwrap(), Some("v=spf1 -all".to_string()));

        let dupes = vec!["v=spf1 -all".to_string(), "v=spf1 +all".to_string()];
        assert_eq!(select_spf_record(&dupes), Err(SpfResult::PermError));

        assert_eq!(select_spf_record(&["v=spf10 x".to_string()]).unwrap(), None);
    }

    #[test]
    fn test_parse_domain_spec() {
        assert_eq!(
            parse_domain_spec("", "example.com").unwrap(),
            ("example.com".to_string(), None)
        );
        assert_eq!(
            parse_domain_spec(":mail.example.com", "example.com").unwrap(),
            ("mail.example.com".to_string(), None)
        );
        assert_eq!(
            parse_domain_spec("/24", "example.com").unwrap(),
            ("example.com".to_string(), Some(24))
        );
        assert_eq!(
            parse_domain_spec(":mx.example.com/28", "example.com").unwrap(),
            ("mx.example.com".to_string(), Some(28))
        );
        assert!(parse_domain_spec(":", "example.com").is_err());
    }

    #[test]
    fn test_strip_angles() {
        assert_eq!(strip_angles("<user@example.com>"), "user@example.com");
        assert_eq!(strip_angles("user@example.com"), "user@example.com");
        assert_eq!(strip_angles("<>"), "");
    }

    #[test]
    fn test_in_domain() {
        assert!(in_domain("mx.example.com", "example.com"));
        assert!(in_domain("example.com", "example.com"));
        assert!(!in_domain("badexample.com", "example.com"));
    }
}
