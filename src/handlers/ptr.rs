use crate::authres::Fragment;
use crate::config::Config;
use crate::context::SessionContext;
use crate::dns::{DnsError, Resolver};
use crate::handler::{Handler, HandlerError, HandlerResult, Stage};
use std::net::IpAddr;
use std::sync::Arc;

pub fn factory(_config: &Config, resolver: Arc<Resolver>) -> anyhow::Result<Box<dyn Handler>> {
    Ok(Box::new(PtrHandler { resolver }))
}

/// The iprev/PTR check: resolves the client's reverse name at connect,
/// confirms it forward-resolves back to the client address, and compares
/// the confirmed name against the HELO argument. Informational only; the
/// verdict travels in an auxiliary X-PTR header, not in
/// Authentication-Results.
pub struct PtrHandler {
    resolver: Arc<Resolver>,
}

impl Handler for PtrHandler {
    fn name(&self) -> &'static str {
        "ptr"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Connect, Stage::Helo]
    }

    fn connect(
        &mut self,
        ctx: &mut SessionContext,
        _hostname: &str,
        ip: Option<IpAddr>,
    ) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }
        let Some(ip) = ip else {
            return Ok(());
        };

        let names = match self.resolver.reverse(ip) {
            Ok(names) => names,
            Err(DnsError::NxDomain) => Vec::new(),
            Err(err) if err.is_temporary() => {
                return Err(HandlerError::Temp(format!("reverse lookup of {ip}: {err}")));
            }
            Err(err) => {
                return Err(HandlerError::Perm(format!("reverse lookup of {ip}: {err}")));
            }
        };
        ctx.client_rdns = names.first().cloned();

        for name in names {
            match self.resolver.forward_confirms(&name, ip) {
                Ok(true) => {
                    ctx.dbg(&format!("iprev confirmed {name} for {ip}"));
                    ctx.verified_ptr = Some(name);
                    break;
                }
                Ok(false) | Err(DnsError::NxDomain) => continue,
                Err(err) if err.is_temporary() => {
                    return Err(HandlerError::Temp(format!("forward lookup of {name}: {err}")));
                }
                Err(err) => {
                    return Err(HandlerError::Perm(format!("forward lookup of {name}: {err}")));
                }
            }
        }
        Ok(())
    }

    fn helo(&mut self, ctx: &mut SessionContext, helo: &str) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }
        let lookup = ctx
            .verified_ptr
            .clone()
            .or_else(|| ctx.client_rdns.clone())
            .unwrap_or_default();
        let result = match &ctx.verified_ptr {
            Some(name) if name.eq_ignore_ascii_case(helo) => "pass",
            _ => "fail",
        };
        ctx.add_c_auth_header(
            Fragment::new("x-ptr", result)
                .prop("x-ptr-helo", helo)
                .prop("x-ptr-lookup", lookup),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> PtrHandler {
        PtrHandler {
            resolver: Arc::new(Resolver::new(None, 16).unwrap()),
        }
    }

    #[test]
    fn test_matching_helo_passes() {
        let mut ctx = SessionContext::new();
        ctx.verified_ptr = Some("mx.example.com".to_string());
        handler().helo(&mut ctx, "mx.example.com").unwrap();

        let headers = ctx.extra_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "X-PTR");
        assert_eq!(
            headers[0].1,
            "x-ptr=pass x-ptr-helo=mx.example.com x-ptr-lookup=mx.example.com"
        );
    }

    #[test]
    fn test_mismatched_helo_fails() {
        let mut ctx = SessionContext::new();
        ctx.verified_ptr = Some("other.example.org".to_string());
        handler().helo(&mut ctx, "mx.example.com").unwrap();

        assert_eq!(
            ctx.extra_headers()[0].1,
            "x-ptr=fail x-ptr-helo=mx.example.com x-ptr-lookup=other.example.org"
        );
    }

    #[test]
    fn test_comparison_is_case_insensitive() {
        let mut ctx = SessionContext::new();
        ctx.verified_ptr = Some("MX.Example.COM".to_string());
        handler().helo(&mut ctx, "mx.example.com").unwrap();
        assert!(ctx.extra_headers()[0].1.starts_with("x-ptr=pass "));
    }

    #[test]
    fn test_trusted_client_emits_nothing() {
        let mut ctx = SessionContext::new();
        ctx.is_trusted_ip_address = true;
        ctx.verified_ptr = Some("mx.example.com".to_string());
        handler().helo(&mut ctx, "mx.example.com").unwrap();
        assert!(ctx.extra_headers().is_empty());
    }

    #[test]
    fn test_unverified_client_fails_with_rdns_as_lookup() {
        let mut ctx = SessionContext::new();
        ctx.client_rdns = Some("dsl-pool.example.net".to_string());
        handler().helo(&mut ctx, "mx.example.com").unwrap();
        assert_eq!(
            ctx.extra_headers()[0].1,
            "x-ptr=fail x-ptr-helo=mx.example.com x-ptr-lookup=dsl-pool.example.net"
        );
    }
}
