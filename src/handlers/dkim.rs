use crate::authres::Fragment;
use crate::config::Config;
use crate::context::SessionContext;
use crate::dns::{DnsError, QueryType, Resolver};
use crate::handler::{Handler, HandlerResult, Stage};
use crate::metrics;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

lazy_static! {
    static ref DKIM_SIGNATURES: IntCounterVec = register_int_counter_vec!(
        "authmilter_dkim_signatures_total",
        "DKIM signatures verified, by result",
        &["result"]
    )
    .unwrap();
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Options {
    /// 1: report `dkim=none` for unsigned mail; 2: stay silent instead.
    check_dkim: u8,
}

impl Default for Options {
    fn default() -> Self {
        Options { check_dkim: 1 }
    }
}

pub fn factory(config: &Config, resolver: Arc<Resolver>) -> anyhow::Result<Box<dyn Handler>> {
    let options = match config.handler_options("dkim") {
        Some(value) => serde_yaml::from_value(value.clone())?,
        None => Options::default(),
    };
    Ok(Box::new(DkimHandler { resolver, options }))
}

/// Streaming DKIM verifier.
///
/// Collects signature headers (including `X-Google-DKIM-Signature`, which
/// is ingested as if it were a `DKIM-Signature`) and the full header set
/// while the message streams past, accumulates the body, and verifies
/// every signature at end-of-message. One fragment per signature.
pub struct DkimHandler {
    resolver: Arc<Resolver>,
    options: Options,
}

/// Per-message accumulator kept in the context's handler slot.
#[derive(Default)]
struct DkimState {
    headers: Vec<(String, String)>,
    signatures: Vec<usize>,
    body: Vec<u8>,
    from_domain: Option<String>,
}

impl Handler for DkimHandler {
    fn name(&self) -> &'static str {
        "dkim"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::EnvFrom, Stage::Header, Stage::Eoh, Stage::Body, Stage::Eom]
    }

    fn required_after(&self, stage: Stage) -> &'static [&'static str] {
        // DMARC consumes our fragments, so it must come later at eom.
        if stage == Stage::Eom {
            &["dmarc"]
        } else {
            &[]
        }
    }

    fn register_metrics(&self) {
        lazy_static::initialize(&DKIM_SIGNATURES);
    }

    fn envfrom(&mut self, ctx: &mut SessionContext, _from: &str) -> HandlerResult {
        // Fresh accumulator per message.
        *ctx.handler_state_mut::<DkimState>("dkim") = DkimState::default();
        Ok(())
    }

    fn header(&mut self, ctx: &mut SessionContext, name: &str, value: &str) -> HandlerResult {
        let state = ctx.handler_state_mut::<DkimState>("dkim");
        let index = state.headers.len();
        state.headers.push((name.to_string(), value.to_string()));
        if name.eq_ignore_ascii_case("dkim-signature")
            || name.eq_ignore_ascii_case("x-google-dkim-signature")
        {
            state.signatures.push(index);
        }
        if name.eq_ignore_ascii_case("from") && state.from_domain.is_none() {
            state.from_domain = address_domain(value);
        }
        Ok(())
    }

    fn body(&mut self, ctx: &mut SessionContext, chunk: &[u8]) -> HandlerResult {
        ctx.handler_state_mut::<DkimState>("dkim")
            .body
            .extend_from_slice(chunk);
        Ok(())
    }

    fn eom(&mut self, ctx: &mut SessionContext) -> HandlerResult {
        let state = std::mem::take(ctx.handler_state_mut::<DkimState>("dkim"));

        let mut passed_domains = Vec::new();
        if state.signatures.is_empty() {
            if self.options.check_dkim == 1 {
                ctx.add_auth_header(Fragment::new("dkim", "none").comment("no signatures found"));
            }
        } else {
            for &index in &state.signatures {
                let (name, value) = &state.headers[index];
                let verdict = self.verify_signature(&state, name, value);
                DKIM_SIGNATURES
                    .with_label_values(&[verdict.fragment.result.as_str()])
                    .inc();
                metrics::handler_count(
                    "authmilter_dkim_signatures_total",
                    &format!("{{result=\"{}\"}}", verdict.fragment.result),
                    1,
                );
                if let Some(domain) = verdict.passed_domain {
                    passed_domains.push(domain);
                }
                ctx.add_auth_header(verdict.fragment);
            }
        }

        // Author domain signing practices are only meaningful for mail
        // arriving from outside.
        if !ctx.is_exempt() {
            if let Some(fragment) = self.adsp(&state, &passed_domains) {
                ctx.add_auth_header(fragment);
            }
        }
        Ok(())
    }
}

struct Verdict {
    fragment: Fragment,
    passed_domain: Option<String>,
}

impl DkimHandler {
    fn verify_signature(&self, state: &DkimState, header_name: &str, value: &str) -> Verdict {
        let sig = match ParsedSignature::parse(value) {
            Ok(sig) => sig,
            Err(reason) => {
                return Verdict {
                    fragment: Fragment::new("dkim", "permerror").comment(reason),
                    passed_domain: None,
                };
            }
        };

        let props = |fragment: Fragment| {
            fragment
                .prop("header.d", sig.domain.clone())
                .prop("header.i", sig.identity.clone())
                .prop("header.b", sig.b_tag_prefix())
        };

        let key = match self.fetch_key(&sig) {
            Ok(key) => key,
            Err(KeyError::Temporary(detail)) => {
                return Verdict {
                    fragment: props(Fragment::new("dkim", "temperror").comment(detail)),
                    passed_domain: None,
                };
            }
            Err(KeyError::Permanent(detail)) => {
                return Verdict {
                    fragment: props(Fragment::new("dkim", "permerror").comment(detail)),
                    passed_domain: None,
                };
            }
        };
        let bits = key.size() * 8;

        // Body hash first; a mismatch is a definitive fail.
        let canon_body = canonicalize_body(&state.body, sig.body_relaxed);
        let hashed = match sig.length {
            Some(len) => &canon_body[..canon_body.len().min(len as usize)],
            None => &canon_body[..],
        };
        let body_hash = BASE64.encode(Sha256::digest(hashed));
        if body_hash != sig.body_hash {
            return Verdict {
                fragment: props(Fragment::new("dkim", "fail").comment("body hash mismatch")),
                passed_domain: None,
            };
        }

        let signed = signed_header_data(&state.headers, header_name, value, &sig);
        let signature_bytes = match BASE64.decode(&sig.b) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Verdict {
                    fragment: props(Fragment::new("dkim", "permerror").comment("invalid b= tag")),
                    passed_domain: None,
                };
            }
        };

        let verifying_key = VerifyingKey::<Sha256>::new(key);
        let outcome = Signature::try_from(signature_bytes.as_slice())
            .map_err(|_| ())
            .and_then(|signature| verifying_key.verify(&signed, &signature).map_err(|_| ()));

        match outcome {
            Ok(()) => Verdict {
                fragment: props(
                    Fragment::new("dkim", "pass").comment(format!("{bits}-bit rsa key")),
                ),
                passed_domain: Some(sig.domain.clone()),
            },
            Err(()) => Verdict {
                fragment: props(
                    Fragment::new("dkim", "fail").comment("signature verification failed"),
                ),
                passed_domain: None,
            },
        }
    }

    fn fetch_key(&self, sig: &ParsedSignature) -> Result<RsaPublicKey, KeyError> {
        let qname = format!("{}._domainkey.{}", sig.selector, sig.domain);
        let records = match self.resolver.lookup(&qname, QueryType::Txt) {
            Ok(records) => records,
            Err(DnsError::NxDomain) => {
                return Err(KeyError::Permanent(format!("no key record at {qname}")));
            }
            Err(err) => {
                return Err(KeyError::Temporary(format!("key lookup {qname}: {err}")));
            }
        };

        let record = records
            .iter()
            .find(|r| r.contains("p="))
            .ok_or_else(|| KeyError::Permanent(format!("no key record at {qname}")))?;
        let tags = parse_tags(record);
        if let Some(k) = tags.get("k") {
            if !k.eq_ignore_ascii_case("rsa") {
                return Err(KeyError::Permanent(format!("unsupported key type {k}")));
            }
        }
        let p = tags
            .get("p")
            .map(|p| strip_ws(p))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| KeyError::Permanent("key revoked".to_string()))?;
        let der = BASE64
            .decode(&p)
            .map_err(|_| KeyError::Permanent("undecodable key data".to_string()))?;

        RsaPublicKey::from_public_key_der(&der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
            .map_err(|_| KeyError::Permanent("unparseable rsa key".to_string()))
    }

    fn adsp(&self, state: &DkimState, passed_domains: &[String]) -> Option<Fragment> {
        let domain = state.from_domain.as_deref()?;
        let aligned = passed_domains.iter().any(|d| {
            d.eq_ignore_ascii_case(domain)
                || d.to_ascii_lowercase()
                    .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
        });
        if aligned {
            return Some(Fragment::new("dkim-adsp", "pass"));
        }

        let qname = format!("_adsp._domainkey.{domain}");
        let records = match self.resolver.lookup(&qname, QueryType::Txt) {
            Ok(records) => records,
            Err(DnsError::NxDomain) => {
                return Some(Fragment::new("dkim-adsp", "none").comment("no policy"));
            }
            Err(err) if err.is_temporary() => {
                return Some(Fragment::new("dkim-adsp", "temperror").comment(err.to_string()));
            }
            Err(_) => return None,
        };
        let policy = records
            .iter()
            .map(|r| parse_tags(r))
            .find_map(|tags| tags.get("dkim").cloned())
            .unwrap_or_else(|| "unknown".to_string());
        let result = match policy.as_str() {
            "all" => "fail",
            "discardable" => "discard",
            _ => "unknown",
        };
        Some(Fragment::new("dkim-adsp", result).comment("no valid author signature"))
    }
}

enum KeyError {
    Temporary(String),
    Permanent(String),
}

#[derive(Debug)]
struct ParsedSignature {
    domain: String,
    selector: String,
    identity: String,
    b: String,
    body_hash: String,
    signed_headers: Vec<String>,
    header_relaxed: bool,
    body_relaxed: bool,
    length: Option<u64>,
}

impl ParsedSignature {
    fn parse(value: &str) -> Result<Self, String> {
        let tags = parse_tags(value);
        let get = |key: &str| {
            tags.get(key)
                .map(|v| v.to_string())
                .ok_or_else(|| format!("missing {key}= tag"))
        };

        if get("v")? != "1" {
            return Err("unsupported version".to_string());
        }
        let algorithm = get("a")?;
        if !algorithm.eq_ignore_ascii_case("rsa-sha256") {
            return Err(format!("unsupported algorithm {algorithm}"));
        }
        let domain = get("d")?.to_ascii_lowercase();
        let selector = get("s")?;
        let b = strip_ws(&get("b")?);
        let body_hash = strip_ws(&get("bh")?);
        let signed_headers: Vec<String> = get("h")?
            .split(':')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            return Err("from header not signed".to_string());
        }

        let canon = tags.get("c").map(String::as_str).unwrap_or("simple/simple");
        let (header_canon, body_canon) = match canon.split_once('/') {
            Some((h, b)) => (h, b),
            None => (canon, "simple"),
        };
        let header_relaxed = match header_canon {
            "relaxed" => true,
            "simple" => false,
            other => return Err(format!("unknown canonicalization {other}")),
        };
        let body_relaxed = match body_canon {
            "relaxed" => true,
            "simple" => false,
            other => return Err(format!("unknown canonicalization {other}")),
        };

        let identity = tags
            .get("i")
            .map(|i| strip_ws(i))
            .unwrap_or_else(|| format!("@{domain}"));
        let length = match tags.get("l") {
            Some(l) => Some(l.parse::<u64>().map_err(|_| "invalid l= tag".to_string())?),
            None => None,
        };

        Ok(ParsedSignature {
            domain,
            selector,
            identity,
            b,
            body_hash,
            signed_headers,
            header_relaxed,
            body_relaxed,
            length,
        })
    }

    /// First 8 characters of the signature data, as reported in
    /// `header.b`.
    fn b_tag_prefix(&self) -> String {
        self.b.chars().take(8).collect()
    }
}

fn parse_tags(value: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in value.split(';') {
        if let Some((key, val)) = part.split_once('=') {
            tags.insert(key.trim().to_ascii_lowercase(), val.trim().to_string());
        }
    }
    tags
}

fn strip_ws(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

pub(crate) fn address_domain(header_value: &str) -> Option<String> {
    let addr = match (header_value.rfind('<'), header_value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &header_value[start + 1..end],
        _ => header_value.trim(),
    };
    let (_, domain) = addr.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

fn canonicalize_header(name: &str, value: &str, relaxed: bool) -> String {
    if relaxed {
        let unfolded: String = value.replace(['\r', '\n'], " ");
        let collapsed = unfolded.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{}:{}", name.to_ascii_lowercase(), collapsed)
    } else {
        format!("{name}: {value}")
    }
}

fn canonicalize_body(body: &[u8], relaxed: bool) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    // A trailing newline produces one phantom empty element.
    if lines.last().map(String::is_empty).unwrap_or(false) {
        lines.pop();
    }

    if relaxed {
        for line in &mut lines {
            let mut out = String::with_capacity(line.len());
            let mut in_ws = false;
            for c in line.chars() {
                if c == ' ' || c == '\t' {
                    in_ws = true;
                } else {
                    if in_ws {
                        out.push(' ');
                    }
                    in_ws = false;
                    out.push(c);
                }
            }
            *line = out;
        }
    }

    while lines.last().map(String::is_empty).unwrap_or(false) {
        lines.pop();
    }

    if lines.is_empty() {
        return if relaxed { Vec::new() } else { b"\r\n".to_vec() };
    }
    let mut out = Vec::new();
    for line in &lines {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Build the byte string the signature actually covers: the signed
/// headers in `h=` order (last instance first, per RFC 6376 selection),
/// then the signature header itself with the `b=` value emptied and no
/// trailing CRLF.
fn signed_header_data(
    headers: &[(String, String)],
    sig_header_name: &str,
    sig_header_value: &str,
    sig: &ParsedSignature,
) -> Vec<u8> {
    let mut used = vec![false; headers.len()];
    let mut out = Vec::new();

    for wanted in &sig.signed_headers {
        let found = headers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, (name, _))| !used[*i] && name.eq_ignore_ascii_case(wanted));
        if let Some((i, (name, value))) = found {
            used[i] = true;
            out.extend_from_slice(canonicalize_header(name, value, sig.header_relaxed).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    let stripped = strip_b_tag(sig_header_value);
    out.extend_from_slice(
        canonicalize_header(sig_header_name, &stripped, sig.header_relaxed).as_bytes(),
    );
    out
}

/// Remove the value of the `b=` tag, keeping the tag itself.
fn strip_b_tag(value: &str) -> String {
    value
        .split(';')
        .map(|part| {
            let trimmed = part.trim_start();
            if trimmed.starts_with("b=") || trimmed.starts_with("b =") {
                let keep = part.len() - trimmed.len();
                format!("{}b=", &part[..keep])
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}
