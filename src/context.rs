use crate::authres::Fragment;
use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;

/// Final verdict returned to the MTA for one message.
///
/// Ordered by strictness: an escalation may only move rightward, so a
/// handler requesting `Reject` after another requested `Continue` wins,
/// never the reverse. `Accept` is the operator override slot and does not
/// outrank the punitive dispositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Accept,
    Quarantine,
    Tempfail,
    Reject,
    Discard,
}

impl Disposition {
    pub fn as_token(self) -> &'static str {
        match self {
            Disposition::Continue => "continue",
            Disposition::Accept => "accept",
            Disposition::Quarantine => "quarantine",
            Disposition::Tempfail => "tempfail",
            Disposition::Reject => "reject",
            Disposition::Discard => "discard",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Disposition::Continue => 0,
            Disposition::Accept => 1,
            Disposition::Quarantine => 2,
            Disposition::Tempfail => 3,
            Disposition::Reject => 4,
            Disposition::Discard => 5,
        }
    }
}

/// Typed scratchpad shared by all handlers within one connection.
///
/// Constructed at accept, mutated only by handlers during their own
/// callbacks, destroyed at connection close. Handlers are cooperative, not
/// isolated: any handler may read any field, and keeps its private
/// per-message state in its own `handler_state` slot.
pub struct SessionContext {
    pub client_ip: Option<IpAddr>,
    /// Hostname the MTA reported for the client at connect time.
    pub client_name: String,
    /// Reverse-DNS name of `client_ip`, when one resolved.
    pub client_rdns: Option<String>,
    /// Reverse name whose forward lookup confirmed `client_ip` (iprev).
    pub verified_ptr: Option<String>,
    pub helo_name: Option<String>,

    pub is_local_ip_address: bool,
    pub is_trusted_ip_address: bool,
    pub is_authenticated: bool,

    pub envelope_from: Option<String>,
    pub envelope_rcpt: Vec<String>,
    /// MTA queue identifier, once known; log correlation key.
    pub queue_id: Option<String>,

    handler_state: HashMap<String, Box<dyn Any + Send>>,
    result_fragments: Vec<Fragment>,
    /// Auxiliary informational headers, prepended after Authentication-Results.
    extra_headers: Vec<(String, String)>,

    pub exit_on_close: bool,
    pub exit_on_close_error: Option<String>,

    disposition: Disposition,
    disposition_reason: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        SessionContext {
            client_ip: None,
            client_name: String::new(),
            client_rdns: None,
            verified_ptr: None,
            helo_name: None,
            is_local_ip_address: false,
            is_trusted_ip_address: false,
            is_authenticated: false,
            envelope_from: None,
            envelope_rcpt: Vec::new(),
            queue_id: None,
            handler_state: HashMap::new(),
            result_fragments: Vec::new(),
            extra_headers: Vec::new(),
            exit_on_close: false,
            exit_on_close_error: None,
            disposition: Disposition::Continue,
            disposition_reason: None,
        }
    }

    /// True when any of the short-circuit classifications applies; most
    /// policy handlers produce nothing for such clients.
    pub fn is_exempt(&self) -> bool {
        self.is_local_ip_address || self.is_trusted_ip_address || self.is_authenticated
    }

    /// Append a fragment destined for the Authentication-Results header.
    /// Append-only within a message; fragments keep call order.
    pub fn add_auth_header(&mut self, fragment: Fragment) {
        self.dbg(&format!("result: {}", fragment.render_entry()));
        self.result_fragments.push(fragment);
    }

    /// Add a purely informational header that is not part of the canonical
    /// Authentication-Results line, named `X-<METHOD>`.
    pub fn add_c_auth_header(&mut self, fragment: Fragment) {
        let name = if fragment.method.to_lowercase().starts_with("x-") {
            fragment.method.to_uppercase()
        } else {
            format!("X-{}", fragment.method.to_uppercase())
        };
        self.extra_headers.push((name, fragment.render_entry()));
    }

    pub fn result_fragments(&self) -> &[Fragment] {
        &self.result_fragments
    }

    pub fn extra_headers(&self) -> &[(String, String)] {
        &self.extra_headers
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn disposition_reason(&self) -> Option<&str> {
        self.disposition_reason.as_deref()
    }

    /// Move the disposition toward strictness. Requests weaker than the
    /// current disposition are ignored.
    pub fn escalate(&mut self, new: Disposition, reason: Option<String>) {
        if new.rank() > self.disposition.rank() {
            self.disposition = new;
            self.disposition_reason = reason;
        }
    }

    pub fn set_reject(&mut self, reason: &str) {
        self.escalate(Disposition::Reject, Some(reason.to_string()));
    }

    pub fn set_quarantine(&mut self, reason: &str) {
        self.escalate(Disposition::Quarantine, Some(reason.to_string()));
    }

    pub fn set_tempfail(&mut self, reason: &str) {
        self.escalate(Disposition::Tempfail, Some(reason.to_string()));
    }

    pub fn set_discard(&mut self) {
        self.escalate(Disposition::Discard, None);
    }

    /// Fetch (creating on first use) this handler's private per-message
    /// state slot.
    pub fn handler_state_mut<T: Any + Send + Default>(&mut self, handler: &str) -> &mut T {
        self.handler_state
            .entry(handler.to_string())
            .or_insert_with(|| Box::<T>::default())
            .downcast_mut::<T>()
            .expect("handler state slot holds a different type")
    }

    pub fn handler_state<T: Any + Send>(&self, handler: &str) -> Option<&T> {
        self.handler_state.get(handler)?.downcast_ref::<T>()
    }

    pub fn take_handler_state(&mut self, handler: &str) -> Option<Box<dyn Any + Send>> {
        self.handler_state.remove(handler)
    }

    /// Debug log line automatically correlated with the MTA queue id.
    pub fn dbg(&self, msg: &str) {
        let queue = self.queue_id.as_deref().unwrap_or("NOQUEUE");
        log::debug!("{queue}: {msg}");
    }

    /// Message aborted by the MTA: partial fragments are discarded, not
    /// preserved. The count is logged at DEBUG so a diagnostic dump can
    /// still see how far the pipeline got.
    pub fn abort_message(&mut self) {
        let discarded = self.result_fragments.len();
        if discarded > 0 {
            self.dbg(&format!("abort: discarding {discarded} result fragments"));
        }
        self.clear_message_state();
    }

    /// End-of-message finalization after the header has been emitted.
    pub fn end_message(&mut self) {
        self.clear_message_state();
    }

    fn clear_message_state(&mut self) {
        self.envelope_from = None;
        self.envelope_rcpt.clear();
        self.queue_id = None;
        self.handler_state.clear();
        self.result_fragments.clear();
        self.extra_headers.clear();
        self.disposition = Disposition::Continue;
        self.disposition_reason = None;
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_moves_only_toward_strictness() {
        let mut ctx = SessionContext::new();
        ctx.set_quarantine("suspicious");
        ctx.set_reject("policy");
        assert_eq!(ctx.disposition(), Disposition::Reject);
        assert_eq!(ctx.disposition_reason(), Some("policy"));

        // A later, weaker request must not unwind the reject.
        ctx.set_tempfail("try later");
        assert_eq!(ctx.disposition(), Disposition::Reject);
        assert_eq!(ctx.disposition_reason(), Some("policy"));
    }

    #[test]
    fn test_abort_discards_fragments() {
        let mut ctx = SessionContext::new();
        ctx.add_auth_header(crate::authres::Fragment::new("spf", "pass"));
        ctx.set_reject("no");
        ctx.abort_message();
        assert!(ctx.result_fragments().is_empty());
        assert_eq!(ctx.disposition(), Disposition::Continue);
    }

    #[test]
    fn test_abort_keeps_connection_scope() {
        let mut ctx = SessionContext::new();
        ctx.helo_name = Some("mx.example.com".to_string());
        ctx.is_trusted_ip_address = true;
        ctx.envelope_from = Some("a@example.com".to_string());
        ctx.abort_message();
        assert_eq!(ctx.helo_name.as_deref(), Some("mx.example.com"));
        assert!(ctx.is_trusted_ip_address);
        assert!(ctx.envelope_from.is_none());
    }

    #[test]
    fn test_handler_state_slot() {
        #[derive(Default)]
        struct Counter {
            n: u32,
        }
        let mut ctx = SessionContext::new();
        ctx.handler_state_mut::<Counter>("dkim").n += 1;
        ctx.handler_state_mut::<Counter>("dkim").n += 1;
        assert_eq!(ctx.handler_state::<Counter>("dkim").unwrap().n, 2);
        assert!(ctx.handler_state::<Counter>("spf").is_none());
    }

    #[test]
    fn test_c_auth_header_names() {
        let mut ctx = SessionContext::new();
        ctx.add_c_auth_header(
            crate::authres::Fragment::new("x-ptr", "pass").prop("x-ptr-helo", "mx.example.com"),
        );
        let headers = ctx.extra_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "X-PTR");
        assert_eq!(headers[0].1, "x-ptr=pass x-ptr-helo=mx.example.com");
    }
}
