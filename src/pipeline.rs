use crate::authres::Fragment;
use crate::context::SessionContext;
use crate::handler::{Handler, HandlerError, Stage};
use crate::metrics;
use anyhow::bail;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Instant;

/// A stage event with its arguments, as synthesized by either protocol
/// engine.
pub enum StageEvent<'a> {
    Connect { hostname: &'a str, ip: Option<IpAddr> },
    Helo(&'a str),
    EnvFrom(&'a str),
    EnvRcpt(&'a str),
    Header { name: &'a str, value: &'a str },
    Eoh,
    Body(&'a [u8]),
    Eom,
    Abort,
    Close,
}

impl StageEvent<'_> {
    pub fn stage(&self) -> Stage {
        match self {
            StageEvent::Connect { .. } => Stage::Connect,
            StageEvent::Helo(_) => Stage::Helo,
            StageEvent::EnvFrom(_) => Stage::EnvFrom,
            StageEvent::EnvRcpt(_) => Stage::EnvRcpt,
            StageEvent::Header { .. } => Stage::Header,
            StageEvent::Eoh => Stage::Eoh,
            StageEvent::Body(_) => Stage::Body,
            StageEvent::Eom => Stage::Eom,
            StageEvent::Abort => Stage::Abort,
            StageEvent::Close => Stage::Close,
        }
    }
}

/// Dispatches lifecycle events to the active handlers in dependency order.
///
/// The per-stage order is computed once, at worker startup, and cached for
/// the worker's lifetime. A cycle in the declared ordering constraints is
/// a fatal startup error.
pub struct Pipeline {
    handlers: Vec<Box<dyn Handler>>,
    order: HashMap<Stage, Vec<usize>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handler_names())
            .field("order", &self.order)
            .finish()
    }
}

impl Pipeline {
    pub fn build(handlers: Vec<Box<dyn Handler>>) -> anyhow::Result<Self> {
        let mut order = HashMap::new();
        for stage in Stage::ALL {
            order.insert(stage, build_stage_order(&handlers, stage)?);
        }
        for (stage, idx) in &order {
            let names: Vec<&str> = idx.iter().map(|&i| handlers[i].name()).collect();
            log::debug!("handler order for {stage}: {names:?}");
        }
        Ok(Pipeline { handlers, order })
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// The cached call order for one stage, by handler name.
    pub fn stage_order(&self, stage: Stage) -> Vec<&'static str> {
        self.order[&stage]
            .iter()
            .map(|&i| self.handlers[i].name())
            .collect()
    }

    /// Invoke every handler registered for the event's stage, in cached
    /// order. A failing handler yields exactly one temperror/permerror
    /// fragment of its own and does not stop its peers; disposition
    /// escalation does not short-circuit either, so the final header is
    /// always complete.
    pub fn dispatch(&mut self, ctx: &mut SessionContext, event: &StageEvent) {
        let stage = event.stage();
        let started = Instant::now();
        for &idx in &self.order[&stage] {
            let handler = &mut self.handlers[idx];
            let outcome = match event {
                StageEvent::Connect { hostname, ip } => handler.connect(ctx, hostname, *ip),
                StageEvent::Helo(helo) => handler.helo(ctx, helo),
                StageEvent::EnvFrom(from) => handler.envfrom(ctx, from),
                StageEvent::EnvRcpt(rcpt) => handler.envrcpt(ctx, rcpt),
                StageEvent::Header { name, value } => handler.header(ctx, name, value),
                StageEvent::Eoh => handler.eoh(ctx),
                StageEvent::Body(chunk) => handler.body(ctx, chunk),
                StageEvent::Eom => handler.eom(ctx),
                StageEvent::Abort => handler.abort(ctx),
                StageEvent::Close => handler.close(ctx),
            };
            if let Err(err) = outcome {
                let name = self.handlers[idx].name();
                log::warn!("handler {name} failed at {stage}: {err}");
                metrics::handler_error(name, err.result_token());
                reify_error(ctx, name, &err);
            }
        }
        metrics::stage_timer(&stage.to_string(), started.elapsed().as_secs_f64());
    }
}

fn reify_error(ctx: &mut SessionContext, handler: &str, err: &HandlerError) {
    ctx.add_auth_header(Fragment::new(handler, err.result_token()).comment(err.detail()));
}

/// Topologically order the handlers declaring `stage`, honoring every
/// `requires_before` / `required_after` edge, ties broken lexicographically
/// by handler name.
fn build_stage_order(handlers: &[Box<dyn Handler>], stage: Stage) -> anyhow::Result<Vec<usize>> {
    let by_name: BTreeMap<&str, usize> = handlers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.stages().contains(&stage))
        .map(|(i, h)| (h.name(), i))
        .collect();

    // requirements[h] = peers that must be emitted before h. A peer's
    // required_after is folded in as a reversed requires_before edge.
    // Constraints naming handlers not active at this stage are ignored.
    let mut requirements: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (&name, &idx) in &by_name {
        let entry = requirements.entry(name).or_default();
        for &req in handlers[idx].requires_before(stage) {
            if by_name.contains_key(req) {
                entry.insert(req);
            }
        }
    }
    for (&name, &idx) in &by_name {
        for &peer in handlers[idx].required_after(stage) {
            if by_name.contains_key(peer) {
                requirements.entry(peer).or_default().insert(name);
            }
        }
    }

    let mut todo: Vec<&str> = by_name.keys().copied().collect(); // already sorted
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    let mut result = Vec::with_capacity(todo.len());

    while !todo.is_empty() {
        let ready: Vec<&str> = todo
            .iter()
            .copied()
            .filter(|name| requirements[name].iter().all(|r| emitted.contains(r)))
            .collect();
        if ready.is_empty() {
            bail!(
                "Could not build order list for stage {stage}: dependency cycle among {}",
                todo.join(", ")
            );
        }
        for name in ready {
            emitted.insert(name);
            result.push(by_name[name]);
        }
        todo.retain(|name| !emitted.contains(name));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;

    struct Probe {
        name: &'static str,
        before: &'static [&'static str],
        after: &'static [&'static str],
        fail: Option<fn() -> HandlerError>,
    }

    impl Probe {
        fn new(name: &'static str) -> Self {
            Probe {
                name,
                before: &[],
                after: &[],
                fail: None,
            }
        }
    }

    impl Handler for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn stages(&self) -> &'static [Stage] {
            &[Stage::Eom]
        }

        fn requires_before(&self, _stage: Stage) -> &'static [&'static str] {
            self.before
        }

        fn required_after(&self, _stage: Stage) -> &'static [&'static str] {
            self.after
        }

        fn eom(&mut self, ctx: &mut SessionContext) -> HandlerResult {
            if let Some(make) = self.fail {
                return Err(make());
            }
            ctx.add_auth_header(Fragment::new(self.name, "pass"));
            Ok(())
        }
    }

    fn boxed(probe: Probe) -> Box<dyn Handler> {
        Box::new(probe)
    }

    #[test]
    fn test_ties_break_lexicographically() {
        let pipeline = Pipeline::build(vec![
            boxed(Probe::new("zeta")),
            boxed(Probe::new("alpha")),
            boxed(Probe::new("mid")),
        ])
        .unwrap();
        assert_eq!(pipeline.stage_order(Stage::Eom), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_requires_before_is_honored() {
        let mut a = Probe::new("aaa");
        a.before = &["zzz"];
        let pipeline = Pipeline::build(vec![boxed(a), boxed(Probe::new("zzz"))]).unwrap();
        assert_eq!(pipeline.stage_order(Stage::Eom), vec!["zzz", "aaa"]);
    }

    #[test]
    fn test_required_after_becomes_reverse_edge() {
        let mut z = Probe::new("zzz");
        z.after = &["aaa"];
        let pipeline = Pipeline::build(vec![boxed(Probe::new("aaa")), boxed(z)]).unwrap();
        // zzz declares that aaa must run after it.
        assert_eq!(pipeline.stage_order(Stage::Eom), vec!["zzz", "aaa"]);
    }

    #[test]
    fn test_constraints_on_inactive_peers_are_ignored() {
        let mut a = Probe::new("aaa");
        a.before = &["not-loaded"];
        let pipeline = Pipeline::build(vec![boxed(a)]).unwrap();
        assert_eq!(pipeline.stage_order(Stage::Eom), vec!["aaa"]);
    }

    #[test]
    fn test_cycle_is_a_fatal_build_error() {
        let mut a = Probe::new("aaa");
        a.before = &["bbb"];
        let mut b = Probe::new("bbb");
        b.before = &["aaa"];
        let err = Pipeline::build(vec![boxed(a), boxed(b)]).unwrap_err();
        assert!(err.to_string().contains("Could not build order list"));
    }

    #[test]
    fn test_fragments_mirror_execution_order() {
        let mut z = Probe::new("zzz");
        z.before = &["mmm"];
        let mut pipeline = Pipeline::build(vec![
            boxed(z),
            boxed(Probe::new("mmm")),
            boxed(Probe::new("aaa")),
        ])
        .unwrap();
        let mut ctx = SessionContext::new();
        pipeline.dispatch(&mut ctx, &StageEvent::Eom);
        let methods: Vec<&str> = ctx
            .result_fragments()
            .iter()
            .map(|f| f.method.as_str())
            .collect();
        assert_eq!(methods, vec!["aaa", "mmm", "zzz"]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_peers() {
        let mut bad = Probe::new("bad");
        bad.fail = Some(|| HandlerError::Temp("dns timeout".to_string()));
        let mut pipeline = Pipeline::build(vec![boxed(bad), boxed(Probe::new("good"))]).unwrap();
        let mut ctx = SessionContext::new();
        pipeline.dispatch(&mut ctx, &StageEvent::Eom);

        let frags = ctx.result_fragments();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].method, "bad");
        assert_eq!(frags[0].result, "temperror");
        assert_eq!(frags[1].method, "good");
        assert_eq!(frags[1].result, "pass");
    }

    #[test]
    fn test_permerror_is_reified_as_permerror() {
        let mut bad = Probe::new("bad");
        bad.fail = Some(|| HandlerError::Perm("unparseable signature".to_string()));
        let mut pipeline = Pipeline::build(vec![boxed(bad)]).unwrap();
        let mut ctx = SessionContext::new();
        pipeline.dispatch(&mut ctx, &StageEvent::Eom);
        assert_eq!(ctx.result_fragments()[0].result, "permerror");
    }
}
