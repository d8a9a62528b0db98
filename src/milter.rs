use crate::authres;
use crate::config::{Config, NetworkClassifier};
use crate::context::{Disposition, SessionContext};
use crate::metrics;
use crate::pipeline::{Pipeline, StageEvent};
use anyhow::bail;
use std::io::{Read, Write};
use std::net::IpAddr;

// Milter protocol commands (MTA -> filter)
const SMFIC_ABORT: u8 = b'A';
const SMFIC_BODY: u8 = b'B';
const SMFIC_CONNECT: u8 = b'C';
const SMFIC_MACRO: u8 = b'D';
const SMFIC_BODYEOB: u8 = b'E';
const SMFIC_HELO: u8 = b'H';
const SMFIC_HEADER: u8 = b'L';
const SMFIC_MAIL: u8 = b'M';
const SMFIC_EOH: u8 = b'N';
const SMFIC_OPTNEG: u8 = b'O';
const SMFIC_QUIT: u8 = b'Q';
const SMFIC_RCPT: u8 = b'R';
const SMFIC_DATA: u8 = b'T';

// Milter responses (filter -> MTA)
const SMFIR_CONTINUE: u8 = b'c';
const SMFIR_DISCARD: u8 = b'd';
const SMFIR_INSHEADER: u8 = b'i';
const SMFIR_QUARANTINE: u8 = b'q';
const SMFIR_REJECT: u8 = b'r';
const SMFIR_TEMPFAIL: u8 = b't';
const SMFIR_REPLYCODE: u8 = b'y';

// Negotiated action bits
const SMFIF_ADDHDRS: u32 = 0x01;
const SMFIF_CHGBODY: u32 = 0x02;
const SMFIF_QUARANTINE: u32 = 0x20;
const SMFIF_SETSENDER: u32 = 0x40;

const MILTER_VERSION: u32 = 6;
/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_LEN: usize = 1 << 20;

/// What the worker needs to know after one MTA connection finished.
#[derive(Debug)]
pub struct ConnOutcome {
    pub messages: usize,
    pub exit_on_close: bool,
    pub exit_on_close_error: Option<String>,
}

/// Connection FSM states, advancing with the message lifecycle. ABORT
/// from EnvFromSeen onward returns to Connected; QUIT returns to Idle by
/// closing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FsmState {
    Idle,
    Negotiated,
    Connected,
    HeloSeen,
    EnvFromSeen,
    EnvRcptSeen,
    HeadersStreaming,
    Eoh,
    BodyStreaming,
}

enum Flow {
    Continue,
    CloseConnection,
}

/// One milter conversation with the MTA: the wire codec, the state
/// machine, and the stage mapping into the handler pipeline.
pub struct MilterConnection<'a, S: Read + Write> {
    stream: S,
    pipeline: &'a mut Pipeline,
    config: &'a Config,
    classifier: &'a NetworkClassifier,
    ctx: SessionContext,
    state: FsmState,
    messages: usize,
    /// Messages remaining before the worker retires.
    budget: usize,
}

impl<'a, S: Read + Write> MilterConnection<'a, S> {
    pub fn new(
        stream: S,
        pipeline: &'a mut Pipeline,
        config: &'a Config,
        classifier: &'a NetworkClassifier,
        budget: usize,
    ) -> Self {
        MilterConnection {
            stream,
            pipeline,
            config,
            classifier,
            ctx: SessionContext::new(),
            state: FsmState::Idle,
            messages: 0,
            budget,
        }
    }

    pub fn handle(&mut self) -> anyhow::Result<ConnOutcome> {
        loop {
            match self.read_frame()? {
                None => break,
                Some((command, data)) => match self.process_command(command, &data) {
                    Ok(Flow::Continue) => {
                        // Between messages only: budget exhaustion and
                        // pending SIGTERM both close the connection here.
                        if self.state == FsmState::Connected
                            && (self.messages >= self.budget
                                || crate::supervisor::worker_should_exit())
                        {
                            log::info!("closing connection after {} messages", self.messages);
                            break;
                        }
                    }
                    Ok(Flow::CloseConnection) => break,
                    Err(err) => {
                        // Protocol errors poison this connection only.
                        log::error!("milter protocol error: {err}");
                        self.pipeline.dispatch(&mut self.ctx, &StageEvent::Close);
                        return Err(err);
                    }
                },
            }
        }
        self.pipeline.dispatch(&mut self.ctx, &StageEvent::Close);
        Ok(ConnOutcome {
            messages: self.messages,
            exit_on_close: self.ctx.exit_on_close,
            exit_on_close_error: self.ctx.exit_on_close_error.clone(),
        })
    }

    /// Read one length-prefixed frame: 4-byte big-endian length, command
    /// byte, payload. Returns None at EOF.
    fn read_frame(&mut self) -> anyhow::Result<Option<(u8, Vec<u8>)>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_FRAME_LEN {
            bail!("oversized frame ({len} bytes)");
        }

        let mut cmd_buf = [0u8; 1];
        self.stream.read_exact(&mut cmd_buf)?;

        let mut data = vec![0u8; len - 1];
        if len > 1 {
            self.stream.read_exact(&mut data)?;
        }
        Ok(Some((cmd_buf[0], data)))
    }

    fn send_response(&mut self, response: u8, data: &[u8]) -> anyhow::Result<()> {
        let len = (data.len() + 1) as u32;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&[response])?;
        if !data.is_empty() {
            self.stream.write_all(data)?;
        }
        self.stream.flush()?;
        Ok(())
    }

    fn expect_state(&self, command: &str, allowed: &[FsmState]) -> anyhow::Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            bail!("unexpected {command} in state {:?}", self.state)
        }
    }

    fn process_command(&mut self, command: u8, data: &[u8]) -> anyhow::Result<Flow> {
        match command {
            SMFIC_OPTNEG => {
                self.expect_state("OPTNEG", &[FsmState::Idle])?;
                self.negotiate(data)?;
                self.state = FsmState::Negotiated;
                Ok(Flow::Continue)
            }
            SMFIC_MACRO => {
                // Macros arrive interleaved and get no reply.
                if self.state == FsmState::Idle {
                    bail!("unexpected MACRO before OPTNEG");
                }
                self.absorb_macros(data);
                Ok(Flow::Continue)
            }
            SMFIC_CONNECT => {
                self.expect_state("CONNECT", &[FsmState::Negotiated])?;
                let (hostname, ip) = parse_connect(data)?;
                self.ctx.client_name = hostname.clone();
                self.ctx.client_ip = ip;
                if let Some(ip) = ip {
                    let (local, trusted) = self.classifier.classify(ip);
                    self.ctx.is_local_ip_address = local;
                    self.ctx.is_trusted_ip_address = trusted;
                }
                self.pipeline
                    .dispatch(&mut self.ctx, &StageEvent::Connect { hostname: &hostname, ip });
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::Connected;
                Ok(Flow::Continue)
            }
            SMFIC_HELO => {
                self.expect_state("HELO", &[FsmState::Connected, FsmState::HeloSeen])?;
                let helo = cstring_arg(data);
                self.ctx.helo_name = Some(helo.clone());
                self.pipeline.dispatch(&mut self.ctx, &StageEvent::Helo(&helo));
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::HeloSeen;
                Ok(Flow::Continue)
            }
            SMFIC_MAIL => {
                self.expect_state("MAIL", &[FsmState::Connected, FsmState::HeloSeen])?;
                let from = parse_address_arg(data)?;
                self.ctx.envelope_from = Some(from.clone());
                self.pipeline.dispatch(&mut self.ctx, &StageEvent::EnvFrom(&from));
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::EnvFromSeen;
                Ok(Flow::Continue)
            }
            SMFIC_RCPT => {
                self.expect_state("RCPT", &[FsmState::EnvFromSeen, FsmState::EnvRcptSeen])?;
                let rcpt = parse_address_arg(data)?;
                self.ctx.envelope_rcpt.push(rcpt.clone());
                self.pipeline.dispatch(&mut self.ctx, &StageEvent::EnvRcpt(&rcpt));
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::EnvRcptSeen;
                Ok(Flow::Continue)
            }
            SMFIC_DATA => {
                self.expect_state("DATA", &[FsmState::EnvRcptSeen])?;
                self.send_response(SMFIR_CONTINUE, &[])?;
                Ok(Flow::Continue)
            }
            SMFIC_HEADER => {
                self.expect_state("HEADER", &[FsmState::EnvRcptSeen, FsmState::HeadersStreaming])?;
                let (name, value) = parse_header(data)?;
                self.pipeline.dispatch(
                    &mut self.ctx,
                    &StageEvent::Header {
                        name: &name,
                        value: &value,
                    },
                );
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::HeadersStreaming;
                Ok(Flow::Continue)
            }
            SMFIC_EOH => {
                self.expect_state("EOH", &[FsmState::EnvRcptSeen, FsmState::HeadersStreaming])?;
                self.pipeline.dispatch(&mut self.ctx, &StageEvent::Eoh);
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::Eoh;
                Ok(Flow::Continue)
            }
            SMFIC_BODY => {
                self.expect_state("BODY", &[FsmState::Eoh, FsmState::BodyStreaming])?;
                self.pipeline.dispatch(&mut self.ctx, &StageEvent::Body(data));
                self.send_response(SMFIR_CONTINUE, &[])?;
                self.state = FsmState::BodyStreaming;
                Ok(Flow::Continue)
            }
            SMFIC_BODYEOB => {
                self.expect_state("BODYEOB", &[FsmState::Eoh, FsmState::BodyStreaming])?;
                self.finalize_message()?;
                self.state = FsmState::Connected;
                Ok(Flow::Continue)
            }
            SMFIC_ABORT => {
                // No reply. Partial results are discarded, the connection
                // drops back to the post-connect state.
                if self.state >= FsmState::EnvFromSeen {
                    self.pipeline.dispatch(&mut self.ctx, &StageEvent::Abort);
                    self.ctx.abort_message();
                    self.state = FsmState::Connected;
                }
                Ok(Flow::Continue)
            }
            SMFIC_QUIT => Ok(Flow::CloseConnection),
            _ => {
                bail!("unknown command 0x{command:02x} in state {:?}", self.state)
            }
        }
    }

    fn negotiate(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let offered_version = if data.len() >= 12 {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]])
        } else {
            MILTER_VERSION
        };

        let mut response = Vec::with_capacity(12);
        response.extend_from_slice(&offered_version.min(MILTER_VERSION).to_be_bytes());
        let actions = SMFIF_ADDHDRS | SMFIF_CHGBODY | SMFIF_QUARANTINE | SMFIF_SETSENDER;
        response.extend_from_slice(&actions.to_be_bytes());
        // Protocol mask 0: no NOCONNECT/NOHELO/NOMAIL/NORCPT/NOHDRS/NOEOH/
        // NOBODY bits, we want every lifecycle event.
        response.extend_from_slice(&0u32.to_be_bytes());

        log::debug!(
            "negotiated version {} actions 0x{actions:02x}",
            offered_version.min(MILTER_VERSION)
        );
        self.send_response(SMFIC_OPTNEG, &response)
    }

    /// Macro definitions: stage command byte, then NUL-separated
    /// name/value pairs. The queue id and SASL login are the ones we need.
    fn absorb_macros(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut fields = data[1..].split(|&b| b == 0);
        while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
            let name = String::from_utf8_lossy(name);
            let value = String::from_utf8_lossy(value);
            match name.as_ref() {
                "i" if !value.is_empty() => {
                    self.ctx.queue_id = Some(value.to_string());
                }
                "{auth_authen}" if !value.is_empty() => {
                    self.ctx.is_authenticated = true;
                }
                _ => {}
            }
        }
    }

    /// End of message: run the eom stage, emit the composite headers, and
    /// answer with the accumulated disposition.
    fn finalize_message(&mut self) -> anyhow::Result<()> {
        self.pipeline.dispatch(&mut self.ctx, &StageEvent::Eom);

        let server_id = self.config.effective_server_id();
        let header = authres::assemble(&server_id, self.ctx.result_fragments());
        self.insert_header(0, "Authentication-Results", &header)?;
        let extra: Vec<(String, String)> = self.ctx.extra_headers().to_vec();
        for (index, (name, value)) in extra.iter().enumerate() {
            self.insert_header(index as u32 + 1, name, value)?;
        }

        let disposition = self.ctx.disposition();
        let reason = self.ctx.disposition_reason().map(str::to_string);
        match disposition {
            Disposition::Continue | Disposition::Accept => {
                self.send_response(SMFIR_CONTINUE, &[])?;
            }
            Disposition::Quarantine => {
                let mut payload = reason.unwrap_or_else(|| "quarantined".to_string()).into_bytes();
                payload.push(0);
                self.send_response(SMFIR_QUARANTINE, &payload)?;
                self.send_response(SMFIR_CONTINUE, &[])?;
            }
            Disposition::Tempfail => match reason {
                Some(reason) => {
                    self.send_reply_code(&format!("451 4.7.1 {reason}"))?;
                }
                None => self.send_response(SMFIR_TEMPFAIL, &[])?,
            },
            Disposition::Reject => match reason {
                Some(reason) => {
                    self.send_reply_code(&format!("550 5.7.1 {reason}"))?;
                }
                None => self.send_response(SMFIR_REJECT, &[])?,
            },
            Disposition::Discard => self.send_response(SMFIR_DISCARD, &[])?,
        }

        metrics::message(disposition.as_token());
        self.messages += 1;
        self.ctx.end_message();
        Ok(())
    }

    fn insert_header(&mut self, index: u32, name: &str, value: &str) -> anyhow::Result<()> {
        let mut payload = Vec::with_capacity(8 + name.len() + value.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.send_response(SMFIR_INSHEADER, &payload)
    }

    fn send_reply_code(&mut self, line: &str) -> anyhow::Result<()> {
        let mut payload = line.as_bytes().to_vec();
        payload.push(0);
        self.send_response(SMFIR_REPLYCODE, &payload)
    }
}

/// CONNECT payload: hostname NUL, family byte, 2-byte port, address NUL.
fn parse_connect(data: &[u8]) -> anyhow::Result<(String, Option<IpAddr>)> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow::anyhow!("connect data missing hostname terminator"))?;
    let hostname = String::from_utf8_lossy(&data[..nul]).to_string();

    let rest = &data[nul + 1..];
    let ip = match rest.first() {
        Some(b'4') | Some(b'6') if rest.len() > 3 => {
            cstring_arg(&rest[3..]).parse::<IpAddr>().ok()
        }
        _ => None, // unix socket or unknown family
    };
    Ok((hostname, ip))
}

/// MAIL/RCPT payload: NUL-separated args, the first being the address,
/// usually in angle brackets.
fn parse_address_arg(data: &[u8]) -> anyhow::Result<String> {
    let first = data
        .split(|&b| b == 0)
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty envelope argument"))?;
    let addr = String::from_utf8_lossy(first);
    Ok(crate::handlers::spf::strip_angles(&addr))
}

/// HEADER payload: name NUL value NUL.
fn parse_header(data: &[u8]) -> anyhow::Result<(String, String)> {
    let mut fields = data.split(|&b| b == 0);
    let name = fields
        .next()
        .ok_or_else(|| anyhow::anyhow!("header frame missing name"))?;
    let value = fields.next().unwrap_or_default();
    Ok((
        String::from_utf8_lossy(name).to_string(),
        String::from_utf8_lossy(value).to_string(),
    ))
}

fn cstring_arg(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authres::Fragment;
    use crate::handler::{Handler, HandlerResult, Stage};
    use std::io::Cursor;

    /// Canned input on one side, captured output on the other.
    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        out.push(cmd);
        out.extend_from_slice(payload);
        out
    }

    fn parse_responses(mut data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while data.len() >= 5 {
            let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            out.push((data[4], data[5..4 + len].to_vec()));
            data = &data[4 + len..];
        }
        out
    }

    struct StampHandler;

    impl Handler for StampHandler {
        fn name(&self) -> &'static str {
            "stamp"
        }

        fn stages(&self) -> &'static [Stage] {
            &[Stage::Eom]
        }

        fn eom(&mut self, ctx: &mut crate::context::SessionContext) -> HandlerResult {
            ctx.add_auth_header(Fragment::new("stamp", "pass"));
            Ok(())
        }
    }

    struct RejectingHandler;

    impl Handler for RejectingHandler {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn stages(&self) -> &'static [Stage] {
            &[Stage::Eom]
        }

        fn eom(&mut self, ctx: &mut crate::context::SessionContext) -> HandlerResult {
            ctx.set_reject("rejected by policy");
            Ok(())
        }
    }

    fn connect_payload() -> Vec<u8> {
        let mut payload = b"mx.remote.example\0".to_vec();
        payload.push(b'4');
        payload.extend_from_slice(&4321u16.to_be_bytes());
        payload.extend_from_slice(b"192.0.2.7\0");
        payload
    }

    fn full_message_input() -> Vec<u8> {
        let mut optneg = Vec::new();
        optneg.extend_from_slice(&6u32.to_be_bytes());
        optneg.extend_from_slice(&0x1ffu32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());

        let mut input = Vec::new();
        input.extend(frame(SMFIC_OPTNEG, &optneg));
        input.extend(frame(SMFIC_CONNECT, &connect_payload()));
        input.extend(frame(SMFIC_HELO, b"mx.remote.example\0"));
        input.extend(frame(SMFIC_MACRO, b"Mi\0QID123\0"));
        input.extend(frame(SMFIC_MAIL, b"<user@remote.example>\0"));
        input.extend(frame(SMFIC_RCPT, b"<postmaster@local.example>\0"));
        input.extend(frame(SMFIC_HEADER, b"From\0user@remote.example\0"));
        input.extend(frame(SMFIC_EOH, b""));
        input.extend(frame(SMFIC_BODY, b"hello\r\n"));
        input.extend(frame(SMFIC_BODYEOB, b""));
        input.extend(frame(SMFIC_QUIT, b""));
        input
    }

    fn run_with_budget(
        input: Vec<u8>,
        handlers: Vec<Box<dyn Handler>>,
        budget: usize,
    ) -> (anyhow::Result<ConnOutcome>, Vec<(u8, Vec<u8>)>) {
        let mut pipeline = Pipeline::build(handlers).unwrap();
        let mut config = Config::default();
        config.authserv_id = Some("gw.local.example".to_string());
        let classifier = NetworkClassifier::from_config(&config).unwrap();

        let stream = FakeStream {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        let mut conn = MilterConnection::new(stream, &mut pipeline, &config, &classifier, budget);
        let outcome = conn.handle();
        (outcome, parse_responses(&conn.stream.output))
    }

    fn run(
        input: Vec<u8>,
        handlers: Vec<Box<dyn Handler>>,
    ) -> (anyhow::Result<ConnOutcome>, Vec<(u8, Vec<u8>)>) {
        run_with_budget(input, handlers, 100)
    }

    #[test]
    fn test_full_message_emits_one_auth_results_header() {
        let (outcome, responses) = run(full_message_input(), vec![Box::new(StampHandler)]);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.messages, 1);
        assert!(!outcome.exit_on_close);

        // The negotiation reply advertises our action set.
        let (cmd, payload) = &responses[0];
        assert_eq!(*cmd, SMFIC_OPTNEG);
        let actions = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        assert_eq!(
            actions,
            SMFIF_ADDHDRS | SMFIF_CHGBODY | SMFIF_QUARANTINE | SMFIF_SETSENDER
        );

        let inserts: Vec<&Vec<u8>> = responses
            .iter()
            .filter(|(cmd, _)| *cmd == SMFIR_INSHEADER)
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(inserts.len(), 1);
        let payload = inserts[0];
        assert_eq!(&payload[0..4], &0u32.to_be_bytes());
        let text = String::from_utf8_lossy(&payload[4..]);
        assert!(text.starts_with("Authentication-Results\0"));
        assert!(text.contains("gw.local.example; stamp=pass"));

        // Final reply for the message is a continue.
        assert_eq!(responses.last().unwrap().0, SMFIR_CONTINUE);
    }

    #[test]
    fn test_rejecting_disposition_maps_to_reply_code() {
        let (outcome, responses) = run(full_message_input(), vec![Box::new(RejectingHandler)]);
        outcome.unwrap();
        let (cmd, payload) = responses.last().unwrap();
        assert_eq!(*cmd, SMFIR_REPLYCODE);
        assert!(String::from_utf8_lossy(payload).starts_with("550 5.7.1 rejected by policy"));
        // The header is still emitted before the verdict.
        assert!(responses.iter().any(|(cmd, _)| *cmd == SMFIR_INSHEADER));
    }

    #[test]
    fn test_empty_pipeline_still_emits_header() {
        let (outcome, responses) = run(full_message_input(), Vec::new());
        assert_eq!(outcome.unwrap().messages, 1);
        let insert = responses
            .iter()
            .find(|(cmd, _)| *cmd == SMFIR_INSHEADER)
            .unwrap();
        let text = String::from_utf8_lossy(&insert.1[4..]);
        assert!(text.contains("gw.local.example; none"));
    }

    #[test]
    fn test_queue_id_macro_is_absorbed() {
        // Run up to MAIL, then abort: the macro handling is observable
        // via a probe handler that records the queue id.
        struct QueueProbe;
        impl Handler for QueueProbe {
            fn name(&self) -> &'static str {
                "queueprobe"
            }
            fn stages(&self) -> &'static [Stage] {
                &[Stage::EnvFrom]
            }
            fn envfrom(
                &mut self,
                ctx: &mut crate::context::SessionContext,
                _from: &str,
            ) -> HandlerResult {
                assert_eq!(ctx.queue_id.as_deref(), Some("QID123"));
                Ok(())
            }
        }
        let (outcome, _) = run(full_message_input(), vec![Box::new(QueueProbe)]);
        outcome.unwrap();
    }

    #[test]
    fn test_header_before_connect_is_a_protocol_error() {
        let mut optneg = Vec::new();
        optneg.extend_from_slice(&6u32.to_be_bytes());
        optneg.extend_from_slice(&0x1ffu32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());

        let mut input = Vec::new();
        input.extend(frame(SMFIC_OPTNEG, &optneg));
        input.extend(frame(SMFIC_HEADER, b"From\0x\0"));
        let (outcome, _) = run(input, Vec::new());
        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("unexpected HEADER"));
    }

    #[test]
    fn test_unknown_command_closes_connection() {
        let mut optneg = Vec::new();
        optneg.extend_from_slice(&6u32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());
        let mut input = Vec::new();
        input.extend(frame(SMFIC_OPTNEG, &optneg));
        input.extend(frame(b'Z', b""));
        let (outcome, _) = run(input, Vec::new());
        assert!(outcome.is_err());
    }

    #[test]
    fn test_abort_discards_and_allows_new_message() {
        let mut optneg = Vec::new();
        optneg.extend_from_slice(&6u32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());

        let mut input = Vec::new();
        input.extend(frame(SMFIC_OPTNEG, &optneg));
        input.extend(frame(SMFIC_CONNECT, &connect_payload()));
        input.extend(frame(SMFIC_MAIL, b"<a@remote.example>\0"));
        input.extend(frame(SMFIC_ABORT, b""));
        // Second message on the same connection proceeds normally.
        input.extend(frame(SMFIC_MAIL, b"<b@remote.example>\0"));
        input.extend(frame(SMFIC_RCPT, b"<c@local.example>\0"));
        input.extend(frame(SMFIC_EOH, b""));
        input.extend(frame(SMFIC_BODYEOB, b""));
        input.extend(frame(SMFIC_QUIT, b""));

        let (outcome, responses) = run(input, vec![Box::new(StampHandler)]);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.messages, 1);
        let inserts = responses
            .iter()
            .filter(|(cmd, _)| *cmd == SMFIR_INSHEADER)
            .count();
        assert_eq!(inserts, 1);
    }

    #[test]
    fn test_budget_closes_after_nth_message() {
        let mut input = full_message_input();
        // Strip the trailing QUIT and append a second message attempt.
        input.truncate(input.len() - 5);
        input.extend(frame(SMFIC_MAIL, b"<again@remote.example>\0"));
        input.extend(frame(SMFIC_QUIT, b""));

        let (outcome, _) = run_with_budget(input, Vec::new(), 1);
        // The connection closes right after the first message; the second
        // MAIL is never consumed.
        assert_eq!(outcome.unwrap().messages, 1);
    }

    #[test]
    fn test_parse_connect() {
        let (hostname, ip) = parse_connect(&connect_payload()).unwrap();
        assert_eq!(hostname, "mx.remote.example");
        assert_eq!(ip, Some("192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn test_parse_connect_unix_family() {
        let (hostname, ip) = parse_connect(b"localhost\0L/var/run/mta\0").unwrap();
        assert_eq!(hostname, "localhost");
        assert_eq!(ip, None);
    }

    #[test]
    fn test_parse_address_arg() {
        assert_eq!(
            parse_address_arg(b"<user@example.com>\0BODY=8BITMIME\0").unwrap(),
            "user@example.com"
        );
        assert_eq!(parse_address_arg(b"<>\0").unwrap(), "");
    }

    #[test]
    fn test_parse_header() {
        let (name, value) = parse_header(b"Subject\0hello world\0").unwrap();
        assert_eq!(name, "Subject");
        assert_eq!(value, "hello world");
    }
}
