use crate::authres;
use crate::config::{Config, ListenerSpec, NetworkClassifier};
use crate::context::{Disposition, SessionContext};
use crate::dns::Resolver;
use crate::metrics;
use crate::milter::ConnOutcome;
use crate::pipeline::{Pipeline, StageEvent};
use anyhow::{bail, Context};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// SMTP front-end for deployments without milter support.
///
/// Speaks SMTP with the upstream MTA, buffers the DATA phase, synthesizes
/// the same lifecycle stages the milter engine would, prepends the
/// resulting headers, and forwards the message to the configured
/// `smtp.forward` target. Handler behavior is identical to the milter
/// path: same order, same fragments.
pub struct SmtpConnection<'a, S: Read + Write> {
    reader: BufReader<S>,
    writer: &'a mut dyn Write,
    pipeline: &'a mut Pipeline,
    config: &'a Config,
    classifier: &'a NetworkClassifier,
    resolver: &'a Arc<Resolver>,
    ctx: SessionContext,
    messages: usize,
    budget: usize,
}

pub fn handle_connection<S: TryCloneSplit>(
    stream: S,
    peer_ip: Option<IpAddr>,
    pipeline: &mut Pipeline,
    config: &Config,
    classifier: &NetworkClassifier,
    resolver: &Arc<Resolver>,
    budget: usize,
) -> anyhow::Result<ConnOutcome> {
    let (read_half, mut write_half) = stream.split()?;
    let mut conn = SmtpConnection {
        reader: BufReader::new(read_half),
        writer: &mut write_half,
        pipeline,
        config,
        classifier,
        resolver,
        ctx: SessionContext::new(),
        messages: 0,
        budget,
    };
    conn.run(peer_ip)
}

/// Splitting a bidirectional stream into independently owned halves;
/// implemented by both socket types via `try_clone`.
pub trait TryCloneSplit: Sized {
    type Half: Read + Write;
    fn split(self) -> anyhow::Result<(Self::Half, Self::Half)>;
}

impl TryCloneSplit for TcpStream {
    type Half = TcpStream;
    fn split(self) -> anyhow::Result<(TcpStream, TcpStream)> {
        let other = self.try_clone()?;
        Ok((self, other))
    }
}

impl TryCloneSplit for UnixStream {
    type Half = UnixStream;
    fn split(self) -> anyhow::Result<(UnixStream, UnixStream)> {
        let other = self.try_clone()?;
        Ok((self, other))
    }
}

impl<S: Read + Write> SmtpConnection<'_, S> {
    fn run(&mut self, peer_ip: Option<IpAddr>) -> anyhow::Result<ConnOutcome> {
        let server_id = self.config.effective_server_id();
        self.reply(&format!("220 {server_id} ESMTP"))?;

        self.ctx.client_ip = peer_ip;
        // The milter engine is told the client name by the MTA; here we
        // must resolve it ourselves.
        let hostname = match peer_ip {
            Some(ip) => {
                let (local, trusted) = self.classifier.classify(ip);
                self.ctx.is_local_ip_address = local;
                self.ctx.is_trusted_ip_address = trusted;
                match self.resolver.verified_ptr(ip) {
                    Ok(Some(name)) => {
                        self.ctx.client_rdns = Some(name.clone());
                        self.ctx.verified_ptr = Some(name.clone());
                        name
                    }
                    _ => format!("[{ip}]"),
                }
            }
            None => "localhost".to_string(),
        };
        self.ctx.client_name = hostname.clone();
        self.pipeline.dispatch(
            &mut self.ctx,
            &StageEvent::Connect {
                hostname: &hostname,
                ip: peer_ip,
            },
        );

        loop {
            let Some(line) = self.read_line()? else {
                break;
            };
            let (verb, arg) = split_verb(&line);
            match verb.as_str() {
                "HELO" | "EHLO" => {
                    let helo = arg.trim().to_string();
                    self.ctx.helo_name = Some(helo.clone());
                    self.pipeline.dispatch(&mut self.ctx, &StageEvent::Helo(&helo));
                    if verb == "EHLO" {
                        self.reply(&format!("250-{server_id}\r\n250 8BITMIME"))?;
                    } else {
                        self.reply(&format!("250 {server_id}"))?;
                    }
                }
                "MAIL" => {
                    let Some(addr) = parse_path_arg(&arg, "FROM") else {
                        self.reply("501 5.5.4 Syntax: MAIL FROM:<address>")?;
                        continue;
                    };
                    self.ctx.envelope_from = Some(addr.clone());
                    self.pipeline.dispatch(&mut self.ctx, &StageEvent::EnvFrom(&addr));
                    self.reply("250 2.1.0 Ok")?;
                }
                "RCPT" => {
                    if self.ctx.envelope_from.is_none() {
                        self.reply("503 5.5.1 Need MAIL before RCPT")?;
                        continue;
                    }
                    let Some(addr) = parse_path_arg(&arg, "TO") else {
                        self.reply("501 5.5.4 Syntax: RCPT TO:<address>")?;
                        continue;
                    };
                    self.ctx.envelope_rcpt.push(addr.clone());
                    self.pipeline.dispatch(&mut self.ctx, &StageEvent::EnvRcpt(&addr));
                    self.reply("250 2.1.5 Ok")?;
                }
                "DATA" => {
                    if self.ctx.envelope_rcpt.is_empty() {
                        self.reply("503 5.5.1 Need RCPT before DATA")?;
                        continue;
                    }
                    self.reply("354 End data with <CR><LF>.<CR><LF>")?;
                    let message = self.read_data()?;
                    self.finish_message(&message)?;
                    if self.messages >= self.budget {
                        self.reply("421 4.3.2 Closing connection")?;
                        break;
                    }
                }
                "RSET" => {
                    self.pipeline.dispatch(&mut self.ctx, &StageEvent::Abort);
                    self.ctx.abort_message();
                    self.reply("250 2.0.0 Ok")?;
                }
                "NOOP" => self.reply("250 2.0.0 Ok")?,
                "QUIT" => {
                    self.reply(&format!("221 2.0.0 {server_id} closing"))?;
                    break;
                }
                _ => self.reply("502 5.5.2 Command not implemented")?,
            }
        }

        self.pipeline.dispatch(&mut self.ctx, &StageEvent::Close);
        Ok(ConnOutcome {
            messages: self.messages,
            exit_on_close: self.ctx.exit_on_close,
            exit_on_close_error: self.ctx.exit_on_close_error.clone(),
        })
    }

    /// Replay the buffered message through the header/eoh/body stages,
    /// finalize, prepend our headers, and forward or refuse.
    fn finish_message(&mut self, message: &[u8]) -> anyhow::Result<()> {
        let (headers, body) = split_message(message);
        for (name, value) in &headers {
            self.pipeline.dispatch(
                &mut self.ctx,
                &StageEvent::Header {
                    name,
                    value,
                },
            );
        }
        self.pipeline.dispatch(&mut self.ctx, &StageEvent::Eoh);
        if !body.is_empty() {
            self.pipeline.dispatch(&mut self.ctx, &StageEvent::Body(&body));
        }
        self.pipeline.dispatch(&mut self.ctx, &StageEvent::Eom);

        let server_id = self.config.effective_server_id();
        let auth_results = authres::assemble(&server_id, self.ctx.result_fragments());
        let mut prefix = format!("Authentication-Results: {auth_results}\r\n");
        for (name, value) in self.ctx.extra_headers() {
            prefix.push_str(&format!("{name}: {value}\r\n"));
        }

        let disposition = self.ctx.disposition();
        let reason = self.ctx.disposition_reason().unwrap_or("").to_string();
        match disposition {
            Disposition::Reject => {
                let text = if reason.is_empty() { "Rejected" } else { &reason };
                self.reply(&format!("550 5.7.1 {text}"))?;
            }
            Disposition::Tempfail => {
                let text = if reason.is_empty() { "Try again later" } else { &reason };
                self.reply(&format!("451 4.7.1 {text}"))?;
            }
            Disposition::Discard => {
                // Swallowed: the client sees success, nothing is forwarded.
                self.reply("250 2.0.0 Ok: discarded")?;
            }
            Disposition::Continue | Disposition::Accept | Disposition::Quarantine => {
                let envelope_from = self.ctx.envelope_from.clone().unwrap_or_default();
                let rcpts = self.ctx.envelope_rcpt.clone();
                match forward_message(
                    self.config,
                    &envelope_from,
                    &rcpts,
                    prefix.as_bytes(),
                    message,
                ) {
                    Ok(()) => self.reply("250 2.0.0 Ok: forwarded")?,
                    Err(err) => {
                        log::error!("forwarding failed: {err:#}");
                        self.reply("451 4.4.1 Upstream unavailable")?;
                    }
                }
            }
        }

        metrics::message(disposition.as_token());
        self.messages += 1;
        self.ctx.end_message();
        Ok(())
    }

    fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Read until the lone-dot terminator, undoing dot-stuffing.
    fn read_data(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = self.reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                bail!("connection closed during DATA");
            }
            let trimmed: &[u8] = if line.ends_with(b"\r\n") {
                &line[..line.len() - 2]
            } else if line.ends_with(b"\n") {
                &line[..line.len() - 1]
            } else {
                &line[..]
            };
            if trimmed == b"." {
                return Ok(message);
            }
            let unstuffed = if trimmed.starts_with(b".") { &trimmed[1..] } else { trimmed };
            message.extend_from_slice(unstuffed);
            message.extend_from_slice(b"\r\n");
        }
    }

    fn reply(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

fn split_verb(line: &str) -> (String, String) {
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.to_string()),
        None => (line.to_ascii_uppercase(), String::new()),
    }
}

/// `FROM:<addr>` / `TO:<addr>`, tolerating optional whitespace and
/// trailing ESMTP parameters.
fn parse_path_arg(arg: &str, keyword: &str) -> Option<String> {
    let rest = arg.trim();
    let prefix = format!("{keyword}:");
    if !rest.to_ascii_uppercase().starts_with(&prefix) {
        return None;
    }
    let rest = rest[prefix.len()..].trim_start();
    let path = rest.split_whitespace().next().unwrap_or("");
    Some(crate::handlers::spf::strip_angles(path))
}

/// Split a buffered message into unfolded headers and the body.
fn split_message(message: &[u8]) -> (Vec<(String, String)>, Vec<u8>) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut offset = 0;

    let text = message;
    while offset < text.len() {
        let line_end = text[offset..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| offset + p)
            .unwrap_or(text.len());
        let line = &text[offset..line_end];
        let next = (line_end + 2).min(text.len());

        if line.is_empty() {
            // Blank separator: the rest is the body.
            return (headers, text[next..].to_vec());
        }
        if (line[0] == b' ' || line[0] == b'\t') && !headers.is_empty() {
            // Folded continuation joins the previous header.
            let (_, value) = headers.last_mut().unwrap();
            value.push_str("\r\n");
            value.push_str(&String::from_utf8_lossy(line));
        } else {
            let text_line = String::from_utf8_lossy(line);
            match text_line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim_start().to_string()));
                }
                None => {
                    // Not a header; treat the remainder as body.
                    return (headers, text[offset..].to_vec());
                }
            }
        }
        offset = next;
    }
    (headers, Vec::new())
}

/// Minimal SMTP client conversation delivering the processed message, our
/// headers first, to the configured upstream.
fn forward_message(
    config: &Config,
    envelope_from: &str,
    rcpts: &[String],
    prefix: &[u8],
    message: &[u8],
) -> anyhow::Result<()> {
    let smtp = config
        .smtp
        .as_ref()
        .context("no smtp.forward target configured")?;
    let spec: ListenerSpec = smtp.forward.parse()?;
    match spec {
        ListenerSpec::Inet { port, host } => {
            let stream = TcpStream::connect((host.as_str(), port))?;
            forward_on(stream, config, envelope_from, rcpts, prefix, message)
        }
        ListenerSpec::Unix { path } => {
            let stream = UnixStream::connect(path)?;
            forward_on(stream, config, envelope_from, rcpts, prefix, message)
        }
    }
}

fn forward_on<S: TryCloneSplit>(
    stream: S,
    config: &Config,
    envelope_from: &str,
    rcpts: &[String],
    prefix: &[u8],
    message: &[u8],
) -> anyhow::Result<()> {
    let (read_half, mut writer) = stream.split()?;
    let mut reader = BufReader::new(read_half);

    let mut expect = |code: &str| -> anyhow::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                bail!("upstream closed connection");
            }
            // Multi-line replies continue while the 4th column is a dash.
            if line.len() >= 4 && &line[3..4] == "-" {
                continue;
            }
            if !line.starts_with(code) {
                bail!("upstream answered {}", line.trim_end());
            }
            return Ok(());
        }
    };

    let server_id = config.effective_server_id();
    expect("220")?;
    writer.write_all(format!("HELO {server_id}\r\n").as_bytes())?;
    expect("250")?;
    writer.write_all(format!("MAIL FROM:<{envelope_from}>\r\n").as_bytes())?;
    expect("250")?;
    for rcpt in rcpts {
        writer.write_all(format!("RCPT TO:<{rcpt}>\r\n").as_bytes())?;
        expect("250")?;
    }
    writer.write_all(b"DATA\r\n")?;
    expect("354")?;

    writer.write_all(prefix)?;
    // Re-apply dot-stuffing to the stored message.
    for line in message.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            writer.write_all(b".")?;
        }
        writer.write_all(line)?;
    }
    if !message.ends_with(b"\r\n") {
        writer.write_all(b"\r\n")?;
    }
    writer.write_all(b".\r\n")?;
    expect("250")?;
    writer.write_all(b"QUIT\r\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authres::Fragment;
    use crate::handler::{Handler, HandlerResult, Stage};
    use std::io::Cursor;

    struct RejectingHandler;

    impl Handler for RejectingHandler {
        fn name(&self) -> &'static str {
            "rejecting"
        }
        fn stages(&self) -> &'static [Stage] {
            &[Stage::Eom]
        }
        fn eom(&mut self, ctx: &mut SessionContext) -> HandlerResult {
            ctx.add_auth_header(Fragment::new("rejecting", "fail"));
            ctx.set_reject("go away");
            Ok(())
        }
    }

    fn session(input: &str, handlers: Vec<Box<dyn Handler>>) -> (ConnOutcome, String) {
        let mut pipeline = Pipeline::build(handlers).unwrap();
        let mut config = Config::default();
        config.authserv_id = Some("gw.example.net".to_string());
        let classifier = NetworkClassifier::from_config(&config).unwrap();
        let resolver = Arc::new(Resolver::new(None, 16).unwrap());

        let mut output = Vec::new();
        let mut conn = SmtpConnection {
            reader: BufReader::new(Cursor::new(input.as_bytes().to_vec())),
            writer: &mut output,
            pipeline: &mut pipeline,
            config: &config,
            classifier: &classifier,
            resolver: &resolver,
            ctx: SessionContext::new(),
            messages: 0,
            budget: 100,
        };
        let outcome = conn.run(None).unwrap();
        (outcome, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_rejecting_message_sees_550() {
        let input = "EHLO client.example\r\n\
                     MAIL FROM:<a@remote.example>\r\n\
                     RCPT TO:<b@local.example>\r\n\
                     DATA\r\n\
                     From: a@remote.example\r\n\
                     Subject: hi\r\n\
                     \r\n\
                     body\r\n\
                     .\r\n\
                     QUIT\r\n";
        let (outcome, output) = session(input, vec![Box::new(RejectingHandler)]);
        assert_eq!(outcome.messages, 1);
        assert!(output.contains("550 5.7.1 go away"));
        assert!(output.contains("221"));
    }

    #[test]
    fn test_rcpt_requires_mail() {
        let input = "HELO x\r\nRCPT TO:<b@local.example>\r\nQUIT\r\n";
        let (_, output) = session(input, Vec::new());
        assert!(output.contains("503"));
    }

    #[test]
    fn test_unknown_command() {
        let input = "HELO x\r\nVRFY someone\r\nQUIT\r\n";
        let (_, output) = session(input, Vec::new());
        assert!(output.contains("502"));
    }

    #[test]
    fn test_parse_path_arg() {
        assert_eq!(
            parse_path_arg("FROM:<user@example.com>", "FROM"),
            Some("user@example.com".to_string())
        );
        assert_eq!(
            parse_path_arg("from: <user@example.com> BODY=8BITMIME", "FROM"),
            Some("user@example.com".to_string())
        );
        assert_eq!(parse_path_arg("FROM:<>", "FROM"), Some(String::new()));
        assert_eq!(parse_path_arg("TO:<x@y>", "FROM"), None);
    }

    #[test]
    fn test_split_message_unfolds_headers() {
        let message = b"From: a@example.com\r\nSubject: one\r\n two\r\n\r\nbody line\r\n";
        let (headers, body) = split_message(message);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("From".to_string(), "a@example.com".to_string()));
        assert_eq!(headers[1].0, "Subject");
        assert!(headers[1].1.contains("two"));
        assert_eq!(body, b"body line\r\n".to_vec());
    }

    #[test]
    fn test_split_message_without_body() {
        let (headers, body) = split_message(b"From: a@b\r\n");
        assert_eq!(headers.len(), 1);
        assert!(body.is_empty());
    }

    #[test]
    fn test_dot_unstuffing() {
        let input = "HELO x\r\n\
                     MAIL FROM:<a@remote.example>\r\n\
                     RCPT TO:<b@local.example>\r\n\
                     DATA\r\n\
                     From: a@remote.example\r\n\
                     \r\n\
                     ..leading dot\r\n\
                     .\r\n\
                     QUIT\r\n";
        struct BodyProbe;
        impl Handler for BodyProbe {
            fn name(&self) -> &'static str {
                "bodyprobe"
            }
            fn stages(&self) -> &'static [Stage] {
                &[Stage::Body, Stage::Eom]
            }
            fn body(&mut self, ctx: &mut SessionContext, chunk: &[u8]) -> HandlerResult {
                assert_eq!(chunk, b".leading dot\r\n");
                ctx.set_discard();
                Ok(())
            }
        }
        let (outcome, output) = session(input, vec![Box::new(BodyProbe)]);
        assert_eq!(outcome.messages, 1);
        // Discarded mail is accepted and dropped, nothing forwarded.
        assert!(output.contains("250 2.0.0 Ok: discarded"));
    }
}
