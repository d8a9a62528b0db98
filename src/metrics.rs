use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

lazy_static! {
    pub static ref FORKED_CHILDREN: IntCounter = register_int_counter!(
        "authmilter_forked_children_total",
        "Workers forked by the supervisor"
    )
    .unwrap();
    pub static ref REAPED_CHILDREN: IntCounter = register_int_counter!(
        "authmilter_reaped_children_total",
        "Workers reaped by the supervisor"
    )
    .unwrap();
    static ref CONNECTIONS: IntCounterVec = register_int_counter_vec!(
        "authmilter_connections_total",
        "Connections accepted, by listener",
        &["listener"]
    )
    .unwrap();
    static ref MESSAGES: IntCounterVec = register_int_counter_vec!(
        "authmilter_messages_total",
        "Messages processed, by final disposition",
        &["disposition"]
    )
    .unwrap();
    static ref HANDLER_ERRORS: IntCounterVec = register_int_counter_vec!(
        "authmilter_handler_errors_total",
        "Handler callbacks that raised a typed error",
        &["handler", "kind"]
    )
    .unwrap();
    static ref STAGE_SECONDS: HistogramVec = register_histogram_vec!(
        "authmilter_stage_seconds",
        "Wall-clock seconds spent dispatching one lifecycle stage",
        &["stage"]
    )
    .unwrap();
    static ref CHILD_CHANNEL: Mutex<Option<ChildChannel>> = Mutex::new(None);
}

/// Worker end of the supervisor's child-communication socketpair.
struct ChildChannel {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

/// Install the worker end of the child channel; called once after fork.
pub fn set_child_channel(stream: UnixStream) -> anyhow::Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    *CHILD_CHANNEL.lock().unwrap() = Some(ChildChannel { writer: stream, reader });
    Ok(())
}

fn send_line(line: &str) {
    if let Some(channel) = CHILD_CHANNEL.lock().unwrap().as_mut() {
        if writeln!(channel.writer, "{line}").is_err() {
            log::trace!("child channel write failed");
        }
    }
}

/// Report worker state to the supervisor (spare-worker accounting).
pub fn report_status(processing: bool) {
    send_line(if processing { "status processing" } else { "status waiting" });
}

pub fn connection(listener: &str) {
    CONNECTIONS.with_label_values(&[listener]).inc();
    send_line(&format!(
        "count authmilter_connections_total{{listener=\"{listener}\"}} 1"
    ));
}

pub fn message(disposition: &str) {
    MESSAGES.with_label_values(&[disposition]).inc();
    send_line(&format!(
        "count authmilter_messages_total{{disposition=\"{disposition}\"}} 1"
    ));
}

pub fn handler_error(handler: &str, kind: &str) {
    HANDLER_ERRORS.with_label_values(&[handler, kind]).inc();
    send_line(&format!(
        "count authmilter_handler_errors_total{{handler=\"{handler}\",kind=\"{kind}\"}} 1"
    ));
}

pub fn stage_timer(stage: &str, seconds: f64) {
    STAGE_SECONDS.with_label_values(&[stage]).observe(seconds);
    send_line(&format!("timer {stage} {seconds}"));
}

/// A handler-declared counter increment, forwarded for aggregation like
/// the framework counters.
pub fn handler_count(metric: &str, labels: &str, delta: u64) {
    send_line(&format!("count {metric}{labels} {delta}"));
}

fn local_exposition() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::default_registry().gather())
        .unwrap_or_default()
}

/// Cross-process aggregate held by the supervisor; fed by the per-child
/// channel threads, rendered on scrape.
#[derive(Default)]
pub struct Aggregator {
    counters: Mutex<BTreeMap<String, f64>>,
    timers: Mutex<BTreeMap<String, (f64, u64)>>,
}

/// A parsed child-channel line, for the supervisor's bookkeeping.
pub enum ChildReport {
    Waiting,
    Processing,
    DumpRequested,
    Metric,
    Unknown,
}

impl Aggregator {
    /// Apply one line of the child protocol; returns what the supervisor
    /// needs to act on (status flips and dump requests).
    pub fn apply_line(&self, line: &str) -> ChildReport {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("status") => match parts.next() {
                Some("waiting") => ChildReport::Waiting,
                Some("processing") => ChildReport::Processing,
                _ => ChildReport::Unknown,
            },
            Some("count") => {
                if let (Some(key), Some(delta)) = (parts.next(), parts.next()) {
                    if let Ok(delta) = delta.parse::<f64>() {
                        *self.counters.lock().unwrap().entry(key.to_string()).or_insert(0.0) +=
                            delta;
                        return ChildReport::Metric;
                    }
                }
                ChildReport::Unknown
            }
            Some("timer") => {
                if let (Some(stage), Some(seconds)) = (parts.next(), parts.next()) {
                    if let Ok(seconds) = seconds.parse::<f64>() {
                        let mut timers = self.timers.lock().unwrap();
                        let entry = timers.entry(stage.to_string()).or_insert((0.0, 0));
                        entry.0 += seconds;
                        entry.1 += 1;
                        return ChildReport::Metric;
                    }
                }
                ChildReport::Unknown
            }
            Some("dump") => ChildReport::DumpRequested,
            _ => ChildReport::Unknown,
        }
    }

    /// Render the supervisor's own registry plus everything aggregated
    /// from the children, in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = local_exposition();
        let counters = self.counters.lock().unwrap();
        let mut last_family = "";
        for (key, value) in counters.iter() {
            let family = key.split('{').next().unwrap_or(key);
            if family != last_family {
                out.push_str(&format!("# TYPE {family} counter\n"));
                last_family = family;
            }
            out.push_str(&format!("{key} {value}\n"));
        }
        let timers = self.timers.lock().unwrap();
        if !timers.is_empty() {
            out.push_str("# TYPE authmilter_stage_seconds_aggregate summary\n");
            for (stage, (sum, count)) in timers.iter() {
                out.push_str(&format!(
                    "authmilter_stage_seconds_aggregate_sum{{stage=\"{stage}\"}} {sum}\n"
                ));
                out.push_str(&format!(
                    "authmilter_stage_seconds_aggregate_count{{stage=\"{stage}\"}} {count}\n"
                ));
            }
        }
        out
    }
}

/// Ask the supervisor for the aggregated exposition over the child
/// channel. The reply is terminated by a line containing a single `.`.
fn dump_from_parent() -> Option<String> {
    let mut guard = CHILD_CHANNEL.lock().unwrap();
    let channel = guard.as_mut()?;
    writeln!(channel.writer, "dump").ok()?;
    let mut body = String::new();
    loop {
        let mut line = String::new();
        match channel.reader.read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {
                if line.trim_end() == "." {
                    return Some(body);
                }
                body.push_str(&line);
            }
        }
    }
}

/// Serve one metrics scrape on an accepted sideband connection. Scrapes
/// are stateless and read-only; they never touch connection state.
pub fn serve_scrape<S: Read + Write>(stream: &mut S) -> anyhow::Result<()> {
    // Consume the request head; we answer any GET the same way.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf)?;

    let body = dump_from_parent().unwrap_or_else(local_exposition);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregator_sums_counter_deltas() {
        let agg = Aggregator::default();
        agg.apply_line("count authmilter_messages_total{disposition=\"continue\"} 1");
        agg.apply_line("count authmilter_messages_total{disposition=\"continue\"} 1");
        agg.apply_line("count authmilter_messages_total{disposition=\"reject\"} 1");
        let rendered = agg.render();
        assert!(rendered.contains("authmilter_messages_total{disposition=\"continue\"} 2"));
        assert!(rendered.contains("authmilter_messages_total{disposition=\"reject\"} 1"));
    }

    #[test]
    fn test_aggregator_status_lines() {
        let agg = Aggregator::default();
        assert!(matches!(agg.apply_line("status waiting"), ChildReport::Waiting));
        assert!(matches!(agg.apply_line("status processing"), ChildReport::Processing));
        assert!(matches!(agg.apply_line("dump"), ChildReport::DumpRequested));
        assert!(matches!(agg.apply_line("garbage line"), ChildReport::Unknown));
    }

    #[test]
    fn test_aggregator_timers() {
        let agg = Aggregator::default();
        agg.apply_line("timer eom 0.25");
        agg.apply_line("timer eom 0.75");
        let rendered = agg.render();
        assert!(rendered.contains("authmilter_stage_seconds_aggregate_sum{stage=\"eom\"} 1"));
        assert!(rendered.contains("authmilter_stage_seconds_aggregate_count{stage=\"eom\"} 2"));
    }
}
