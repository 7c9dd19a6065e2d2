use crate::record::get_path;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

const UPSTREAM_PROXY_TARGET: &str = "upstreamproxy error: proxyURI url.Parse: parse ";
const EXTENSION_INFO_PREFIX: &str = "ExtensionInfo: ";
const PANIC_LINE_PREFIX: &str = "core panic: ";
const START_METHODS: &[&str] = &["Container", "Boot", "Crash", "Other", "OtherAfterSystemStop"];

lazy_static! {
    static ref DIAGNOSTIC_MSG_RE: Regex = Regex::new(r"^([a-zA-Z]+): (\{.*\})").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redactor {
    /// Truncates whatever follows a proxy URL parse failure.
    UpstreamProxyErrors,
    /// Keeps only `Event` and `StartMethod` of start-tunnel extension logs.
    IosVpnStartTunnel,
    /// Drops the body of panic lines.
    WindowsPanicLogs,
}

impl Redactor {
    fn apply(self, value: &str) -> Option<String> {
        match self {
            Redactor::UpstreamProxyErrors => redact_upstream_proxy_error(value),
            Redactor::IosVpnStartTunnel => redact_start_tunnel(value),
            Redactor::WindowsPanicLogs => redact_panic_line(value),
        }
    }
}

pub fn redactors_for(platform: &str, client_version: i64) -> Vec<Redactor> {
    let mut redactors = vec![Redactor::UpstreamProxyErrors];
    if platform == "ios-vpn" && client_version >= 160 {
        redactors.push(Redactor::IosVpnStartTunnel);
    } else if platform == "windows" && client_version == 160 {
        redactors.push(Redactor::WindowsPanicLogs);
    }
    redactors
}

fn client_version(tree: &Value) -> Option<i64> {
    match get_path(
        tree,
        &["DiagnosticInfo", "SystemInformation", "PsiphonInfo", "CLIENT_VERSION"],
    )? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Redacts sensitive values in string leaves, in place. Records without a
/// platform or client version are left untouched. Returns the number of
/// values changed.
pub fn redact_sensitive_values(tree: &mut Value) -> usize {
    let platform = match get_path(tree, &["Metadata", "platform"]).and_then(Value::as_str) {
        Some(p) => p.to_string(),
        None => return 0,
    };
    let version = match client_version(tree) {
        Some(v) => v,
        None => return 0,
    };
    let redactors = redactors_for(&platform, version);
    run_redactors(tree, &redactors)
}

fn run_redactors(value: &mut Value, redactors: &[Redactor]) -> usize {
    match value {
        Value::String(s) => {
            let mut changed = 0;
            for redactor in redactors {
                if let Some(redacted) = redactor.apply(s) {
                    *s = redacted;
                    changed += 1;
                }
            }
            changed
        }
        Value::Array(items) => items.iter_mut().map(|v| run_redactors(v, redactors)).sum(),
        Value::Object(map) => map.values_mut().map(|v| run_redactors(v, redactors)).sum(),
        _ => 0,
    }
}

fn redact_upstream_proxy_error(value: &str) -> Option<String> {
    let index = value.find(UPSTREAM_PROXY_TARGET)?;

    // Prefer keeping a "Prefix: {json}" message structurally intact.
    if let Some(caps) = DIAGNOSTIC_MSG_RE.captures(value) {
        if let Ok(mut inner) = serde_json::from_str::<Value>(&caps[2]) {
            if let Value::Object(map) = &mut inner {
                if redact_after_target(map) {
                    return Some(format!("{}: {}", &caps[1], inner));
                }
            }
        }
    }

    let end = index + UPSTREAM_PROXY_TARGET.len();
    let redacted = format!("{}<redacted>", &value[..end]);
    (redacted != value).then_some(redacted)
}

fn redact_after_target(map: &mut Map<String, Value>) -> bool {
    let mut redacted = false;
    for value in map.values_mut() {
        match value {
            Value::String(s) => {
                if let Some(index) = s.find(UPSTREAM_PROXY_TARGET) {
                    let end = index + UPSTREAM_PROXY_TARGET.len();
                    *s = format!("{}<redacted>", &s[..end]);
                    redacted = true;
                }
            }
            Value::Object(inner) => redacted |= redact_after_target(inner),
            _ => {}
        }
    }
    redacted
}

fn redact_start_tunnel(value: &str) -> Option<String> {
    let body = value.strip_prefix(EXTENSION_INFO_PREFIX)?;
    let parsed: Value = serde_json::from_str(body).ok()?;
    let provider = parsed.get("PacketTunnelProvider")?.as_object()?;
    if provider.get("Event").and_then(Value::as_str) != Some("Start") {
        return None;
    }

    let kept: Map<String, Value> = ["Event", "StartMethod"]
        .iter()
        .filter_map(|field| provider.get(*field).map(|v| (field.to_string(), v.clone())))
        .collect();

    if !is_valid_start_tunnel(&kept) {
        return Some("[REDACTED]".to_string());
    }
    let redacted = format!(
        "{EXTENSION_INFO_PREFIX}{}",
        json!({ "PacketTunnelProvider": kept })
    );
    (redacted != value).then_some(redacted)
}

fn is_valid_start_tunnel(fields: &Map<String, Value>) -> bool {
    fields.len() == 2
        && fields.get("Event").and_then(Value::as_str) == Some("Start")
        && fields
            .get("StartMethod")
            .and_then(Value::as_str)
            .is_some_and(|method| START_METHODS.contains(&method))
}

fn redact_panic_line(value: &str) -> Option<String> {
    if !value.starts_with(PANIC_LINE_PREFIX) {
        return None;
    }
    let redacted = format!("{PANIC_LINE_PREFIX}[REDACTED]");
    (redacted != value).then_some(redacted)
}
