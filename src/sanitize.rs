use crate::psinet::Psinet;
use crate::record::{DiagnosticRecord, RecordError};
use crate::redact::redact_sensitive_values;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::Arc;

lazy_static! {
    static ref IPV4_RE: Regex =
        Regex::new(r"\b(?:25[0-5]|2[0-4]\d|1?\d?\d)(?:\.(?:25[0-5]|2[0-4]\d|1?\d?\d)){3}\b")
            .unwrap();
}

/// Keys whose values are server addresses even when psinet doesn't know them.
const SERVER_ADDRESS_KEYS: &[&str] = &["ipaddress", "serverip", "serveripaddress", "serveraddress"];

fn is_server_address_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    SERVER_ADDRESS_KEYS.contains(&normalized.as_str())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeReport {
    pub addresses_replaced: usize,
    pub names_added: usize,
    pub values_redacted: usize,
}

/// Replaces server addresses with stable placeholders, annotates sponsor and
/// propagation channel ids with names, redacts sensitive log lines, and
/// finally checks that the record is still structurally sound.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    psinet: Arc<Psinet>,
    default_sponsor_name: String,
    default_propagation_channel_name: String,
}

impl Sanitizer {
    pub fn new(
        psinet: Arc<Psinet>,
        default_sponsor_name: impl Into<String>,
        default_propagation_channel_name: impl Into<String>,
    ) -> Self {
        Sanitizer {
            psinet,
            default_sponsor_name: default_sponsor_name.into(),
            default_propagation_channel_name: default_propagation_channel_name.into(),
        }
    }

    pub fn sanitize(&self, record: &mut DiagnosticRecord) -> Result<SanitizeReport, RecordError> {
        let mut report = SanitizeReport::default();
        self.walk(&mut record.tree, None, &mut report);
        report.values_redacted = redact_sensitive_values(&mut record.tree);
        record.check_sanity()?;

        if report != SanitizeReport::default() {
            log::debug!("Sanitized {}: {report:?}", record.metadata.id);
        }
        Ok(report)
    }

    fn walk(&self, value: &mut Value, key: Option<&str>, report: &mut SanitizeReport) {
        match value {
            Value::Object(map) => {
                report.names_added += self.add_names(map);
                for (child_key, child) in map.iter_mut() {
                    self.walk(child, Some(child_key.as_str()), report);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, key, report);
                }
            }
            Value::String(s) => {
                if let Some(replaced) = self.replace_addresses(s, key) {
                    *s = replaced.0;
                    report.addresses_replaced += replaced.1;
                }
            }
            _ => {}
        }
    }

    fn replace_addresses(&self, value: &str, key: Option<&str>) -> Option<(String, usize)> {
        // Address-typed fields are always replaced, known or not.
        if key.is_some_and(is_server_address_key) && IPV4_RE.is_match(value) {
            let trimmed = value.trim();
            if IPV4_RE
                .find(trimmed)
                .is_some_and(|m| m.start() == 0 && m.end() == trimmed.len())
            {
                return Some((self.psinet.lookup_server(trimmed).display_id(), 1));
            }
        }

        let mut count = 0;
        let replaced = IPV4_RE.replace_all(value, |caps: &Captures<'_>| {
            let ip = &caps[0];
            if self.psinet.is_known_server(ip) {
                count += 1;
                self.psinet.lookup_server(ip).display_id()
            } else {
                ip.to_string()
            }
        });
        (count > 0).then(|| (replaced.into_owned(), count))
    }

    fn add_names(&self, map: &mut Map<String, Value>) -> usize {
        let mut added = 0;
        if let Some(sponsor_id) = map.get("SPONSOR_ID").and_then(Value::as_str) {
            let name = self
                .psinet
                .sponsor_name(sponsor_id)
                .unwrap_or(&self.default_sponsor_name)
                .to_string();
            map.insert("SPONSOR_NAME".to_string(), Value::String(name));
            added += 1;
        }
        if let Some(channel_id) = map.get("PROPAGATION_CHANNEL_ID").and_then(Value::as_str) {
            let name = self
                .psinet
                .propagation_channel_name(channel_id)
                .unwrap_or(&self.default_propagation_channel_name)
                .to_string();
            map.insert("PROPAGATION_CHANNEL_NAME".to_string(), Value::String(name));
            added += 1;
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitizer() -> Sanitizer {
        let psinet = Psinet::from_json(
            r#"{
                "servers": [{"id": "srv-1", "ip_address": "192.0.2.10"}],
                "deleted_servers": [{"id": "srv-0", "ip_address": "192.0.2.9"}],
                "sponsors": [{"id": "SP1", "name": "Sponsor One"}],
                "propagation_channels": [{"id": "PC1", "name": "Channel One"}]
            }"#,
        )
        .unwrap();
        Sanitizer::new(Arc::new(psinet), "[UNKNOWN_SPONSOR]", "[UNKNOWN_CHANNEL]")
    }

    fn record(tree: Value) -> DiagnosticRecord {
        DiagnosticRecord::from_tree(tree).unwrap()
    }

    #[test]
    fn test_server_addresses_are_replaced() {
        let mut rec = record(json!({
            "Metadata": {"platform": "android", "version": 2, "id": "abc"},
            "ServerResponseCheck": [
                {"ipAddress": "192.0.2.10", "responded": true},
                {"ipAddress": "192.0.2.9"},
                {"ipAddress": "198.51.100.1"}
            ],
            "log": "connected to 192.0.2.10:443 via 203.0.113.5"
        }));
        let report = sanitizer().sanitize(&mut rec).unwrap();

        let checks = &rec.tree["ServerResponseCheck"];
        assert_eq!(checks[0]["ipAddress"], json!("[srv-1]"));
        assert_eq!(checks[1]["ipAddress"], json!("[srv-0][DELETED]"));
        assert_eq!(checks[2]["ipAddress"], json!("[UNKNOWN]"));
        assert_eq!(
            rec.tree["log"],
            json!("connected to [srv-1]:443 via 203.0.113.5")
        );
        assert_eq!(report.addresses_replaced, 4);
    }

    #[test]
    fn test_sponsor_and_channel_names_added() {
        let mut rec = record(json!({
            "Metadata": {"platform": "windows", "version": 1, "id": "w"},
            "DiagnosticInfo": {"SystemInformation": {"PsiphonInfo": {
                "SPONSOR_ID": "SP1",
                "PROPAGATION_CHANNEL_ID": "PCX"
            }}}
        }));
        let report = sanitizer().sanitize(&mut rec).unwrap();
        let info = &rec.tree["DiagnosticInfo"]["SystemInformation"]["PsiphonInfo"];
        assert_eq!(info["SPONSOR_NAME"], json!("Sponsor One"));
        assert_eq!(info["PROPAGATION_CHANNEL_NAME"], json!("[UNKNOWN_CHANNEL]"));
        assert_eq!(report.names_added, 2);
    }

    #[test]
    fn test_sanity_check_rejects_damaged_metadata() {
        let mut rec = record(json!({"Metadata": {"platform": "ios", "version": 1, "id": "i"}}));
        rec.tree["Metadata"]["version"] = json!("one");
        assert!(matches!(
            sanitizer().sanitize(&mut rec),
            Err(RecordError::NotSane(_))
        ));
    }

    #[test]
    fn test_redaction_runs_during_sanitize() {
        let mut rec = record(json!({
            "Metadata": {"platform": "windows", "version": 1, "id": "w"},
            "DiagnosticInfo": {
                "SystemInformation": {"PsiphonInfo": {"CLIENT_VERSION": "160"}},
                "StatusHistory": [{"message": "core panic: oops"}]
            }
        }));
        let report = sanitizer().sanitize(&mut rec).unwrap();
        assert_eq!(report.values_redacted, 1);
        assert_eq!(
            rec.tree["DiagnosticInfo"]["StatusHistory"][0]["message"],
            json!("core panic: [REDACTED]")
        );
    }

    #[test]
    fn test_address_key_normalisation() {
        assert!(is_server_address_key("ipAddress"));
        assert!(is_server_address_key("server_ip"));
        assert!(!is_server_address_key("clientIp"));
    }
}
