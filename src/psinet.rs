use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedEntry {
    pub id: String,
    pub name: String,
}

/// On-disk shape of the psinet export.
#[derive(Debug, Default, Deserialize)]
struct PsinetExport {
    #[serde(default)]
    servers: Vec<ServerEntry>,
    #[serde(default)]
    deleted_servers: Vec<ServerEntry>,
    #[serde(default)]
    sponsors: Vec<NamedEntry>,
    #[serde(default)]
    propagation_channels: Vec<NamedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLookup<'a> {
    Live(&'a str),
    Deleted(&'a str),
    Unknown,
}

impl ServerLookup<'_> {
    /// Placeholder that replaces the address in stored records.
    pub fn display_id(&self) -> String {
        match self {
            ServerLookup::Live(id) => format!("[{id}]"),
            ServerLookup::Deleted(id) => format!("[{id}][DELETED]"),
            ServerLookup::Unknown => "[UNKNOWN]".to_string(),
        }
    }
}

/// Operator inventory of servers, sponsors and propagation channels,
/// indexed for the lookups the sanitizer needs.
#[derive(Debug, Clone, Default)]
pub struct Psinet {
    servers_by_ip: HashMap<String, String>,
    deleted_servers_by_ip: HashMap<String, String>,
    sponsor_names: HashMap<String, String>,
    propagation_channel_names: HashMap<String, String>,
}

impl Psinet {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read psinet file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse psinet file: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let export: PsinetExport = serde_json::from_str(content)?;
        Ok(Self::from_export(export))
    }

    fn from_export(export: PsinetExport) -> Self {
        let index = |entries: Vec<ServerEntry>| {
            entries
                .into_iter()
                .map(|s| (s.ip_address, s.id))
                .collect::<HashMap<_, _>>()
        };
        let names = |entries: Vec<NamedEntry>| {
            entries
                .into_iter()
                .map(|e| (e.id, e.name))
                .collect::<HashMap<_, _>>()
        };

        let psinet = Psinet {
            servers_by_ip: index(export.servers),
            deleted_servers_by_ip: index(export.deleted_servers),
            sponsor_names: names(export.sponsors),
            propagation_channel_names: names(export.propagation_channels),
        };
        log::debug!(
            "Loaded psinet: {} servers, {} deleted, {} sponsors, {} channels",
            psinet.servers_by_ip.len(),
            psinet.deleted_servers_by_ip.len(),
            psinet.sponsor_names.len(),
            psinet.propagation_channel_names.len()
        );
        psinet
    }

    pub fn lookup_server(&self, ip: &str) -> ServerLookup<'_> {
        if let Some(id) = self.servers_by_ip.get(ip) {
            ServerLookup::Live(id)
        } else if let Some(id) = self.deleted_servers_by_ip.get(ip) {
            ServerLookup::Deleted(id)
        } else {
            ServerLookup::Unknown
        }
    }

    pub fn is_known_server(&self, ip: &str) -> bool {
        !matches!(self.lookup_server(ip), ServerLookup::Unknown)
    }

    pub fn sponsor_name(&self, sponsor_id: &str) -> Option<&str> {
        self.sponsor_names.get(sponsor_id).map(String::as_str)
    }

    pub fn propagation_channel_name(&self, channel_id: &str) -> Option<&str> {
        self.propagation_channel_names
            .get(channel_id)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "servers": [{"id": "srv-1", "ip_address": "192.0.2.10"}],
        "deleted_servers": [{"id": "srv-0", "ip_address": "192.0.2.9"}],
        "sponsors": [{"id": "SP1", "name": "Sponsor One"}],
        "propagation_channels": [{"id": "PC1", "name": "Channel One"}]
    }"#;

    #[test]
    fn test_server_lookup() {
        let psinet = Psinet::from_json(SAMPLE).unwrap();
        assert_eq!(psinet.lookup_server("192.0.2.10").display_id(), "[srv-1]");
        assert_eq!(
            psinet.lookup_server("192.0.2.9").display_id(),
            "[srv-0][DELETED]"
        );
        assert_eq!(psinet.lookup_server("10.0.0.1").display_id(), "[UNKNOWN]");
        assert!(psinet.is_known_server("192.0.2.9"));
    }

    #[test]
    fn test_names() {
        let psinet = Psinet::from_json(SAMPLE).unwrap();
        assert_eq!(psinet.sponsor_name("SP1"), Some("Sponsor One"));
        assert_eq!(psinet.propagation_channel_name("PC1"), Some("Channel One"));
        assert_eq!(psinet.sponsor_name("nope"), None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let psinet = Psinet::from_file(file.path()).unwrap();
        assert!(psinet.is_known_server("192.0.2.10"));

        assert!(Psinet::from_file(Path::new("/nonexistent/psinet.json")).is_err());
    }

    #[test]
    fn test_empty_export_is_valid() {
        let psinet = Psinet::from_json("{}").unwrap();
        assert_eq!(psinet.lookup_server("192.0.2.10"), ServerLookup::Unknown);
    }
}
