use crate::store::{StatsSummary, StoredRecord};
use crate::transform::{Registry, DEFAULT_TEMPLATE};
use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tera::{Context, Tera};

pub const STATS_TEMPLATE: &str = "stats.html";
pub const STATS_WARNING_TEMPLATE: &str = "stats_warning.html";

/// Nesting below this depth is rendered as a single JSON string. The
/// recursive `tree` macro must not follow client-controlled depth.
pub const MAX_RENDER_DEPTH: usize = 16;

const TEMPLATES: &[(&str, &str)] = &[
    ("macros.html", include_str!("../templates/macros.html")),
    ("base_style.html", include_str!("../templates/base_style.html")),
    (DEFAULT_TEMPLATE, include_str!("../templates/feedback_default.html")),
    (
        "feedback_windows.html",
        include_str!("../templates/feedback_windows.html"),
    ),
    (
        "feedback_android.html",
        include_str!("../templates/feedback_android.html"),
    ),
    (STATS_TEMPLATE, include_str!("../templates/stats.html")),
    (
        STATS_WARNING_TEMPLATE,
        include_str!("../templates/stats_warning.html"),
    ),
];

/// Ingestion rate warning, rendered into the warning email.
#[derive(Debug, Clone, Serialize)]
pub struct RateWarning {
    pub recs_per_min: f64,
    pub interval_mins: f64,
    pub warning_threshold: f64,
}

/// Renders HTML email bodies. Every `.html` template is autoescaped; record
/// contents are attacker-controlled.
pub struct Templater {
    tera: Tera,
    registry: Arc<Registry>,
}

impl Templater {
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![".html"]);
        tera.add_raw_templates(TEMPLATES.to_vec())
            .context("Failed to load email templates")?;
        Ok(Templater { tera, registry })
    }

    fn template_for(&self, stored: &StoredRecord) -> &'static str {
        let name = self.registry.lookup(&stored.record.schema()).template;
        if self.tera.get_template_names().any(|n| n == name) {
            name
        } else {
            log::warn!("Template {name} is not loaded, using {DEFAULT_TEMPLATE}");
            DEFAULT_TEMPLATE
        }
    }

    /// Renders the reply body for a record, or `None` if rendering fails.
    pub fn render_record(&self, stored: &StoredRecord) -> Option<String> {
        let metadata = &stored.record.metadata;
        let feedback_text = stored
            .record
            .feedback()
            .and_then(|f| f.message)
            .and_then(|m| m.text);

        let mut context = Context::new();
        context.insert("platform", metadata.platform.as_str());
        context.insert("platform_name", &metadata.platform.display_name());
        context.insert("version", &metadata.version);
        context.insert("id", &metadata.id);
        context.insert("record_id", &stored.record_id.0);
        context.insert("received_at", &stored.received_at.to_rfc3339());
        context.insert("feedback_text", &feedback_text);
        context.insert("data", &clip_depth(&stored.record.tree, MAX_RENDER_DEPTH));

        self.render(self.template_for(stored), &context)
    }

    pub fn render_stats(&self, summary: &StatsSummary) -> Option<String> {
        let context = Context::from_serialize(summary)
            .map_err(|e| log::error!("Failed to build stats context: {e}"))
            .ok()?;
        self.render(STATS_TEMPLATE, &context)
    }

    pub fn render_stats_warning(&self, warning: &RateWarning) -> Option<String> {
        let context = Context::from_serialize(warning)
            .map_err(|e| log::error!("Failed to build warning context: {e}"))
            .ok()?;
        self.render(STATS_WARNING_TEMPLATE, &context)
    }

    fn render(&self, name: &str, context: &Context) -> Option<String> {
        let html = match self.tera.render(name, context) {
            Ok(html) => html,
            Err(e) => {
                log::warn!("Failed to render {name}: {}", error_chain(&e));
                return None;
            }
        };
        match css_inline::inline(&html) {
            Ok(inlined) => Some(inlined),
            Err(e) => {
                log::warn!("Failed to inline CSS for {name}: {e}");
                None
            }
        }
    }
}

fn error_chain(e: &tera::Error) -> String {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Copy of `value` with every container at `depth` replaced by its compact
/// JSON text.
pub fn clip_depth(value: &Value, depth: usize) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) if depth == 0 => Value::String(value.to_string()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), clip_depth(v, depth - 1)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| clip_depth(v, depth - 1)).collect())
        }
        other => other.clone(),
    }
}

/// Plaintext body: the record as YAML.
pub fn plaintext_body(tree: &Value) -> String {
    serde_yaml::to_string(tree).unwrap_or_else(|_| tree.to_string())
}
