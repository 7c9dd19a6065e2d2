use crate::locale::convert_locale_info;
use crate::record::{get_path, get_path_mut, DiagnosticRecord, Platform, SchemaKey};
use crate::translate::Translator;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_TEMPLATE: &str = "feedback_default.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStep {
    /// Adds `text_lang_code`, `text_lang_name` and `text_translated` next to
    /// `Feedback.Message.text`.
    Translate,
    /// Parses `Feedback.Survey.json` into `Feedback.Survey.results`.
    ParseSurvey,
    /// Names the numeric `OSInfo` locale, language and country codes.
    ConvertLocaleInfo,
}

/// What a schema maps to: the steps applied before storage and the
/// template used for the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    pub steps: Vec<TransformStep>,
    pub template: &'static str,
}

impl SchemaEntry {
    pub fn new(steps: &[TransformStep], template: &'static str) -> Self {
        SchemaEntry {
            steps: steps.to_vec(),
            template,
        }
    }

    fn passthrough() -> Self {
        SchemaEntry::new(&[], DEFAULT_TEMPLATE)
    }
}

/// Lookup order: exact `(platform, version)`, then platform-wide, then the
/// pass-through default.
#[derive(Debug, Clone)]
pub struct Registry {
    exact: HashMap<SchemaKey, SchemaEntry>,
    by_platform: HashMap<Platform, SchemaEntry>,
    default: SchemaEntry,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            exact: HashMap::new(),
            by_platform: HashMap::new(),
            default: SchemaEntry::passthrough(),
        }
    }
}

impl Registry {
    pub fn standard() -> Self {
        use TransformStep::*;

        let mut registry = Registry::default();
        registry.register(
            SchemaKey::new(Platform::Windows, 1),
            SchemaEntry::new(
                &[Translate, ParseSurvey, ConvertLocaleInfo],
                "feedback_windows.html",
            ),
        );
        registry.register_platform(
            Platform::Windows,
            SchemaEntry::new(&[ParseSurvey, ConvertLocaleInfo], "feedback_windows.html"),
        );
        registry.register_platform(
            Platform::Android,
            SchemaEntry::new(&[ParseSurvey, ConvertLocaleInfo], "feedback_android.html"),
        );
        registry
    }

    pub fn register(&mut self, key: SchemaKey, entry: SchemaEntry) {
        self.exact.insert(key, entry);
    }

    pub fn register_platform(&mut self, platform: Platform, entry: SchemaEntry) {
        self.by_platform.insert(platform, entry);
    }

    pub fn lookup(&self, key: &SchemaKey) -> &SchemaEntry {
        self.exact
            .get(key)
            .or_else(|| self.by_platform.get(&key.platform))
            .unwrap_or(&self.default)
    }
}

pub struct Transformer {
    registry: Arc<Registry>,
    translator: Arc<dyn Translator>,
}

impl Transformer {
    pub fn new(registry: Arc<Registry>, translator: Arc<dyn Translator>) -> Self {
        Transformer {
            registry,
            translator,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Applies the registered steps in order. Steps are best-effort and
    /// never reject a record.
    pub async fn transform(&self, record: &mut DiagnosticRecord) {
        let key = record.schema();
        let steps = self.registry.lookup(&key).steps.clone();
        for step in steps {
            log::debug!("Applying {step:?} to {} ({key})", record.metadata.id);
            match step {
                TransformStep::Translate => self.translate_feedback(&mut record.tree).await,
                TransformStep::ParseSurvey => parse_survey_results(&mut record.tree),
                TransformStep::ConvertLocaleInfo => convert_locale_info(&mut record.tree),
            }
        }
    }

    async fn translate_feedback(&self, tree: &mut Value) {
        let text = match get_path(tree, &["Feedback", "Message", "text"]).and_then(Value::as_str)
        {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => return,
        };

        let translation = self.translator.translate(&text).await;

        if let Some(Value::Object(message)) = get_path_mut(tree, &["Feedback", "Message"]) {
            message.insert(
                "text_lang_code".to_string(),
                Value::String(translation.lang_code),
            );
            message.insert(
                "text_lang_name".to_string(),
                Value::String(translation.lang_name),
            );
            message.insert(
                "text_translated".to_string(),
                translation.translated.map_or(Value::Null, Value::String),
            );
        }
    }
}

fn parse_survey_results(tree: &mut Value) {
    if let Some(Value::Object(survey)) = get_path_mut(tree, &["Feedback", "Survey"]) {
        let results = survey
            .get("json")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .unwrap_or(Value::Null);
        survey.insert("results".to_string(), results);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::translate::{Translation, Translator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Translator that "translates" by upper-casing, counting calls.
    #[derive(Debug, Default)]
    pub struct UpperTranslator {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Translator for UpperTranslator {
        async fn translate(&self, text: &str) -> Translation {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Translation {
                lang_code: "fr".to_string(),
                lang_name: "French".to_string(),
                translated: Some(text.to_uppercase()),
            }
        }
    }
}
