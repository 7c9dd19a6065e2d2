use crate::config::{Config, Secret};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

pub const TARGET_LANGUAGE: &str = "en";
pub const INDETERMINATE: &str = "[INDETERMINATE]";
pub const TRANSLATION_FAIL: &str = "[TRANSLATION_FAIL]";

const DEFAULT_API_SERVER: &str = "www.googleapis.com";
const DETECT_PREFIX_CHARS: usize = 200;
const MAX_POST_REQUEST_SIZE: usize = 15000;
// Worst case: four UTF-8 bytes per char, tripled by URL encoding.
const FRAGMENT_CHARS: usize = (MAX_POST_REQUEST_SIZE - 200) / (4 * 3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub lang_code: String,
    pub lang_name: String,
    pub translated: Option<String>,
}

impl Translation {
    pub fn indeterminate() -> Self {
        Translation {
            lang_code: INDETERMINATE.to_string(),
            lang_name: "Language could not be determined".to_string(),
            translated: None,
        }
    }

    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Translation {
            lang_code: TRANSLATION_FAIL.to_string(),
            lang_name: reason.to_string(),
            translated: None,
        }
    }
}

/// Best-effort machine translation into English. Never fails; failures are
/// reported through the returned language code.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Translation;
}

/// Translator that reports every message as untranslatable. Used when no
/// API key is configured.
#[derive(Debug, Default)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, _text: &str) -> Translation {
        Translation::indeterminate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Languages,
    Detect,
    Translate,
}

impl Action {
    fn path_suffix(self) -> &'static str {
        match self {
            Action::Languages => "/languages",
            Action::Detect => "/detect",
            Action::Translate => "",
        }
    }
}

/// Google Translate v2 client with failover across API server aliases.
pub struct GoogleTranslator {
    client: Client,
    api_key: Secret,
    api_servers: Vec<String>,
    last_good_server: Mutex<Option<String>>,
    languages: tokio::sync::RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for GoogleTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleTranslator")
            .field("api_key", &self.api_key)
            .field("api_servers", &self.api_servers)
            .finish_non_exhaustive()
    }
}

impl GoogleTranslator {
    pub fn new(api_key: Secret, api_servers: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("feedback-decryptor/1.0")
            .build()
            .context("Failed to build translation HTTP client")?;

        let api_servers = if api_servers.is_empty() {
            vec![DEFAULT_API_SERVER.to_string()]
        } else {
            api_servers
        };

        Ok(GoogleTranslator {
            client,
            api_key,
            api_servers,
            last_good_server: Mutex::new(None),
            languages: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.google_api_key.clone(),
            config.google_api_servers.clone(),
            config.http_timeout(),
        )
    }

    /// Server order for the next request, last known-good first.
    fn server_order(&self) -> Vec<String> {
        let mut servers = self.api_servers.clone();
        let last_good = self
            .last_good_server
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(good) = last_good {
            if let Some(pos) = servers.iter().position(|s| *s == good) {
                let server = servers.remove(pos);
                servers.insert(0, server);
            }
        }
        servers
    }

    async fn request(&self, action: Action, params: &[(&str, &str)]) -> Result<Value> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("key", self.api_key.expose()));
        form.push(("target", TARGET_LANGUAGE));
        // Without this newlines are treated as HTML and stripped.
        form.push(("format", "text"));

        let mut last_error = None;
        for server in self.server_order() {
            let url = match endpoint(&server, action) {
                Ok(url) => url,
                Err(e) => {
                    log::warn!("Skipping translate server {server}: {e:#}");
                    last_error = Some(e);
                    continue;
                }
            };
            let response = self
                .client
                .post(url)
                .header("Host", DEFAULT_API_SERVER)
                .header("X-HTTP-Method-Override", "GET")
                .form(&form)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: Value = resp
                        .json()
                        .await
                        .with_context(|| format!("Invalid translate response from {server}"))?;
                    if let Ok(mut guard) = self.last_good_server.lock() {
                        *guard = Some(server.clone());
                    }
                    return Ok(body);
                }
                Ok(resp) => {
                    log::debug!("Translate request to {server} failed: {}", resp.status());
                    last_error = Some(anyhow!("{server} returned {}", resp.status()));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    log::debug!("Translate server {server} unreachable, failing over: {e}");
                    last_error = Some(anyhow!("{server} unreachable: {e}"));
                }
                Err(e) => {
                    log::error!("Translate request error: {e}");
                    return Err(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("translation fail")))
    }

    async fn ensure_languages(&self) -> Result<()> {
        if !self.languages.read().await.is_empty() {
            return Ok(());
        }
        let resp = self.request(Action::Languages, &[]).await?;
        let languages = resp["data"]["languages"]
            .as_array()
            .ok_or_else(|| anyhow!("languages response has no data.languages"))?
            .iter()
            .filter_map(|lang| {
                Some((
                    lang["language"].as_str()?.to_string(),
                    lang["name"].as_str()?.to_string(),
                ))
            })
            .collect::<HashMap<_, _>>();
        if languages.is_empty() {
            bail!("languages response was empty");
        }
        *self.languages.write().await = languages;
        Ok(())
    }

    async fn try_translate(&self, text: &str) -> Result<Translation> {
        self.ensure_languages().await?;

        let prefix = truncate_chars(text, DETECT_PREFIX_CHARS);
        let detected = self.request(Action::Detect, &[("q", prefix)]).await?;
        let detected_lang = detected["data"]["detections"][0][0]["language"]
            .as_str()
            .ok_or_else(|| anyhow!("detect response has no language"))?;

        let languages = self.languages.read().await;
        let from_lang = match resolve_language(&languages, detected_lang) {
            Some(code) => code,
            None => return Ok(Translation::indeterminate()),
        };
        let lang_name = languages
            .get(&from_lang)
            .cloned()
            .unwrap_or_else(|| from_lang.clone());
        drop(languages);

        if from_lang == TARGET_LANGUAGE {
            return Ok(Translation {
                lang_code: from_lang,
                lang_name,
                translated: Some(text.to_string()),
            });
        }

        let mut translated = String::new();
        for fragment in fragments(text, FRAGMENT_CHARS) {
            let resp = self
                .request(
                    Action::Translate,
                    &[("source", from_lang.as_str()), ("q", fragment)],
                )
                .await?;
            let piece = resp["data"]["translations"][0]["translatedText"]
                .as_str()
                .ok_or_else(|| anyhow!("translate response has no translatedText"))?;
            translated.push_str(piece);
        }

        Ok(Translation {
            lang_code: from_lang,
            lang_name,
            translated: Some(translated),
        })
    }
}

#[async_trait]
impl Translator for GoogleTranslator {
    async fn translate(&self, text: &str) -> Translation {
        match self.try_translate(text).await {
            Ok(translation) => translation,
            Err(e) => {
                log::warn!("Translation failed: {e:#}");
                Translation::failed(e)
            }
        }
    }
}

/// `zh-CN` style codes fall back to their base language.
fn endpoint(server: &str, action: Action) -> Result<Url> {
    let base = Url::parse(&format!("https://{server}/"))
        .with_context(|| format!("Invalid translate server address {server:?}"))?;
    base.join(&format!("language/translate/v2{}", action.path_suffix()))
        .context("Invalid translate endpoint")
}

fn resolve_language(languages: &HashMap<String, String>, detected: &str) -> Option<String> {
    if languages.contains_key(detected) {
        return Some(detected.to_string());
    }
    let base = detected.split('-').next().unwrap_or(detected);
    languages.contains_key(base).then(|| base.to_string())
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn fragments(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let piece = truncate_chars(rest, max_chars);
        pieces.push(piece);
        rest = &rest[piece.len()..];
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 200), "hi");
    }

    #[test]
    fn test_fragments_cover_whole_text() {
        let text = "ab€cd€e";
        let pieces = fragments(text, 3);
        assert_eq!(pieces, vec!["ab€", "cd€", "e"]);
        assert_eq!(pieces.concat(), text);
        assert!(fragments("", 3).is_empty());
    }

    #[test]
    fn test_endpoint_per_action() {
        assert_eq!(
            endpoint("www.googleapis.com", Action::Detect).unwrap().as_str(),
            "https://www.googleapis.com/language/translate/v2/detect"
        );
        assert_eq!(
            endpoint("203.0.113.5", Action::Translate).unwrap().as_str(),
            "https://203.0.113.5/language/translate/v2"
        );
    }

    #[test]
    fn test_resolve_language_falls_back_to_base() {
        let languages: HashMap<String, String> = [
            ("zh".to_string(), "Chinese".to_string()),
            ("en".to_string(), "English".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(resolve_language(&languages, "zh-CN"), Some("zh".to_string()));
        assert_eq!(resolve_language(&languages, "en"), Some("en".to_string()));
        assert_eq!(resolve_language(&languages, "und"), None);
    }

    #[test]
    fn test_server_order_prefers_last_good() {
        let translator = GoogleTranslator::new(
            Secret::new("k"),
            vec!["a.googleapis.com".into(), "b.googleapis.com".into()],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(translator.server_order()[0], "a.googleapis.com");
        *translator.last_good_server.lock().unwrap() = Some("b.googleapis.com".into());
        assert_eq!(translator.server_order()[0], "b.googleapis.com");
    }

    #[test]
    fn test_api_key_is_not_debug_printed() {
        let translator =
            GoogleTranslator::new(Secret::new("super-secret"), vec![], Duration::from_secs(1))
                .unwrap();
        assert!(!format!("{translator:?}").contains("super-secret"));
        assert_eq!(translator.api_servers, vec![DEFAULT_API_SERVER.to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_servers_yield_fail_code() {
        let translator = GoogleTranslator::new(
            Secret::new("k"),
            vec!["127.0.0.1:1".into()],
            Duration::from_millis(500),
        )
        .unwrap();
        let result = translator.translate("bonjour").await;
        assert_eq!(result.lang_code, TRANSLATION_FAIL);
        assert!(result.translated.is_none());
    }
}
