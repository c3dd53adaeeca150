//! Template upload and render orchestration.
//!
//! The rendering engine is an external collaborator reached through
//! [`RenderEngine`]. This module owns everything around it: getting the
//! template into the cache, deriving output options, and caching reports.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::cache::{CacheEntry, ContentEncoding, ContentHash, extension_of};
use crate::infra::evictor::EvictionTrigger;
use crate::infra::file_cache::{FileCache, FileCacheError, StoredFile, WriteOptions};
use crate::infra::pins::EntryPins;

const SOURCE: &str = "application::templates";

/// Supported conversions, keyed by template extension.
const CONVERSIONS: &[(&str, &[&str])] = &[
    ("csv", &["csv", "doc", "docx", "html", "odt", "pdf", "rtf", "txt"]),
    ("docx", &["doc", "docx", "html", "odt", "pdf", "rtf", "txt"]),
    ("html", &["html", "odt", "pdf", "rtf", "txt"]),
    ("odt", &["doc", "docx", "html", "odt", "pdf", "rtf", "txt"]),
    ("pptx", &["odt", "pdf", "pptx", "ppt"]),
    ("rtf", &["docx", "pdf"]),
    ("txt", &["doc", "docx", "html", "odt", "pdf", "rtf", "txt"]),
    ("xlsx", &["odt", "pdf", "rtf", "txt", "csv", "xls", "xlsx"]),
];

/// Engine messages that point at a mistake in the template itself.
const AUTHORING_ERRORS: &[&str] = &["missing at least one", "cannot access parent object in"];

/// Output formats a template with extension `ext` can be rendered to.
pub fn supported_outputs(ext: &str) -> Option<&'static [&'static str]> {
    let ext = ext.to_ascii_lowercase();
    CONVERSIONS
        .iter()
        .find(|(input, _)| *input == ext)
        .map(|(_, outputs)| *outputs)
}

/// The full conversion dictionary, for listing endpoints.
pub fn conversion_dictionary() -> impl Iterator<Item = (&'static str, &'static [&'static str])> {
    CONVERSIONS.iter().copied()
}

/// Failure reported by the rendering engine.
#[derive(Debug, Clone, Error)]
#[error("Could not render template. {message}")]
pub struct EngineFailure {
    pub message: String,
}

impl EngineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// True when the message describes a template authoring mistake.
    pub fn is_authoring_error(&self) -> bool {
        let message = self.message.to_lowercase();
        if let Some(at) = message.find("formatter ")
            && message[at..].contains("does not exist")
        {
            return true;
        }
        AUTHORING_ERRORS
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Cache(#[from] FileCacheError),
    #[error(transparent)]
    Engine(#[from] EngineFailure),
}

impl RenderError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// HTTP status a route handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Cache(err) => err.http_status(),
            Self::Engine(failure) if failure.is_authoring_error() => 422,
            Self::Engine(_) => 500,
        }
    }
}

/// Caller-supplied render options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    pub convert_to: Option<String>,
    pub report_name: Option<String>,
    pub cache_report: bool,
    /// Remaining engine options, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderRequest {
    pub data: Value,
    pub options: RenderOptions,
    pub formatters: Option<Value>,
}

/// Options handed to the engine once defaults are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub convert_to: String,
    pub report_name: String,
    pub extra: Map<String, Value>,
    pub formatters: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub report: Bytes,
    pub report_name: String,
}

/// External rendering engine: merges `data` into the template at `template`
/// and converts the result.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn render(
        &self,
        template: &Path,
        data: &Value,
        options: &EngineOptions,
    ) -> Result<RenderedReport, EngineFailure>;
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub report: Bytes,
    pub report_name: String,
    pub content_type: String,
    pub template_hash: ContentHash,
    /// Set when the report itself was cached.
    pub report_hash: Option<ContentHash>,
}

/// Result of [`TemplateService::fetch`].
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub entry: CacheEntry,
    pub content: Option<Bytes>,
    pub removed: bool,
}

/// Resolve `convert_to` and `report_name` for a cached template.
pub fn derive_options(
    template: &CacheEntry,
    options: &RenderOptions,
) -> Result<(String, String), RenderError> {
    let convert_to = options
        .convert_to
        .as_deref()
        .map(|value| value.trim().trim_start_matches('.'))
        .filter(|value| !value.is_empty())
        .unwrap_or(template.ext.as_str())
        .to_ascii_lowercase();
    if convert_to.is_empty() {
        return Err(RenderError::validation(
            "Cannot render template; output file type could not be determined.",
        ));
    }

    let Some(outputs) = supported_outputs(&template.ext) else {
        return Err(RenderError::validation(format!(
            "Unsupported template file type `{}`.",
            template.ext
        )));
    };
    if !outputs.contains(&convert_to.as_str()) {
        return Err(RenderError::validation(format!(
            "Unsupported file type conversion from `{}` to `{convert_to}`.",
            template.ext
        )));
    }

    let requested = options
        .report_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(template.name.as_str());
    let report_name = if extension_of(requested).eq_ignore_ascii_case(&convert_to) {
        requested.to_string()
    } else {
        format!("{}.{convert_to}", stem_of(requested))
    };

    Ok((convert_to, report_name))
}

fn stem_of(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

#[derive(Clone)]
pub struct TemplateService {
    cache: Arc<FileCache>,
    engine: Arc<dyn RenderEngine>,
    eviction: Option<EvictionTrigger>,
    pins: EntryPins,
}

impl TemplateService {
    pub fn new(cache: Arc<FileCache>, engine: Arc<dyn RenderEngine>) -> Self {
        Self {
            cache,
            engine,
            eviction: None,
            pins: EntryPins::default(),
        }
    }

    /// Share the registry the evictor consults, so templates being rendered
    /// are never deleted under the engine.
    pub fn with_pins(mut self, pins: EntryPins) -> Self {
        self.pins = pins;
        self
    }

    /// Run an eviction pass after every successful render.
    pub fn with_eviction(mut self, trigger: EvictionTrigger) -> Self {
        self.eviction = Some(trigger);
        self
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Take ownership of an uploaded file at `path`.
    pub async fn upload(
        &self,
        path: &Path,
        original_name: &str,
    ) -> Result<StoredFile, RenderError> {
        Ok(self
            .cache
            .move_in(path, original_name, WriteOptions::default())
            .await?)
    }

    /// Store inline template content, then render it.
    ///
    /// Content that is already cached is rendered from the existing entry.
    pub async fn upload_and_render(
        &self,
        content: &[u8],
        file_type: &str,
        encoding: ContentEncoding,
        overwrite: bool,
        request: RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let options = WriteOptions { overwrite };
        let hash = match self
            .cache
            .write(content, file_type, encoding, options)
            .await
        {
            Ok(stored) => stored.hash,
            Err(FileCacheError::Conflict { hash }) => hash,
            Err(err) => return Err(err.into()),
        };
        self.render(hash.as_str(), request).await
    }

    /// Render the cached template identified by `hash`.
    pub async fn render(
        &self,
        hash: &str,
        request: RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let hash: ContentHash = hash.parse().map_err(FileCacheError::from)?;
        // Pin before the lookup so the path stays valid until the engine is done.
        let Some(pin) = self.pins.pin(hash.as_str()) else {
            return Err(FileCacheError::NotFound { hash }.into());
        };
        let template = self.cache.find(hash.as_str()).await?;
        let (convert_to, report_name) = derive_options(&template, &request.options)?;
        let cache_report = request.options.cache_report;
        let engine_options = EngineOptions {
            convert_to: convert_to.clone(),
            report_name,
            extra: request.options.extra,
            formatters: request.formatters,
        };

        let rendered = self
            .engine
            .render(&template.path, &request.data, &engine_options)
            .await;
        drop(pin);

        let rendered = match rendered {
            Ok(rendered) => rendered,
            Err(failure) => {
                warn!(
                    target = SOURCE,
                    hash = %template.hash,
                    error = %failure,
                    authoring = failure.is_authoring_error(),
                    "template render failed"
                );
                return Err(failure.into());
            }
        };

        let report_hash = if cache_report {
            self.cache_report(&rendered.report, &convert_to).await
        } else {
            None
        };

        info!(
            target = SOURCE,
            hash = %template.hash,
            report = %rendered.report_name,
            bytes = rendered.report.len(),
            "template rendered"
        );

        if let Some(trigger) = &self.eviction {
            trigger.notify();
        }

        let content_type = mime_guess::from_path(&rendered.report_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(RenderOutput {
            report: rendered.report,
            report_name: rendered.report_name,
            content_type,
            template_hash: template.hash,
            report_hash,
        })
    }

    async fn cache_report(&self, report: &[u8], convert_to: &str) -> Option<ContentHash> {
        match self
            .cache
            .write(
                report,
                convert_to,
                ContentEncoding::Binary,
                WriteOptions::default(),
            )
            .await
        {
            Ok(stored) => Some(stored.hash),
            Err(FileCacheError::Conflict { hash }) => Some(hash),
            Err(err) => {
                warn!(
                    target = SOURCE,
                    error = %err,
                    "rendered report could not be cached"
                );
                None
            }
        }
    }

    /// Look up a cached file, optionally reading and/or removing it.
    ///
    /// Content is read before removal, so `download` and `remove` compose.
    pub async fn fetch(
        &self,
        hash: &str,
        download: bool,
        remove: bool,
    ) -> Result<FetchedFile, RenderError> {
        let entry = self.cache.find(hash).await?;
        let content = if download {
            Some(self.cache.read(hash).await?)
        } else {
            None
        };
        if remove {
            self.cache.remove(hash).await?;
        }
        Ok(FetchedFile {
            entry,
            content,
            removed: remove,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use tempfile::TempDir;
    use time::OffsetDateTime;
    use tokio::sync::oneshot;

    use super::*;
    use crate::infra::evictor::{CacheEvictor, EvictionPolicy};

    #[derive(Default)]
    struct FakeEngine {
        fail_with: Option<String>,
        calls: Mutex<Vec<(Vec<u8>, EngineOptions)>>,
    }

    #[async_trait]
    impl RenderEngine for FakeEngine {
        async fn render(
            &self,
            template: &Path,
            data: &Value,
            options: &EngineOptions,
        ) -> Result<RenderedReport, EngineFailure> {
            if let Some(message) = &self.fail_with {
                return Err(EngineFailure::new(message.clone()));
            }
            let bytes = tokio::fs::read(template).await.expect("template readable");
            self.calls
                .lock()
                .expect("calls lock")
                .push((bytes, options.clone()));
            Ok(RenderedReport {
                report: Bytes::from(format!("rendered:{data}")),
                report_name: options.report_name.clone(),
            })
        }
    }

    fn service(engine: FakeEngine) -> (TempDir, TemplateService, Arc<FakeEngine>) {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(FileCache::new(dir.path()).expect("cache"));
        let engine = Arc::new(engine);
        let service = TemplateService::new(cache, engine.clone());
        (dir, service, engine)
    }

    fn entry(name: &str) -> CacheEntry {
        CacheEntry {
            hash: ContentHash::digest(name.as_bytes()),
            name: name.to_string(),
            ext: extension_of(name),
            dir: "/cache".into(),
            path: "/cache/file".into(),
            size_bytes: 1,
            modified_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn conversion_dictionary_lists_expected_outputs() {
        assert_eq!(supported_outputs("RTF"), Some(&["docx", "pdf"][..]));
        assert!(supported_outputs("pptx").is_some_and(|out| out.contains(&"ppt")));
        assert_eq!(supported_outputs("exe"), None);
        assert_eq!(conversion_dictionary().count(), 8);
    }

    #[test]
    fn options_default_to_template_type_and_name() {
        let template = entry("invoice.docx");
        let (convert_to, report_name) =
            derive_options(&template, &RenderOptions::default()).expect("options");
        assert_eq!(convert_to, "docx");
        assert_eq!(report_name, "invoice.docx");
    }

    #[test]
    fn report_name_extension_follows_output_type() {
        let template = entry("invoice.docx");
        let options = RenderOptions {
            convert_to: Some(".PDF".to_string()),
            report_name: Some("march.txt".to_string()),
            ..RenderOptions::default()
        };
        let (convert_to, report_name) = derive_options(&template, &options).expect("options");
        assert_eq!(convert_to, "pdf");
        assert_eq!(report_name, "march.pdf");

        let options = RenderOptions {
            convert_to: Some("pdf".to_string()),
            report_name: Some("summary".to_string()),
            ..RenderOptions::default()
        };
        let (_, report_name) = derive_options(&template, &options).expect("options");
        assert_eq!(report_name, "summary.pdf");
    }

    #[test]
    fn unsupported_conversion_is_a_validation_error() {
        let options = RenderOptions {
            convert_to: Some("xlsx".to_string()),
            ..RenderOptions::default()
        };
        let err = derive_options(&entry("letter.rtf"), &options).expect_err("unsupported");
        assert_eq!(err.http_status(), 400);

        let err = derive_options(&entry("archive.zip"), &RenderOptions::default())
            .expect_err("unknown input");
        assert!(matches!(err, RenderError::Validation(_)));
    }

    #[test]
    fn engine_failures_are_classified() {
        for message in [
            "Formatter \"money\" does not exist. Do you misspelled it?",
            "The template is missing at least one closing tag",
            "Cannot access parent object in \"d.items..name\"",
        ] {
            let err = RenderError::from(EngineFailure::new(message));
            assert_eq!(err.http_status(), 422, "{message}");
        }

        let err = RenderError::from(EngineFailure::new("LibreOffice crashed"));
        assert_eq!(err.http_status(), 500);
        assert_eq!(
            err.to_string(),
            "Could not render template. LibreOffice crashed"
        );
    }

    #[test]
    fn render_request_deserializes_pass_through_options() {
        let request: RenderRequest = serde_json::from_value(json!({
            "data": {"name": "Ada"},
            "options": {"convertTo": "pdf", "cacheReport": true, "lang": "fr"},
        }))
        .expect("request");
        assert_eq!(request.options.convert_to.as_deref(), Some("pdf"));
        assert!(request.options.cache_report);
        assert_eq!(request.options.extra.get("lang"), Some(&json!("fr")));
        assert!(request.formatters.is_none());
    }

    #[tokio::test]
    async fn upload_and_render_reuses_cached_template() {
        let (_dir, service, engine) = service(FakeEngine::default());
        let request = RenderRequest {
            data: json!({"n": 1}),
            ..RenderRequest::default()
        };

        let first = service
            .upload_and_render(b"Hello {d.n}", "txt", ContentEncoding::Binary, false, request.clone())
            .await
            .expect("first render");
        let second = service
            .upload_and_render(b"Hello {d.n}", "txt", ContentEncoding::Binary, false, request)
            .await
            .expect("second render");

        assert_eq!(first.template_hash, second.template_hash);
        assert_eq!(first.report, Bytes::from("rendered:{\"n\":1}"));
        assert_eq!(first.content_type, "text/plain");
        assert!(first.report_hash.is_none());

        let calls = engine.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, b"Hello {d.n}");
        assert_eq!(calls[0].1.convert_to, "txt");
    }

    #[tokio::test]
    async fn cache_report_stores_rendered_output() {
        let (_dir, service, _engine) = service(FakeEngine::default());
        let stored = service
            .cache()
            .write(b"body", "html", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("template stored");

        let request = RenderRequest {
            data: json!("x"),
            options: RenderOptions {
                convert_to: Some("pdf".to_string()),
                cache_report: true,
                ..RenderOptions::default()
            },
            formatters: None,
        };
        let output = service
            .render(stored.hash.as_str(), request)
            .await
            .expect("render");

        let report_hash = output.report_hash.expect("report cached");
        assert_eq!(report_hash, ContentHash::digest(b"rendered:\"x\""));
        let cached = service
            .fetch(report_hash.as_str(), true, false)
            .await
            .expect("fetch report");
        assert_eq!(cached.entry.ext, "pdf");
        assert_eq!(cached.content, Some(output.report));
    }

    #[tokio::test]
    async fn engine_failure_surfaces_with_status() {
        let (_dir, service, _engine) = service(FakeEngine {
            fail_with: Some("formatter toto does not exist".to_string()),
            ..FakeEngine::default()
        });
        let err = service
            .upload_and_render(b"{d.x:toto}", "txt", ContentEncoding::Binary, false, RenderRequest::default())
            .await
            .expect_err("render fails");
        assert_eq!(err.http_status(), 422);
    }

    #[tokio::test]
    async fn render_of_unknown_hash_is_not_found() {
        let (_dir, service, _engine) = service(FakeEngine::default());
        let hash = ContentHash::digest(b"never stored");
        let err = service
            .render(hash.as_str(), RenderRequest::default())
            .await
            .expect_err("missing");
        assert_eq!(err.http_status(), 404);
    }

    /// Signals when it starts reading, then waits to be released.
    struct BlockingEngine {
        started: Mutex<Option<oneshot::Sender<()>>>,
        release: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl RenderEngine for BlockingEngine {
        async fn render(
            &self,
            template: &Path,
            _data: &Value,
            options: &EngineOptions,
        ) -> Result<RenderedReport, EngineFailure> {
            let started = self.started.lock().expect("started lock").take();
            let release = self.release.lock().expect("release lock").take();
            if let Some(started) = started {
                let _ = started.send(());
            }
            if let Some(release) = release {
                let _ = release.await;
            }
            let bytes = tokio::fs::read(template)
                .await
                .map_err(|err| EngineFailure::new(err.to_string()))?;
            Ok(RenderedReport {
                report: Bytes::from(bytes),
                report_name: options.report_name.clone(),
            })
        }
    }

    #[tokio::test]
    async fn template_in_use_is_not_evicted_mid_render() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(FileCache::new(dir.path()).expect("cache"));
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let engine = Arc::new(BlockingEngine {
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(Some(release_rx)),
        });

        let pins = EntryPins::new();
        let service = TemplateService::new(Arc::clone(&cache), engine).with_pins(pins.clone());
        let evictor = CacheEvictor::new(
            dir.path(),
            EvictionPolicy {
                max_size: Some(1),
                ..EvictionPolicy::default()
            },
        )
        .with_pins(pins);

        let template = cache
            .write(b"long render", "txt", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("template stored");
        let other = cache
            .write(b"idle entry", "txt", ContentEncoding::Binary, WriteOptions::default())
            .await
            .expect("other stored");

        let render = tokio::spawn({
            let service = service.clone();
            let hash = template.hash.clone();
            async move { service.render(hash.as_str(), RenderRequest::default()).await }
        });
        started_rx.await.expect("engine started");

        let report = evictor.run_cleanup().await.expect("cleanup");
        let removed: Vec<_> = report.removed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(removed, [other.hash.as_str()]);
        assert!(template.path.exists());

        release_tx.send(()).expect("release engine");
        let output = render.await.expect("join").expect("render");
        assert_eq!(output.report, Bytes::from_static(b"long render"));

        let report = evictor.run_cleanup().await.expect("cleanup after render");
        assert_eq!(report.removed.len(), 1);
        assert!(!template.path.exists());
    }

    #[tokio::test]
    async fn fetch_can_download_and_remove() {
        let (dir, service, _engine) = service(FakeEngine::default());
        let source = dir.path().join("upload.tmp");
        tokio::fs::write(&source, b"template").await.expect("write upload");

        let stored = service.upload(&source, "My Letter.odt").await.expect("upload");
        assert!(!source.exists());

        let fetched = service
            .fetch(stored.hash.as_str(), true, true)
            .await
            .expect("fetch");
        assert!(fetched.removed);
        assert_eq!(fetched.content, Some(Bytes::from_static(b"template")));
        assert_eq!(fetched.entry.ext, "odt");

        let err = service
            .fetch(stored.hash.as_str(), false, false)
            .await
            .expect_err("removed");
        assert_eq!(err.http_status(), 404);
    }
}
