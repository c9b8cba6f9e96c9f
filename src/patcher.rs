//! # Field Patcher Module
//!
//! Rendering e riscrittura degli embed video dentro un campo del documento.
//!
//! ## Responsabilità:
//! - Primo rendering di un riferimento (`<video>` con source, marker e config)
//! - Riscrittura del solo elemento del riferimento quando la conversione termina
//! - Tutto il resto del documento rimane identico byte per byte
//! - `PatchTargetMissing` se il riferimento è stato cancellato nel frattempo
//! - Marcatura `data-inline-video-status="failed"` dei riferimenti non convertibili
//!
//! ## Markup generato:
//! ```html
//! <video id="inline-video-…" class="video-js inline-video" controls="true" preload="auto" poster="….png">
//!     <source src="….webm" type="video/webm"></source>
//!     <object hidden="true" src="….webm"></object>
//!     <object hidden="true" src="….png"></object>
//!     <config option="autoplay">true</config>
//!     …
//! </video>
//! ```
//! I `<object hidden>` tengono gli asset referenziati agli occhi del controllo
//! dei media inutilizzati dell'editor.

use crate::document::DocumentField;
use crate::error::{PipelineError, Result};
use crate::player_config::{ConfigResolver, GlobalConfig, PlayerConfig};
use regex::Regex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;
use uuid::Uuid;

pub const ELEMENT_CLASS: &str = "inline-video";
/// Opening-tag attribute flagging an embed that cannot be converted
pub const STATUS_ATTRIBUTE: &str = "data-inline-video-status";
pub const STATUS_FAILED: &str = "failed";
const ID_PREFIX: &str = "inline-video-";
const INDENT: &str = "    ";
const MAX_PATCH_ATTEMPTS: usize = 8;

/// A media file as embedded in the document
#[derive(Debug, Clone, PartialEq)]
pub struct MediaReference {
    pub id: String,
    pub source: PathBuf,
    /// Declared format of the source, from its extension
    pub mime_type: String,
}

impl MediaReference {
    /// New reference with a fresh `inline-video-<uuid>` id
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        Self {
            id: format!("{}{}", ID_PREFIX, Uuid::new_v4()),
            mime_type: mime_for(&source).to_string(),
            source,
        }
    }

    pub fn embed_source(&self) -> EmbedSource {
        EmbedSource {
            path: self.source.clone(),
            mime_type: self.mime_type.clone(),
            poster: None,
        }
    }
}

/// What an embed currently points at
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedSource {
    pub path: PathBuf,
    pub mime_type: String,
    pub poster: Option<PathBuf>,
}

/// An embed found in a document
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedReference {
    pub id: String,
    pub src: Option<String>,
    /// Inner markup of the `<video>` element
    pub body: String,
}

/// MIME type guessed from the file extension
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "ogv" => "video/ogg",
        "mpg" | "mpeg" => "video/mpeg",
        "3gp" => "video/3gpp",
        _ => "",
    }
}

struct Located {
    element: Range<usize>,
    open_tag: Range<usize>,
    body: Range<usize>,
}

pub struct FieldPatcher;

impl FieldPatcher {
    /// First rendering of a reference
    pub fn render_embed(id: &str, source: &EmbedSource, config: &PlayerConfig) -> String {
        let mut open_tag = format!(
            "<video id=\"{}\" class=\"video-js {}\" controls=\"true\" preload=\"auto\"",
            escape_attr(id),
            ELEMENT_CLASS
        );
        if let Some(poster) = &source.poster {
            open_tag.push_str(&format!(" poster=\"{}\"", escape_attr(&poster.to_string_lossy())));
        }
        open_tag.push('>');

        format!("{}{}</video>", open_tag, Self::render_body(source, config))
    }

    /// Rewrite the embed `id` to point at `source` with `config`.
    ///
    /// Only the element of that embed changes. Inside it, the `poster`
    /// attribute and the generated children are replaced; other attributes
    /// of the opening tag are kept.
    pub fn apply(document: &str, id: &str, source: &EmbedSource, config: &PlayerConfig) -> Result<String> {
        let located = locate(document, id)?;

        let poster = source.poster.as_ref().map(|p| p.to_string_lossy().to_string());
        let open_tag = set_attribute(&document[located.open_tag.clone()], "poster", poster.as_deref());
        let open_tag = set_attribute(&open_tag, STATUS_ATTRIBUTE, None);

        let mut patched = String::with_capacity(document.len() + 256);
        patched.push_str(&document[..located.element.start]);
        patched.push_str(&open_tag);
        patched.push_str(&Self::render_body(source, config));
        patched.push_str("</video>");
        patched.push_str(&document[located.element.end..]);
        Ok(patched)
    }

    /// Flag embed `id` as failed. Only its opening tag changes.
    pub fn mark_failed(document: &str, id: &str) -> Result<String> {
        let located = locate(document, id)?;
        let open_tag = &document[located.open_tag.clone()];
        if Self::status_of(open_tag).as_deref() == Some(STATUS_FAILED) {
            return Ok(document.to_string());
        }

        let mut marked = String::with_capacity(document.len() + 32);
        marked.push_str(&document[..located.open_tag.start]);
        marked.push_str(&set_attribute(open_tag, STATUS_ATTRIBUTE, Some(STATUS_FAILED)));
        marked.push_str(&document[located.open_tag.end..]);
        Ok(marked)
    }

    /// Status flag of embed `id`, if any
    pub fn status(document: &str, id: &str) -> Result<Option<String>> {
        let located = locate(document, id)?;
        Ok(Self::status_of(&document[located.open_tag]))
    }

    fn status_of(open_tag: &str) -> Option<String> {
        static STATUS_RE: OnceLock<Regex> = OnceLock::new();
        let status_re = STATUS_RE.get_or_init(|| {
            Regex::new(r#"(?i)\sdata-inline-video-status\s*=\s*"([^"]*)""#).expect("status pattern is valid")
        });
        status_re
            .captures(open_tag)
            .and_then(|c| c.get(1))
            .map(|m| unescape_attr(m.as_str()))
    }

    /// Inner markup of embed `id`
    pub fn element_body<'a>(document: &'a str, id: &str) -> Result<&'a str> {
        let located = locate(document, id)?;
        Ok(&document[located.body])
    }

    /// Every embed generated by this crate, in document order
    pub fn references(document: &str) -> Vec<EmbeddedReference> {
        static ID_RE: OnceLock<Regex> = OnceLock::new();
        static SRC_RE: OnceLock<Regex> = OnceLock::new();
        let id_re = ID_RE.get_or_init(|| {
            Regex::new(r#"(?is)<video\b[^>]*?\sid\s*=\s*"(inline-video-[^"]+)""#).expect("id pattern is valid")
        });
        let src_re = SRC_RE.get_or_init(|| {
            Regex::new(r#"(?is)<source\b[^>]*?\ssrc\s*=\s*"([^"]*)""#).expect("src pattern is valid")
        });

        id_re
            .captures_iter(document)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .filter_map(|id| {
                let body = Self::element_body(document, &id).ok()?.to_string();
                let src = src_re
                    .captures(&body)
                    .and_then(|c| c.get(1))
                    .map(|m| unescape_attr(m.as_str()));
                Some(EmbeddedReference { id, src, body })
            })
            .collect()
    }

    /// Patch embed `id` in a live field.
    ///
    /// The embedded config is re-read from the current content on every
    /// attempt, so edits made while the conversion ran are kept. If the field
    /// changes between read and write the patch is recomputed.
    pub async fn patch_field(
        field: &dyn DocumentField,
        id: &str,
        source: &EmbedSource,
        global: &GlobalConfig,
    ) -> Result<String> {
        Self::edit_field(field, id, |current| {
            let body = Self::element_body(current, id)?;
            let config = ConfigResolver::resolve_markup(global, body);
            Self::apply(current, id, source, &config)
        })
        .await
    }

    /// Flag embed `id` in a live field as failed
    pub async fn flag_failed(field: &dyn DocumentField, id: &str) -> Result<String> {
        Self::edit_field(field, id, |current| Self::mark_failed(current, id)).await
    }

    /// Read, rewrite and compare-and-swap until the field holds still
    async fn edit_field<F>(field: &dyn DocumentField, id: &str, rewrite: F) -> Result<String>
    where
        F: Fn(&str) -> Result<String> + Sync,
    {
        for attempt in 1..=MAX_PATCH_ATTEMPTS {
            let current = field.snapshot().await?;
            let patched = rewrite(&current)?;

            if patched == current {
                return Ok(patched);
            }
            if field.replace(&current, patched.clone()).await? {
                return Ok(patched);
            }
            debug!("Field changed while patching {} (attempt {}), retrying", id, attempt);
        }

        Err(PipelineError::State(format!(
            "document kept changing while patching {}",
            id
        )))
    }

    fn render_body(source: &EmbedSource, config: &PlayerConfig) -> String {
        let src = escape_attr(&source.path.to_string_lossy());
        let mut lines = vec![format!(
            "<source src=\"{}\" type=\"{}\"></source>",
            src,
            escape_attr(&source.mime_type)
        )];

        let mut assets = vec![src];
        if let Some(poster) = &source.poster {
            assets.push(escape_attr(&poster.to_string_lossy()));
        }
        for asset in assets {
            lines.push(format!("<object hidden=\"true\" src=\"{}\"></object>", asset));
        }

        lines.extend(ConfigResolver::serialize(config).lines().map(str::to_string));

        let mut body = String::from("\n");
        for line in lines {
            body.push_str(INDENT);
            body.push_str(&line);
            body.push('\n');
        }
        body
    }
}

fn locate(document: &str, id: &str) -> Result<Located> {
    static CLOSE_RE: OnceLock<Regex> = OnceLock::new();
    let close_re = CLOSE_RE.get_or_init(|| Regex::new(r"(?i)</video\s*>").expect("close pattern is valid"));

    let escaped = regex::escape(&escape_attr(id));
    let open_re = Regex::new(&format!(
        r#"(?is)<video\b[^>]*?\sid\s*=\s*(?:"{0}"|'{0}')[^>]*>"#,
        escaped
    ))
    .map_err(|e| PipelineError::State(e.to_string()))?;

    let open = open_re
        .find(document)
        .ok_or_else(|| PipelineError::PatchTargetMissing(id.to_string()))?;
    let close = close_re
        .find(&document[open.end()..])
        .ok_or_else(|| PipelineError::PatchTargetMissing(format!("{} (unterminated element)", id)))?;

    let close_start = open.end() + close.start();
    let close_end = open.end() + close.end();
    Ok(Located {
        element: open.start()..close_end,
        open_tag: open.start()..open.end(),
        body: open.end()..close_start,
    })
}

/// Replace, add or remove one attribute of an opening tag
fn set_attribute(open_tag: &str, name: &str, value: Option<&str>) -> String {
    let pattern = format!(
        r#"(?i)\s+{}\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
        regex::escape(name)
    );
    let without = match Regex::new(&pattern) {
        Ok(re) => re.replace_all(open_tag, "").to_string(),
        Err(_) => open_tag.to_string(),
    };

    let Some(value) = value else {
        return without;
    };
    let head = without.trim_end_matches('>').trim_end();
    format!("{} {}=\"{}\">", head, name, escape_attr(value))
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape_attr(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}
