//! Entry merging and the three output modes.
//!
//! [`Renderer`] looks a word up in each selected dictionary, resolves alias
//! records, rewrites links with per-dictionary prefixes, deduplicates
//! stylesheet and script tags and stitches the records into HTML. Single and
//! lite renders may end in a [`RedirectInstruction`] instead of a page.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::dedupe::dedupe;
use crate::error::{RenderError, Result};
use crate::link::{self, RedirectInstruction, Resolved};
use crate::rewrite::{
    RESOURCE_SRC, RenderMode, RewriteContext, apply_rules, collapse_slashes, escape_html,
    rewrite, rewrite_about,
};
use crate::source::{DictionarySource, SourceKind, SourceRegistry};

/// Upper bound on alias hops followed before giving up.
pub const MAX_REDIRECT_HOPS: usize = 8;
pub const RECORD_SEPARATOR: &str = "<hr />";
pub const LITE_SEPARATOR: &str = r#"<hr class="seprator" />"#;
const RESET_CSS: &str = "css/reset.css";
const MDICT_CSS: &str = "css/mdict.css";
const MDICT_JS: &str = "static/js/mdict.js";

/// Attribute values of a finished lite fragment, for the absolute-URL pass.
static LITE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#" (?P<name>href|src)="(?P<value>[^"]*)""#).expect("valid lite url pattern")
});

/// Final output for one dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedSection {
    pub source_id: String,
    pub title: String,
    pub logo_url: String,
    pub about_html: String,
    pub body_html: String,
}

/// Sections for a word in display order. `found` is set when a real
/// dictionary returned at least one record and drives history logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedPage {
    pub word: String,
    pub mode: RenderMode,
    pub sections: Vec<RenderedSection>,
    pub found: bool,
}

impl RenderedPage {
    /// Lite fragments joined the way they are served.
    pub fn lite_html(&self) -> String {
        self.sections
            .iter()
            .map(|section| section.body_html.as_str())
            .collect::<Vec<_>>()
            .join(LITE_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Page(RenderedPage),
    Redirect(RedirectInstruction),
}

/// Public listing entry for one dictionary.
#[derive(Debug, Clone, Serialize)]
pub struct SourceListing {
    pub title: String,
    pub uuid: String,
    pub logo: String,
    pub about: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub lite_url: String,
    pub url: String,
}

enum SourceOutcome {
    Section {
        section: RenderedSection,
        record_count: usize,
    },
    Redirect(RedirectInstruction),
}

enum Piece {
    Content(String),
    SeeAlso(String),
}

/// Renders words against the installed dictionaries.
#[derive(Debug, Clone)]
pub struct Renderer {
    registry: Arc<SourceRegistry>,
    base_url: String,
}

impl Renderer {
    /// `base_url` is the externally reachable root used for lite-mode URLs.
    pub fn new(registry: Arc<SourceRegistry>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { registry, base_url }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Renders one dictionary. Alias chains are followed to their end so the
    /// caller can redirect once.
    pub fn render_single(&self, source_id: &str, word: &str) -> Result<Rendered> {
        let word = clean_word(word)?;
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| RenderError::SourceNotFound(source_id.to_string()))?;
        let ctx = self.context(RenderMode::Single, source);
        match self.merge_source(source, word, &ctx) {
            SourceOutcome::Redirect(first) => Ok(Rendered::Redirect(
                self.follow_redirects(source, word, first, &ctx)?,
            )),
            SourceOutcome::Section {
                section,
                record_count,
            } => Ok(Rendered::Page(RenderedPage {
                word: word.to_string(),
                mode: RenderMode::Single,
                found: counts_as_found(source, record_count),
                sections: vec![section],
            })),
        }
    }

    /// Renders every installed dictionary. Aliases become inline links, so
    /// this never redirects.
    pub fn render_aggregate(&self, word: &str) -> Result<RenderedPage> {
        let word = clean_word(word)?;
        let mut sections = Vec::with_capacity(self.registry.len());
        let mut found = false;
        for source in self.registry.iter() {
            let ctx = self.context(RenderMode::Aggregate, source);
            match self.merge_source(source, word, &ctx) {
                SourceOutcome::Section {
                    section,
                    record_count,
                } => {
                    found |= counts_as_found(source, record_count);
                    sections.push(section);
                }
                SourceOutcome::Redirect(redirect) => {
                    warn!(source = %source.id, target = %redirect.target_word, "unexpected redirect in aggregate render");
                }
            }
        }
        Ok(RenderedPage {
            word: word.to_string(),
            mode: RenderMode::Aggregate,
            sections,
            found,
        })
    }

    /// Renders embeddable fragments.
    ///
    /// `selector` is `default` (first dictionary), `all`, or a dictionary id;
    /// `default` and ids are followed by the `fallback` ids. Rendering stops at
    /// the first dictionary with records unless `all_results` is set or the
    /// selector is `all`.
    pub fn render_lite(
        &self,
        selector: &str,
        word: &str,
        fallback: &[String],
        all_results: bool,
    ) -> Result<Rendered> {
        let word = clean_word(word)?;
        let sources = self.lite_sources(selector, fallback)?;
        let keep_going = all_results || selector == "all";
        let mut sections = Vec::new();
        let mut found = false;
        for source in sources {
            let ctx = self.context(RenderMode::Lite, source);
            match self.merge_source(source, word, &ctx) {
                SourceOutcome::Redirect(first) => {
                    return Ok(Rendered::Redirect(
                        self.follow_redirects(source, word, first, &ctx)?,
                    ));
                }
                SourceOutcome::Section { record_count: 0, .. } => continue,
                SourceOutcome::Section {
                    section,
                    record_count,
                } => {
                    found |= counts_as_found(source, record_count);
                    sections.push(section);
                    if !keep_going {
                        break;
                    }
                }
            }
        }
        Ok(Rendered::Page(RenderedPage {
            word: word.to_string(),
            mode: RenderMode::Lite,
            sections,
            found,
        }))
    }

    /// Headwords starting with `part` across static dictionaries.
    pub fn suggest(&self, part: &str, limit: usize) -> Vec<String> {
        let mut words = BTreeSet::new();
        for source in self.registry.iter() {
            if source.kind == SourceKind::DynamicApp {
                continue;
            }
            words.extend(source.suggest(part, limit));
        }
        words.into_iter().collect()
    }

    /// Describes installed dictionaries, optionally just `only`.
    pub fn list(&self, only: Option<&str>) -> Vec<SourceListing> {
        self.registry
            .iter()
            .filter(|source| only.is_none_or(|id| id == source.id))
            .map(|source| {
                let ctx = self.context(RenderMode::Lite, source);
                SourceListing {
                    title: source.title.clone(),
                    uuid: source.id.clone(),
                    logo: join_url(&ctx.resource_prefix, &source.logo),
                    about: apply_rules(&source.about, &[RESOURCE_SRC], &ctx),
                    kind: source.kind,
                    lite_url: ctx.entry_prefix.clone(),
                    url: format!("{}/{}/query/", self.base_url, source.id),
                }
            })
            .collect()
    }

    /// Prefix conventions of each mode for one dictionary.
    pub fn context(&self, mode: RenderMode, source: &DictionarySource) -> RewriteContext {
        let (resource_prefix, entry_prefix) = match mode {
            RenderMode::Single => ("../resource".to_string(), "../query".to_string()),
            RenderMode::Aggregate => (
                format!("{}/resource", source.id),
                format!("{}/query", source.id),
            ),
            RenderMode::Lite => (
                format!("{}/{}/resource/", self.base_url, source.id),
                format!("{}/{}/lite/?word=", self.base_url, source.id),
            ),
        };
        RewriteContext {
            source_id: source.id.clone(),
            mode,
            resource_prefix,
            entry_prefix,
        }
    }

    fn lite_sources(&self, selector: &str, fallback: &[String]) -> Result<Vec<&DictionarySource>> {
        let mut sources: Vec<&DictionarySource> = match selector {
            "all" => return Ok(self.registry.iter().collect()),
            "default" => vec![
                self.registry
                    .first()
                    .ok_or_else(|| RenderError::SourceNotFound(selector.to_string()))?,
            ],
            id => vec![
                self.registry
                    .get(id)
                    .ok_or_else(|| RenderError::SourceNotFound(id.to_string()))?,
            ],
        };
        for id in fallback {
            match self.registry.get(id.trim()) {
                Some(source) if !sources.iter().any(|s| s.id == source.id) => sources.push(source),
                Some(_) => {}
                None if id.trim().is_empty() => {}
                None => debug!(fallback = %id, "skipping unknown fallback dictionary"),
            }
        }
        Ok(sources)
    }

    fn follow_redirects(
        &self,
        source: &DictionarySource,
        word: &str,
        first: RedirectInstruction,
        ctx: &RewriteContext,
    ) -> Result<RedirectInstruction> {
        let mut visited = HashSet::from([word.to_lowercase()]);
        let mut current = first;
        for _ in 0..MAX_REDIRECT_HOPS {
            if !visited.insert(current.target_word.to_lowercase()) {
                return Err(cycle(source, &current.target_word));
            }
            let records = source.lookup_entries(&current.target_word);
            match first_redirect(&records, ctx) {
                Some(next) => {
                    debug!(
                        source = %source.id,
                        from = %current.target_word,
                        to = %next.target_word,
                        "following alias"
                    );
                    // A redirect without a fragment keeps the one already requested.
                    let anchor = next.anchor.clone().or(current.anchor.take());
                    current = RedirectInstruction { anchor, ..next };
                }
                None => return Ok(current),
            }
        }
        Err(cycle(source, &current.target_word))
    }

    fn merge_source(
        &self,
        source: &DictionarySource,
        word: &str,
        ctx: &RewriteContext,
    ) -> SourceOutcome {
        let records = source.lookup_entries(word);
        debug!(source = %source.id, word, records = records.len(), mode = ?ctx.mode, "looked up entries");

        let mut pieces = Vec::with_capacity(records.len());
        for record in &records {
            match link::resolve(
                record,
                records.len(),
                ctx.mode,
                &source.id,
                &ctx.entry_prefix,
            ) {
                Resolved::Redirect(redirect) => return SourceOutcome::Redirect(redirect),
                Resolved::SeeAlso(html) => pieces.push(Piece::SeeAlso(html)),
                Resolved::Content(html) => pieces.push(Piece::Content(rewrite(html, ctx))),
            }
        }

        let mut content: Vec<String> = pieces
            .iter_mut()
            .filter_map(|piece| match piece {
                Piece::Content(html) => Some(std::mem::take(html)),
                Piece::SeeAlso(_) => None,
            })
            .collect();
        dedupe(&mut content);
        let mut content = content.into_iter();
        let bodies: Vec<String> = pieces
            .into_iter()
            .map(|piece| match piece {
                Piece::Content(_) => content.next().unwrap_or_default(),
                Piece::SeeAlso(html) => html,
            })
            .collect();

        let banner = self
            .registry
            .errors()
            .get(&source.id)
            .map(|message| format!(r#"<div style="color: red;">{}</div>"#, escape_html(&message)));
        let logo_url = join_url(&ctx.resource_prefix, &source.logo);
        let body_html = match ctx.mode {
            RenderMode::Single | RenderMode::Aggregate => {
                let mut parts = Vec::with_capacity(bodies.len() + 1);
                parts.extend(banner);
                parts.extend(bodies);
                format!(
                    r#"<link rel="stylesheet" href="{}">{}"#,
                    join_url(&ctx.resource_prefix, RESET_CSS),
                    parts.join(RECORD_SEPARATOR)
                )
            }
            RenderMode::Lite => self.lite_fragment(source, ctx, banner, &logo_url, bodies),
        };

        SourceOutcome::Section {
            section: RenderedSection {
                source_id: source.id.clone(),
                title: source.title.clone(),
                logo_url,
                about_html: rewrite_about(&source.about, ctx),
                body_html,
            },
            record_count: records.len(),
        }
    }

    fn lite_fragment(
        &self,
        source: &DictionarySource,
        ctx: &RewriteContext,
        banner: Option<String>,
        logo_url: &str,
        bodies: Vec<String>,
    ) -> String {
        let mut html = Vec::with_capacity(bodies.len() + 10);
        html.push(format!(r#"<div id="class_{}">"#, source.id));
        html.push(r#"<div class="mdict">"#.to_string());
        for stylesheet in [RESET_CSS, MDICT_CSS] {
            html.push(format!(
                r#"<link rel="stylesheet" href="{}">"#,
                join_url(&ctx.resource_prefix, stylesheet)
            ));
        }
        html.extend(banner);
        html.push(r#"<div class="mdict-title">"#.to_string());
        html.push(format!(
            r#"<img style="height:16px !important; border-radius:.25rem !important; vertical-align:baseline !important" src="{logo_url}"/>"#
        ));
        html.push(escape_html(&source.title));
        html.push("</div>".to_string());
        html.extend(bodies);
        html.push("</div></div>".to_string());
        html.push(format!(
            r#"<script src="{}"></script>"#,
            join_url(&self.base_url, MDICT_JS)
        ));
        mark_absolute_urls(&html.join("\n"))
    }
}

/// Collapses stray `//` in every ` href`/` src` value and tags the attribute
/// as an absolute URL for the client script. `data:` URIs are left alone.
pub fn mark_absolute_urls(html: &str) -> String {
    LITE_URL
        .replace_all(html, |caps: &Captures<'_>| {
            let value = &caps["value"];
            if value.starts_with("data:") {
                return caps[0].to_string();
            }
            format!(
                r#" data-abs-url {}="{}""#,
                &caps["name"],
                collapse_slashes(value)
            )
        })
        .into_owned()
}

/// First alias that would redirect, checked without rewriting anything.
fn first_redirect(records: &[String], ctx: &RewriteContext) -> Option<RedirectInstruction> {
    records.iter().find_map(|record| {
        match link::resolve(
            record,
            records.len(),
            ctx.mode,
            &ctx.source_id,
            &ctx.entry_prefix,
        ) {
            Resolved::Redirect(redirect) => Some(redirect),
            _ => None,
        }
    })
}

fn counts_as_found(source: &DictionarySource, record_count: usize) -> bool {
    record_count > 0 && !source.is_translator()
}

fn cycle(source: &DictionarySource, word: &str) -> RenderError {
    RenderError::RedirectCycle {
        word: word.to_string(),
        source_id: source.id.clone(),
    }
}

fn clean_word(word: &str) -> Result<&str> {
    let word = word.trim();
    if word.is_empty() {
        return Err(RenderError::EmptyWord);
    }
    Ok(word)
}

fn join_url(prefix: &str, path: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
