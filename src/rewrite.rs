//! Scheme-aware rewriting of `href`/`src` attribute values.
//!
//! Dictionary markup points at resources with bare relative paths, at audio
//! with `sound://` and at other headwords with `entry://`. The rules in
//! [`SCHEME_TABLE`] move all of those under the routes of the serving layer.
//! Rules run in table order, one pass each, and every rule leaves values it
//! already produced untouched so a second run is a no-op.

use std::borrow::Cow;
use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use url::Url;

pub const SOUND_SCHEME: &str = "sound://";
pub const ENTRY_SCHEME: &str = "entry://";
const FILE_SCHEME: &str = "file:///";
const DATA_SCHEME: &str = "data:";

/// Quote-delimited `href=`/`src=` occurrences preceded by a space or a quote.
/// `data-href`/`data-src` never match because of the leading-character class.
static ATTRIBUTE_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<lead>[ "])(?P<name>href|src)=(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#)
        .expect("valid attribute pattern")
});

/// Output flavour of a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// One dictionary rendered on its own page.
    Single,
    /// Every installed dictionary merged into one page.
    Aggregate,
    /// Embeddable fragment with absolute URLs.
    Lite,
}

/// Prefixes used to rewrite the records of one dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    pub source_id: String,
    pub mode: RenderMode,
    pub resource_prefix: String,
    pub entry_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Href,
    Src,
}

/// A single rewrite step: which attributes it inspects and how it maps a value.
/// `transform` returns `None` to leave the value as is.
#[derive(Clone, Copy)]
pub struct RewriteRule {
    pub name: &'static str,
    pub applies_to: &'static [Attribute],
    transform: fn(Attribute, &str, &RewriteContext) -> Option<String>,
}

impl RewriteRule {
    pub fn apply(&self, html: &str, ctx: &RewriteContext) -> String {
        ATTRIBUTE_VALUE
            .replace_all(html, |caps: &Captures<'_>| {
                let whole = caps[0].to_string();
                let attribute = match &caps["name"] {
                    "href" => Attribute::Href,
                    _ => Attribute::Src,
                };
                if !self.applies_to.contains(&attribute) {
                    return whole;
                }
                let (quote, value) = match (caps.name("dq"), caps.name("sq")) {
                    (Some(value), _) => ('"', value.as_str()),
                    (None, Some(value)) => ('\'', value.as_str()),
                    (None, None) => return whole,
                };
                match (self.transform)(attribute, value, ctx) {
                    Some(rewritten) => {
                        format!("{}{}={quote}{rewritten}{quote}", &caps["lead"], &caps["name"])
                    }
                    None => whole,
                }
            })
            .into_owned()
    }
}

impl std::fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteRule")
            .field("name", &self.name)
            .field("applies_to", &self.applies_to)
            .finish()
    }
}

pub const TRAILING_SLASH: RewriteRule = RewriteRule {
    name: "trailing-slash",
    applies_to: &[Attribute::Href],
    transform: drop_trailing_slash,
};

pub const RESOURCE: RewriteRule = RewriteRule {
    name: "resource",
    applies_to: &[Attribute::Href, Attribute::Src],
    transform: prefix_resource,
};

pub const RESOURCE_SRC: RewriteRule = RewriteRule {
    name: "resource-src",
    applies_to: &[Attribute::Src],
    transform: prefix_resource,
};

pub const SOUND: RewriteRule = RewriteRule {
    name: "sound",
    applies_to: &[Attribute::Href],
    transform: prefix_sound,
};

pub const ENTRY: RewriteRule = RewriteRule {
    name: "entry",
    applies_to: &[Attribute::Href],
    transform: prefix_entry,
};

/// Rules applied to entry records, in order.
pub const SCHEME_TABLE: &[RewriteRule] = &[TRAILING_SLASH, RESOURCE, SOUND, ENTRY];

/// Rules applied to a dictionary's about text. It carries no entry links.
pub const ABOUT_RULES: &[RewriteRule] = &[TRAILING_SLASH, RESOURCE_SRC, SOUND];

/// Rewrites one content record for the dictionary described by `ctx`.
pub fn rewrite(html: &str, ctx: &RewriteContext) -> String {
    apply_rules(html, SCHEME_TABLE, ctx)
}

/// Rewrites a dictionary's about text.
pub fn rewrite_about(html: &str, ctx: &RewriteContext) -> String {
    apply_rules(html, ABOUT_RULES, ctx)
}

pub fn apply_rules(html: &str, rules: &[RewriteRule], ctx: &RewriteContext) -> String {
    rules
        .iter()
        .fold(html.to_string(), |acc, rule| rule.apply(&acc, ctx))
}

fn drop_trailing_slash(_: Attribute, value: &str, _: &RewriteContext) -> Option<String> {
    let trimmed = value.strip_suffix('/')?;
    trimmed.contains("://").then(|| trimmed.to_string())
}

fn prefix_resource(attribute: Attribute, value: &str, ctx: &RewriteContext) -> Option<String> {
    if value.is_empty() || value.starts_with(DATA_SCHEME) {
        return None;
    }
    if attribute == Attribute::Href
        && (value.starts_with(SOUND_SCHEME)
            || value.starts_with(ENTRY_SCHEME)
            || value.starts_with('#'))
    {
        return None;
    }
    let path = value
        .strip_prefix(FILE_SCHEME)
        .unwrap_or_else(|| value.trim_start_matches('/'));
    if path.is_empty() || (is_absolute_url(value) && !value.starts_with(FILE_SCHEME)) {
        return None;
    }
    let base = ctx.resource_prefix.trim_end_matches('/');
    if path.starts_with(&format!("{base}/")) {
        return None;
    }
    Some(format!("{base}/{path}"))
}

fn prefix_sound(_: Attribute, value: &str, ctx: &RewriteContext) -> Option<String> {
    let path = value.strip_prefix(SOUND_SCHEME)?;
    if path.is_empty() || path.starts_with('#') {
        return None;
    }
    let prefix = strip_scheme(&ctx.resource_prefix);
    let base = prefix.trim_end_matches('/');
    if path.starts_with(&format!("{base}/")) {
        return None;
    }
    Some(format!("{SOUND_SCHEME}{base}/{path}"))
}

fn prefix_entry(_: Attribute, value: &str, ctx: &RewriteContext) -> Option<String> {
    let target = value.strip_prefix(ENTRY_SCHEME)?;
    if target.is_empty() || target.starts_with('#') {
        return None;
    }
    match ctx.mode {
        RenderMode::Single => None,
        RenderMode::Aggregate => {
            let base = ctx.entry_prefix.trim_end_matches('/');
            if target.starts_with(&format!("{base}/")) {
                return None;
            }
            Some(format!("{ENTRY_SCHEME}{base}/{target}"))
        }
        RenderMode::Lite => {
            let base = strip_scheme(&ctx.entry_prefix);
            if target.starts_with(base.as_ref()) {
                return None;
            }
            Some(format!("{ENTRY_SCHEME}{base}{target}"))
        }
    }
}

/// Drops the scheme of an absolute URL, keeping authority, path and query.
/// Relative prefixes come back unchanged.
pub fn strip_scheme(prefix: &str) -> Cow<'_, str> {
    match Url::parse(prefix) {
        Ok(url) if url.has_host() => {
            let mut out = String::with_capacity(prefix.len());
            if let Some(host) = url.host_str() {
                out.push_str(host);
            }
            if let Some(port) = url.port() {
                let _ = write!(out, ":{port}");
            }
            out.push_str(url.path());
            if let Some(query) = url.query() {
                out.push('?');
                out.push_str(query);
            }
            Cow::Owned(out)
        }
        _ => Cow::Borrowed(prefix),
    }
}

fn is_absolute_url(value: &str) -> bool {
    value.starts_with("//") || Url::parse(value).is_ok()
}

/// Collapses runs of `/` that are not part of a `scheme://` separator.
pub fn collapse_slashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_slash = false;
    let mut after_colon = false;
    for ch in value.chars() {
        if ch == '/' {
            if prev_slash && !after_colon {
                continue;
            }
            if !prev_slash {
                after_colon = out.ends_with(':');
            }
            prev_slash = true;
        } else {
            prev_slash = false;
            after_colon = false;
        }
        out.push(ch);
    }
    out
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mode: RenderMode) -> RewriteContext {
        match mode {
            RenderMode::Single => RewriteContext {
                source_id: "oald".into(),
                mode,
                resource_prefix: "../resource".into(),
                entry_prefix: "../query".into(),
            },
            RenderMode::Aggregate => RewriteContext {
                source_id: "oald".into(),
                mode,
                resource_prefix: "oald/resource".into(),
                entry_prefix: "oald/query".into(),
            },
            RenderMode::Lite => RewriteContext {
                source_id: "oald".into(),
                mode,
                resource_prefix: "http://127.0.0.1:8080/oald/resource/".into(),
                entry_prefix: "http://127.0.0.1:8080/oald/lite/?word=".into(),
            },
        }
    }

    #[test]
    fn bare_paths_get_resource_prefix() {
        let out = rewrite(
            r#"<img src="img/cat.png"><a href="pic.jpg">x</a>"#,
            &ctx(RenderMode::Aggregate),
        );
        assert_eq!(
            out,
            r#"<img src="oald/resource/img/cat.png"><a href="oald/resource/pic.jpg">x</a>"#
        );
    }

    #[test]
    fn leading_slash_and_file_scheme_are_dropped_from_src() {
        let out = rewrite(
            r#"<img src="/a.png"><img src="file:///b.png">"#,
            &ctx(RenderMode::Single),
        );
        assert_eq!(
            out,
            r#"<img src="../resource/a.png"><img src="../resource/b.png">"#
        );
    }

    #[test]
    fn leading_slash_is_dropped_from_href_too() {
        let out = rewrite(
            r#"<link rel="stylesheet" href="/css/a.css"><a href="/b.html">b</a>"#,
            &ctx(RenderMode::Aggregate),
        );
        assert_eq!(
            out,
            r#"<link rel="stylesheet" href="oald/resource/css/a.css"><a href="oald/resource/b.html">b</a>"#
        );
    }

    #[test]
    fn data_uris_and_anchors_are_untouched() {
        let html = r##"<img src="data:image/png;base64,AAAA"><a href="#sense2">2</a>"##;
        assert_eq!(rewrite(html, &ctx(RenderMode::Aggregate)), html);
    }

    #[test]
    fn sound_scheme_keeps_token_and_gains_prefix() {
        let out = rewrite(
            r#"<a href="sound://uk/hello.mp3">play</a>"#,
            &ctx(RenderMode::Aggregate),
        );
        assert_eq!(out, r#"<a href="sound://oald/resource/uk/hello.mp3">play</a>"#);
    }

    #[test]
    fn sound_scheme_in_lite_mode_drops_http_scheme_structurally() {
        let out = rewrite(
            r#"<a href="sound://hello.mp3">play</a>"#,
            &ctx(RenderMode::Lite),
        );
        assert_eq!(
            out,
            r#"<a href="sound://127.0.0.1:8080/oald/resource/hello.mp3">play</a>"#
        );

        let https = RewriteContext {
            resource_prefix: "https://dict.example.org/oald/resource/".into(),
            ..ctx(RenderMode::Lite)
        };
        let out = rewrite(r#"<a href="sound://hello.mp3">play</a>"#, &https);
        assert_eq!(
            out,
            r#"<a href="sound://dict.example.org/oald/resource/hello.mp3">play</a>"#
        );
    }

    #[test]
    fn entry_scheme_depends_on_mode() {
        let html = r#"<a href="entry://world">world</a>"#;
        assert_eq!(rewrite(html, &ctx(RenderMode::Single)), html);
        assert_eq!(
            rewrite(html, &ctx(RenderMode::Aggregate)),
            r#"<a href="entry://oald/query/world">world</a>"#
        );
        assert_eq!(
            rewrite(html, &ctx(RenderMode::Lite)),
            r#"<a href="entry://127.0.0.1:8080/oald/lite/?word=world">world</a>"#
        );
    }

    #[test]
    fn entry_anchor_targets_are_untouched() {
        let html = r##"<a href="entry://#idiom">see</a>"##;
        assert_eq!(rewrite(html, &ctx(RenderMode::Aggregate)), html);
    }

    #[test]
    fn trailing_slash_is_dropped_from_scheme_urls() {
        let out = rewrite(
            r#"<a href="entry://world/">w</a>"#,
            &ctx(RenderMode::Single),
        );
        assert_eq!(out, r#"<a href="entry://world">w</a>"#);
    }

    #[test]
    fn external_links_are_left_alone() {
        let html = r#"<a href="https://example.com/x">ext</a><img src="//cdn.example.com/a.png">"#;
        assert_eq!(rewrite(html, &ctx(RenderMode::Aggregate)), html);
    }

    #[test]
    fn single_quoted_values_are_rewritten() {
        let out = rewrite("<img src='a.png'>", &ctx(RenderMode::Aggregate));
        assert_eq!(out, "<img src='oald/resource/a.png'>");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let html = concat!(
            r#"<link rel="stylesheet" href="style.css">"#,
            r#"<img src="a.png"><a href="sound://b.mp3">b</a>"#,
            r#"<a href="entry://c">c</a><span data-href="d.css" data-src="e.js"></span>"#,
        );
        for mode in [RenderMode::Single, RenderMode::Aggregate, RenderMode::Lite] {
            let once = rewrite(html, &ctx(mode));
            let twice = rewrite(&once, &ctx(mode));
            assert_eq!(once, twice, "{mode:?}");
            assert!(once.contains(r#"data-href="d.css" data-src="e.js""#));
        }
    }

    #[test]
    fn unrelated_attributes_and_text_are_untouched() {
        let html = r#"<p class="src" title="href=x">src="nope"</p>"#;
        assert_eq!(rewrite(html, &ctx(RenderMode::Aggregate)), html);
    }

    #[test]
    fn about_text_skips_entry_and_href_resource_rules() {
        let html = r#"<img src="logo.png"><a href="entry://x">x</a><a href="page.html">p</a><a href="sound://a.mp3">a</a>"#;
        let out = rewrite_about(html, &ctx(RenderMode::Aggregate));
        assert_eq!(
            out,
            r#"<img src="oald/resource/logo.png"><a href="entry://x">x</a><a href="page.html">p</a><a href="sound://oald/resource/a.mp3">a</a>"#
        );
    }

    #[test]
    fn strip_scheme_handles_relative_and_absolute_prefixes() {
        assert_eq!(strip_scheme("../resource"), "../resource");
        assert_eq!(strip_scheme("https://h.org/x/"), "h.org/x/");
        assert_eq!(strip_scheme("http://h:9000/x/?word="), "h:9000/x/?word=");
    }

    #[test]
    fn collapse_slashes_keeps_scheme_separators() {
        assert_eq!(
            collapse_slashes("http://h//oald/resource//a.png"),
            "http://h/oald/resource/a.png"
        );
        assert_eq!(collapse_slashes("sound://h//x"), "sound://h/x");
        assert_eq!(collapse_slashes("a///b"), "a/b");
    }
}
