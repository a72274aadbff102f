//! Alias (`@@@LINK=`) detection and resolution.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Serialize;

use crate::rewrite::{ENTRY_SCHEME, RenderMode, escape_html, strip_scheme};

pub const ALIAS_MARKER: &str = "@@@LINK=";

/// Characters escaped when a headword becomes part of a link path.
const WORD_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'\'')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'/')
    .add(b'%');

/// Where the serving layer should send the client instead of rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectInstruction {
    pub target_word: String,
    pub source_id: String,
    pub anchor: Option<String>,
}

/// Classification of one raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<'a> {
    Content(&'a str),
    SeeAlso(String),
    Redirect(RedirectInstruction),
}

/// Splits an alias record into `(word, anchor)`; `None` for content records
/// and for aliases without a target word, including `@@@LINK=#anchor`.
pub fn alias_target(record: &str) -> Option<(&str, Option<&str>)> {
    let target = record.strip_prefix(ALIAS_MARKER)?.trim();
    let (word, anchor) = match target.split_once('#') {
        Some((word, anchor)) => (word.trim(), Some(anchor.trim())),
        None => (target, None),
    };
    if word.is_empty() {
        return None;
    }
    Some((word, anchor))
}

pub fn is_alias(record: &str) -> bool {
    alias_target(record).is_some()
}

/// Classifies `record` given the number of records its source returned.
///
/// `entry_prefix` is only consulted in lite mode, where see-also links carry the
/// absolute lite route of the source.
pub fn resolve<'a>(
    record: &'a str,
    total_records: usize,
    mode: RenderMode,
    source_id: &str,
    entry_prefix: &str,
) -> Resolved<'a> {
    let Some((word, anchor)) = alias_target(record) else {
        return Resolved::Content(record);
    };
    let redirect = || {
        Resolved::Redirect(RedirectInstruction {
            target_word: word.to_string(),
            source_id: source_id.to_string(),
            anchor: anchor.filter(|a| !a.is_empty()).map(str::to_string),
        })
    };
    match (mode, anchor) {
        (RenderMode::Single | RenderMode::Lite, Some(_)) => redirect(),
        (RenderMode::Single | RenderMode::Lite, None) if total_records == 1 => redirect(),
        (RenderMode::Lite, None) => {
            let href = format!("{}{}", strip_scheme(entry_prefix), encode_word(word));
            Resolved::SeeAlso(see_also(&href, word))
        }
        (_, Some(anchor)) => {
            let href = format!("{}#{}", encode_word(word), encode_word(anchor));
            Resolved::SeeAlso(see_also(&href, word))
        }
        (_, None) => Resolved::SeeAlso(see_also(&encode_word(word), word)),
    }
}

fn see_also(target: &str, word: &str) -> String {
    format!(
        r#"<p>See also: <a href="{ENTRY_SCHEME}{target}">{}</a></p>"#,
        escape_html(word)
    )
}

fn encode_word(word: &str) -> String {
    utf8_percent_encode(word, WORD_SEGMENT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LITE_PREFIX: &str = "http://127.0.0.1:8080/oald/lite/?word=";

    fn run(record: &str, total: usize, mode: RenderMode) -> Resolved<'_> {
        resolve(record, total, mode, "oald", LITE_PREFIX)
    }

    #[test]
    fn content_records_pass_through() {
        assert_eq!(
            run("<p>hi</p>", 1, RenderMode::Single),
            Resolved::Content("<p>hi</p>")
        );
    }

    #[test]
    fn sole_alias_redirects_in_single_and_lite() {
        for mode in [RenderMode::Single, RenderMode::Lite] {
            assert_eq!(
                run("@@@LINK=foo", 1, mode),
                Resolved::Redirect(RedirectInstruction {
                    target_word: "foo".into(),
                    source_id: "oald".into(),
                    anchor: None,
                })
            );
        }
    }

    #[test]
    fn sole_alias_is_see_also_in_aggregate() {
        assert_eq!(
            run("@@@LINK=foo", 1, RenderMode::Aggregate),
            Resolved::SeeAlso(r#"<p>See also: <a href="entry://foo">foo</a></p>"#.into())
        );
    }

    #[test]
    fn anchored_alias_redirects_with_anchor() {
        for mode in [RenderMode::Single, RenderMode::Lite] {
            assert_eq!(
                run("@@@LINK=foo#bar", 3, mode),
                Resolved::Redirect(RedirectInstruction {
                    target_word: "foo".into(),
                    source_id: "oald".into(),
                    anchor: Some("bar".into()),
                })
            );
        }
    }

    #[test]
    fn anchored_alias_is_inline_link_in_aggregate() {
        assert_eq!(
            run("@@@LINK=foo#bar", 1, RenderMode::Aggregate),
            Resolved::SeeAlso(r#"<p>See also: <a href="entry://foo#bar">foo</a></p>"#.into())
        );
    }

    #[test]
    fn alias_among_several_records_is_see_also() {
        assert_eq!(
            run("@@@LINK= colour \r\n", 2, RenderMode::Single),
            Resolved::SeeAlso(r#"<p>See also: <a href="entry://colour">colour</a></p>"#.into())
        );
        assert_eq!(
            run("@@@LINK=colour", 2, RenderMode::Lite),
            Resolved::SeeAlso(
                r#"<p>See also: <a href="entry://127.0.0.1:8080/oald/lite/?word=colour">colour</a></p>"#
                    .into()
            )
        );
    }

    #[test]
    fn blank_alias_target_falls_back_to_content() {
        assert_eq!(
            run("@@@LINK=   ", 1, RenderMode::Single),
            Resolved::Content("@@@LINK=   ")
        );
        assert!(!is_alias("@@@LINK="));
    }

    #[test]
    fn anchor_only_alias_falls_back_to_content() {
        for mode in [RenderMode::Single, RenderMode::Aggregate, RenderMode::Lite] {
            assert_eq!(
                run("@@@LINK=#bar", 1, mode),
                Resolved::Content("@@@LINK=#bar")
            );
        }
        assert_eq!(alias_target("@@@LINK= # bar"), None);
    }

    #[test]
    fn see_also_escapes_the_word() {
        let Resolved::SeeAlso(html) = run("@@@LINK=a<b c", 2, RenderMode::Aggregate) else {
            panic!("expected see-also");
        };
        assert_eq!(html, r#"<p>See also: <a href="entry://a%3Cb%20c">a&lt;b c</a></p>"#);
    }
}
