//! Keeps one active stylesheet and one active script across merged records.
//!
//! Concatenated dictionary records usually repeat the same `<link>` and
//! `<script>` tags. The first record keeps its stylesheets and the last record
//! keeps its scripts; every other tag has its `href`/`src` renamed to
//! `data-href`/`data-src` so the browser ignores it.

use once_cell::sync::Lazy;
use regex::Regex;

static STYLESHEET_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<link[^>]*? )href(=["'])"#).expect("valid link pattern"));
static SCRIPT_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<script[^>]*? )src(=["'])"#).expect("valid script pattern"));

pub fn deactivate_stylesheets(html: &str) -> String {
    STYLESHEET_HREF
        .replace_all(html, "${1}data-href${2}")
        .into_owned()
}

pub fn deactivate_scripts(html: &str) -> String {
    SCRIPT_SRC.replace_all(html, "${1}data-src${2}").into_owned()
}

/// Applies the keep-first-stylesheet / keep-last-script policy in place.
/// `records` must hold content records only, in output order.
pub fn dedupe(records: &mut [String]) {
    let total = records.len();
    for (index, record) in records.iter_mut().enumerate() {
        let ordinal = index + 1;
        if ordinal > 1 {
            *record = deactivate_stylesheets(record);
        }
        if ordinal < total {
            *record = deactivate_scripts(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> String {
        format!(
            r#"<link rel="stylesheet" href="r/{n}.css"><p>{n}</p><script type="text/javascript" src="r/{n}.js"></script>"#
        )
    }

    #[test]
    fn first_stylesheet_and_last_script_stay_active() {
        let mut records: Vec<String> = (1..=3).map(record).collect();
        dedupe(&mut records);

        assert!(records[0].contains(r#" href="r/1.css""#));
        assert!(records[1].contains(r#" data-href="r/2.css""#));
        assert!(records[2].contains(r#" data-href="r/3.css""#));

        assert!(records[0].contains(r#" data-src="r/1.js""#));
        assert!(records[1].contains(r#" data-src="r/2.js""#));
        assert!(records[2].contains(r#" src="r/3.js""#));
        assert!(!records[2].contains("data-src"));
    }

    #[test]
    fn single_record_is_untouched() {
        let mut records = vec![record(1)];
        dedupe(&mut records);
        assert_eq!(records[0], record(1));
    }

    #[test]
    fn deactivation_is_idempotent() {
        let once = deactivate_stylesheets(&deactivate_scripts(&record(1)));
        let twice = deactivate_stylesheets(&deactivate_scripts(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn only_link_and_script_tags_are_touched() {
        let html = r#"<a href="x.css">x</a><img src="a.png">"#;
        assert_eq!(deactivate_stylesheets(html), html);
        assert_eq!(deactivate_scripts(html), html);
    }
}
