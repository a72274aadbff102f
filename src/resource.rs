//! Serving of dictionary resources (stylesheets, scripts, images, audio).

use std::num::NonZeroUsize;
use std::sync::Arc;

use include_dir::{Dir, include_dir};
use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ResourceError;
use crate::source::{DictionarySource, SourceKind, SourceRegistry};

static BUILTIN_ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/static");

/// Built-in files any dictionary may fall back to.
const SHARED_FALLBACKS: &[&str] = &["logo.ico", "css/reset.css", "css/mdict.css"];
const CACHEABLE_EXTENSIONS: &[&str] = &["css", "js", "png", "jpg", "woff2"];
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

static CSS_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid comment pattern"));

/// Files bundled with the crate, served under `/static`.
pub fn builtin_asset(path: &str) -> Option<&'static [u8]> {
    BUILTIN_ASSETS
        .get_file(path.trim_start_matches('/'))
        .map(|file| file.contents())
}

type CacheKey = (String, String);

/// Loads resources for installed dictionaries.
///
/// Stylesheets are scoped to the dictionary's `#class_<id>` wrapper. A
/// stylesheet that cannot be scoped leaves a sticky error on the dictionary
/// until a later stylesheet succeeds.
pub struct ResourceService {
    registry: Arc<SourceRegistry>,
    cache: Option<Mutex<LruCache<CacheKey, Arc<[u8]>>>>,
}

impl ResourceService {
    pub fn new(registry: Arc<SourceRegistry>, cache_capacity: Option<usize>) -> Self {
        let cache = cache_capacity
            .and_then(NonZeroUsize::new)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));
        Self { registry, cache }
    }

    pub fn fetch(&self, source_id: &str, path: &str) -> Result<Arc<[u8]>, ResourceError> {
        let path = path.trim().trim_start_matches('/');
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| ResourceError::SourceNotFound(source_id.to_string()))?;
        let Some(cache) = self.cache.as_ref().filter(|_| is_cacheable(path)) else {
            return self.load(source, path);
        };
        let key = (source.id.clone(), path.to_string());
        if let Some(data) = cache.lock().get(&key) {
            return Ok(Arc::clone(data));
        }
        // The lock is released while loading.
        let data = self.load(source, path)?;
        let mut cache = cache.lock();
        Ok(Arc::clone(cache.get_or_insert(key, || data)))
    }

    fn load(&self, source: &DictionarySource, path: &str) -> Result<Arc<[u8]>, ResourceError> {
        let data = match source.kind {
            SourceKind::StaticLookup => source.lookup_resource(path),
            SourceKind::DynamicApp => None,
        };
        let data = data
            .or_else(|| {
                let shared = SHARED_FALLBACKS.contains(&path) || source.kind == SourceKind::DynamicApp;
                shared
                    .then(|| builtin_asset(path))
                    .flatten()
                    .map(<[u8]>::to_vec)
            })
            .ok_or_else(|| ResourceError::NotFound(path.to_string()))?;
        debug!(source = %source.id, path, bytes = data.len(), "loaded resource");

        if !path.ends_with(".css") {
            return Ok(data.into());
        }
        let errors = self.registry.errors();
        let scoped = String::from_utf8(data)
            .map_err(|err| err.to_string())
            .and_then(|css| scope_css(&format!("#class_{}", source.id), &css));
        match scoped {
            Ok(css) => {
                errors.clear(&source.id);
                Ok(css.into_bytes().into())
            }
            Err(reason) => {
                let err = ResourceError::Stylesheet {
                    path: path.to_string(),
                    reason,
                };
                warn!(source = %source.id, error = %err, "failed to scope stylesheet");
                errors.set(&source.id, err.to_string());
                Err(err)
            }
        }
    }
}

fn is_cacheable(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| CACHEABLE_EXTENSIONS.contains(&ext))
}

/// Prefixes every selector in `css` with `scope`. `html`, `body` and `:root`
/// selectors are replaced by the scope itself.
pub fn scope_css(scope: &str, css: &str) -> Result<String, String> {
    let css = CSS_COMMENT.replace_all(css, "");
    let mut out = String::with_capacity(css.len() + css.len() / 4);
    scope_rules(scope, &css, &mut out)?;
    Ok(out)
}

fn scope_rules(scope: &str, css: &str, out: &mut String) -> Result<(), String> {
    let mut rest = css.trim_start();
    while !rest.is_empty() {
        if rest.starts_with('@') {
            let semi = rest.find(';');
            let open = rest.find('{');
            if let Some(semi) = semi.filter(|&semi| open.is_none_or(|open| semi < open)) {
                out.push_str(rest[..=semi].trim());
                out.push('\n');
                rest = rest[semi + 1..].trim_start();
                continue;
            }
        }
        let open = rest
            .find('{')
            .ok_or_else(|| format!("expected a rule block near {:?}", snippet(rest)))?;
        let prelude = rest[..open].trim();
        if prelude.contains('}') {
            return Err(format!("unexpected '}}' near {:?}", snippet(rest)));
        }
        let close = matching_brace(rest, open)?;
        let body = &rest[open + 1..close];
        if prelude.starts_with("@media") || prelude.starts_with("@supports") {
            out.push_str(prelude);
            out.push_str(" {\n");
            scope_rules(scope, body, out)?;
            out.push_str("}\n");
        } else if prelude.starts_with('@') {
            out.push_str(prelude);
            out.push_str(" {");
            out.push_str(body);
            out.push_str("}\n");
        } else {
            out.push_str(&scope_selectors(scope, prelude));
            out.push_str(" {");
            out.push_str(body);
            out.push_str("}\n");
        }
        rest = rest[close + 1..].trim_start();
    }
    Ok(())
}

fn scope_selectors(scope: &str, prelude: &str) -> String {
    prelude
        .split(',')
        .map(str::trim)
        .filter(|selector| !selector.is_empty())
        .map(|selector| {
            for root in ["html", "body", ":root"] {
                if let Some(rest) = selector.strip_prefix(root) {
                    if rest.is_empty() || rest.starts_with([' ', '.', '#', ':', '[', '>']) {
                        return format!("{scope}{rest}");
                    }
                }
            }
            format!("{scope} {selector}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn matching_brace(css: &str, open: usize) -> Result<usize, String> {
    let mut depth = 0usize;
    for (idx, ch) in css[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(open + idx);
                }
            }
            _ => {}
        }
    }
    Err(format!("unbalanced braces near {:?}", snippet(&css[open..])))
}

fn snippet(css: &str) -> String {
    css.chars().take(40).collect()
}
