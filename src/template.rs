//! Template resolution: substitutes `{{key}}` and `{{key.path}}` tokens
//! against a flat run context.

use std::sync::LazyLock;

use regex::Regex;

use crate::engine::types::Context;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}").unwrap()
});

/// Resolve every `{{name}}` token in `template` against `context`.
///
/// Lookup order is exact key, then lowercased key; a miss substitutes the
/// literal marker `[missing: name]`. Dotted names (`key.path`) are looked
/// up verbatim — the resolver never descends into nested structures,
/// mirroring the flat-context design the engine relies on elsewhere.
pub fn resolve(template: &str, context: &Context) -> String {
    TOKEN
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            if let Some(value) = context.get(name) {
                return value.clone();
            }
            let lowered = name.to_lowercase();
            if let Some(value) = context.get(&lowered) {
                return value.clone();
            }
            format!("[missing: {name}]")
        })
        .into_owned()
}
