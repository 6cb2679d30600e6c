//! `sourceMapPathOverrides`: rewriting authored source URLs onto filesystem
//! paths. Longest key wins, a single `*` captures the suffix, `?:*` matches
//! without capturing, and keys without a wildcard keep whatever trails them.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::AdapterError;

struct Rule {
    pattern: Regex,
    replacement: String,
}

pub struct PathOverrides {
    rules: Vec<Rule>,
}

impl PathOverrides {
    pub fn new(mapping: &BTreeMap<String, String>) -> Result<Self, AdapterError> {
        let mut keys: Vec<&String> = mapping.keys().collect();
        // Longest first, measured with the non-capture marker collapsed so
        // `?:*` and `*` weigh the same; ties break lexicographically.
        keys.sort_by(|a, b| {
            let la = a.replace("?:*", "*").len();
            let lb = b.replace("?:*", "*").len();
            lb.cmp(&la).then_with(|| a.cmp(b))
        });

        let mut rules = Vec::with_capacity(keys.len());
        for key in keys {
            let right = &mapping[key];
            rules.push(compile_rule(key, right)?);
        }
        Ok(Self { rules })
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Rewrite `path` by the first matching rule, or return it unchanged.
    pub fn apply(&self, path: &str) -> String {
        for rule in &self.rules {
            if let Some(captures) = rule.pattern.captures(path) {
                let mut out = String::with_capacity(rule.replacement.len());
                let mut next_capture = 1;
                for ch in rule.replacement.chars() {
                    if ch == '*' {
                        if let Some(group) = captures.get(next_capture) {
                            out.push_str(group.as_str());
                        }
                        next_capture += 1;
                    } else {
                        out.push(ch);
                    }
                }
                return out.replace('\\', "/");
            }
        }
        path.to_string()
    }
}

fn compile_rule(key: &str, right: &str) -> Result<Rule, AdapterError> {
    let mut pattern = String::from("^");
    let mut captures = 0usize;
    let mut had_asterisk = false;

    let bytes = key.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if key[i..].starts_with("?:*") {
            pattern.push_str("(?:.*?)");
            had_asterisk = true;
            i += 3;
        } else if bytes[i] == b'*' {
            captures += 1;
            if captures > 1 {
                return Err(AdapterError::Override(format!(
                    "pattern {key:?} has more than one capturing asterisk"
                )));
            }
            pattern.push_str("(.*?)");
            had_asterisk = true;
            i += 1;
        } else {
            let ch = key[i..].chars().next().unwrap_or('\0');
            pattern.push_str(&regex::escape(&ch.to_string()));
            i += ch.len_utf8();
        }
    }

    let mut replacement = right.to_string();
    if !had_asterisk {
        // Exact-prefix rule: keep any path suffix after the matched root.
        pattern.push_str(r"([\\/].*)?");
        captures += 1;
        replacement.push('*');
    }
    pattern.push('$');

    let right_stars = replacement.matches('*').count();
    if right_stars > captures {
        return Err(AdapterError::Override(format!(
            "replacement {right:?} uses {right_stars} asterisks but {key:?} captures {captures}"
        )));
    }

    let pattern = Regex::new(&pattern)
        .map_err(|err| AdapterError::Override(format!("pattern {key:?}: {err}")))?;
    Ok(Rule {
        pattern,
        replacement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> PathOverrides {
        let mapping = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PathOverrides::new(&mapping).unwrap()
    }

    #[test]
    fn rewrites_webpack_urls_onto_the_workspace_root() {
        let rules = overrides(&[("webpack:///./*", "/wr/*")]);
        assert_eq!(rules.apply("webpack:///./a/b.js"), "/wr/a/b.js");
        assert_eq!(rules.apply("webpack:///./x"), "/wr/x");
        assert_eq!(rules.apply("other://x"), "other://x");
    }

    #[test]
    fn longest_key_wins() {
        let rules = overrides(&[
            ("webpack:///*", "/generic/*"),
            ("webpack:///./src/*", "/src/*"),
        ]);
        assert_eq!(rules.apply("webpack:///./src/a.ts"), "/src/a.ts");
        assert_eq!(rules.apply("webpack:///vendor.js"), "/generic/vendor.js");
    }

    #[test]
    fn key_without_asterisk_preserves_the_suffix() {
        let rules = overrides(&[("/root/out", "/root/src")]);
        assert_eq!(rules.apply("/root/out/deep/a.js"), "/root/src/deep/a.js");
        assert_eq!(rules.apply("/root/out"), "/root/src");
        assert_eq!(rules.apply("/root/output/a.js"), "/root/output/a.js");
    }

    #[test]
    fn non_capturing_marker_matches_without_capturing() {
        let rules = overrides(&[("webpack://?:*/./*", "/app/*")]);
        assert_eq!(rules.apply("webpack://lib/./src/x.ts"), "/app/src/x.ts");
    }

    #[test]
    fn backslashes_normalise_to_forward_slashes() {
        let rules = overrides(&[("webpack:///./*", "C:\\proj\\*")]);
        assert_eq!(rules.apply("webpack:///./a\\b.js"), "C:/proj/a/b.js");
    }

    #[test]
    fn rejects_multiple_capturing_asterisks() {
        let mapping: BTreeMap<String, String> =
            [("a/*/b/*".to_string(), "/x/*".to_string())].into();
        assert!(PathOverrides::new(&mapping).is_err());
    }

    #[test]
    fn rejects_replacement_with_excess_asterisks() {
        let mapping: BTreeMap<String, String> =
            [("a/*".to_string(), "/x/*/*".to_string())].into();
        assert!(PathOverrides::new(&mapping).is_err());
    }

    #[test]
    fn application_is_deterministic_and_idempotent() {
        let rules = overrides(&[("webpack:///./*", "/wr/*")]);
        let first = rules.apply("webpack:///./a/b.js");
        let second = rules.apply("webpack:///./a/b.js");
        assert_eq!(first, second);
        // Once rewritten the result no longer matches, so a second
        // application is the identity.
        assert_eq!(rules.apply(&first), first);
    }
}
