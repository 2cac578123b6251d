//! Minimal `.env` reader and writer for secret import and export.

use std::collections::BTreeMap;

/// Parse dotenv text into ordered `(key, value)` pairs.
///
/// Blank lines and `#` comments are skipped, an optional `export ` prefix is
/// dropped, one layer of matching quotes is stripped, and entries with an
/// empty key or value are ignored. A later duplicate key wins.
pub fn parse(content: &str) -> Vec<(String, String)> {
    let mut entries: BTreeMap<String, (usize, String)> = BTreeMap::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }

        entries.insert(key.to_string(), (index, value.to_string()));
    }

    let mut ordered: Vec<(usize, String, String)> = entries
        .into_iter()
        .map(|(key, (index, value))| (index, key, value))
        .collect();
    ordered.sort_by_key(|(index, _, _)| *index);
    ordered.into_iter().map(|(_, k, v)| (k, v)).collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Render `KEY="value"` lines sorted by key, newline terminated.
pub fn render<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: Vec<(&str, &str)> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    sorted
        .into_iter()
        .map(|(key, value)| {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            format!("{}=\"{}\"\n", key, escaped)
        })
        .collect()
}
