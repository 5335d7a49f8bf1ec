//! Parsers for install progress and `list` output

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pump::clean_line;

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(\.\d+)?)%").expect("percent pattern is valid"));

/// First percentage in a progress line, e.g. `pulling 8daa9615cce3... 42%`.
pub fn parse_percent(line: &str) -> Option<f64> {
    PERCENT.captures(line)?.get(1)?.as_str().parse().ok()
}

/// One row of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedModel {
    pub name: String,
    pub id: Option<String>,
    /// Size with unit, e.g. "3.8 GB"
    pub size: Option<String>,
}

impl ListedModel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            size: None,
        }
    }
}

const SIZE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

/// Parse tabular `list` output.
///
/// The header row (`NAME ...` or `MODEL ...`) is skipped; the first token of
/// every other row is the model name. When the row has an id and a
/// `<number> <unit>` size, those are captured too.
pub fn parse_list(output: &str) -> Vec<ListedModel> {
    let mut header_skipped = false;
    let mut models = Vec::new();

    for raw in output.lines() {
        let line = clean_line(raw);
        if line.is_empty() {
            continue;
        }
        if !header_skipped && (line.starts_with("NAME") || line.starts_with("MODEL")) {
            header_skipped = true;
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = tokens.first() else {
            continue;
        };

        let mut model = ListedModel::named(*name);
        if tokens.len() >= 4 && SIZE_UNITS.contains(&tokens[3]) {
            model.id = Some(tokens[1].to_string());
            model.size = Some(format!("{} {}", tokens[2], tokens[3]));
        }
        models.push(model);
    }

    models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integer_and_fractional_percent() {
        assert_eq!(parse_percent("42%"), Some(42.0));
        assert_eq!(
            parse_percent("pulling 8daa9615cce3... 57.5% ▕███  ▏ 2.1 GB/3.8 GB"),
            Some(57.5)
        );
    }

    #[test]
    fn lines_without_percent_are_ignored() {
        assert_eq!(parse_percent("Pulling..."), None);
        assert_eq!(parse_percent("verifying sha256 digest"), None);
    }

    #[test]
    fn parses_installed_listing() {
        let output = "NAME                    ID              SIZE      MODIFIED\n\
                      mistral:instruct        61e88e884507    4.1 GB    2 days ago\n\
                      deepseek-coder:6.7b     ce298d984115    3.8 GB    3 weeks ago\n";

        let models = parse_list(output);

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "mistral:instruct");
        assert_eq!(models[0].id.as_deref(), Some("61e88e884507"));
        assert_eq!(models[0].size.as_deref(), Some("4.1 GB"));
        assert_eq!(models[1].name, "deepseek-coder:6.7b");
    }

    #[test]
    fn parses_remote_listing_without_sizes() {
        let output = "MODEL\nllama2\n\x1B[1mzephyr:beta\x1B[0m\n\n";

        let models = parse_list(output);

        assert_eq!(
            models,
            vec![ListedModel::named("llama2"), ListedModel::named("zephyr:beta")]
        );
    }

    #[test]
    fn empty_listing() {
        assert!(parse_list("NAME ID SIZE MODIFIED\n").is_empty());
        assert!(parse_list("").is_empty());
    }
}
