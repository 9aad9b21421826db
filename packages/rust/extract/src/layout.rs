//! Declarative layout detection.
//!
//! A [`LayoutTable`] maps a page URL to a named [`Layout`] (a list of cleanup selectors) or
//! to [`LayoutMatch::Skip`]. Rules are plain data, loaded from TOML: the built-in table is
//! compiled into the binary and a site-specific file can replace it.

use std::collections::HashMap;
use std::path::Path;

use scraper::Selector;
use serde::Deserialize;
use tracing::debug;

use harvester_shared::{HarvestError, Result};

/// Built-in rule table.
const BUILTIN_RULES: &str = include_str!("../layouts.toml");

/// Reserved layout name meaning "extract links only".
const SKIP: &str = "skip";

// ---------------------------------------------------------------------------
// TOML schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RuleFile {
    default_layout: String,
    #[serde(default)]
    always_remove: Vec<String>,
    #[serde(default)]
    skip_tables: Vec<String>,
    #[serde(default)]
    layouts: Vec<LayoutDef>,
    #[serde(default)]
    rules: Vec<RuleDef>,
    #[serde(default)]
    context_seeds: Vec<ContextSeed>,
}

#[derive(Debug, Deserialize)]
struct LayoutDef {
    name: String,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleDef {
    layout: String,
    #[serde(rename = "match")]
    kind: MatchKind,
    patterns: Vec<String>,
    #[serde(default)]
    unless: Vec<String>,
}

/// How a rule pattern is compared with the lowercased URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Substring,
    Suffix,
}

#[derive(Debug, Clone, Deserialize)]
struct ContextSeed {
    contains: String,
    label: String,
}

// ---------------------------------------------------------------------------
// Compiled table
// ---------------------------------------------------------------------------

/// A named layout and the selectors removed from its content region.
#[derive(Debug, Clone)]
pub struct Layout {
    name: String,
    remove: Vec<Selector>,
}

impl Layout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.remove
    }
}

/// Outcome of [`LayoutTable::detect`].
#[derive(Debug, Clone, Copy)]
pub enum LayoutMatch<'a> {
    /// Collect links only.
    Skip,
    Layout(&'a Layout),
}

impl LayoutMatch<'_> {
    pub fn name(&self) -> &str {
        match self {
            Self::Skip => SKIP,
            Self::Layout(layout) => layout.name(),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    /// Index into `layouts`, `None` for skip.
    target: Option<usize>,
    kind: MatchKind,
    patterns: Vec<String>,
    unless: Vec<String>,
}

impl Rule {
    fn matches(&self, url: &str) -> bool {
        let exact = canonical(url);
        if self.unless.iter().any(|u| *u == exact) {
            return false;
        }
        self.patterns.iter().any(|p| match self.kind {
            MatchKind::Exact => *p == exact,
            MatchKind::Substring => url.contains(p.as_str()),
            MatchKind::Suffix => exact.ends_with(p.as_str()),
        })
    }
}

/// Ordered URL rules, named layouts, and context seeds.
#[derive(Debug, Clone)]
pub struct LayoutTable {
    layouts: Vec<Layout>,
    rules: Vec<Rule>,
    default: usize,
    always_remove: Vec<Selector>,
    skip_tables: Vec<String>,
    seeds: Vec<ContextSeed>,
}

impl LayoutTable {
    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_RULES)
    }

    /// Load a replacement table from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a rule table.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(content)
            .map_err(|e| HarvestError::parse(format!("layout rules: {e}")))?;

        let mut index = HashMap::new();
        let mut layouts = Vec::with_capacity(file.layouts.len());
        for def in file.layouts {
            if def.name == SKIP {
                return Err(HarvestError::validation("'skip' is reserved and cannot name a layout"));
            }
            if index.insert(def.name.clone(), layouts.len()).is_some() {
                return Err(HarvestError::validation(format!(
                    "layout '{}' is defined twice",
                    def.name
                )));
            }
            layouts.push(Layout {
                remove: parse_selectors(&def.remove, &def.name)?,
                name: def.name,
            });
        }

        let default = *index.get(&file.default_layout).ok_or_else(|| {
            HarvestError::validation(format!(
                "default layout '{}' is not defined",
                file.default_layout
            ))
        })?;

        let rules = file
            .rules
            .into_iter()
            .enumerate()
            .map(|(i, def)| {
                let target = if def.layout == SKIP {
                    None
                } else {
                    Some(*index.get(&def.layout).ok_or_else(|| {
                        HarvestError::validation(format!(
                            "rule {} points at unknown layout '{}'",
                            i + 1,
                            def.layout
                        ))
                    })?)
                };
                let patterns = def
                    .patterns
                    .iter()
                    .map(|p| match def.kind {
                        MatchKind::Exact => canonical(p),
                        _ => p.to_lowercase(),
                    })
                    .collect();
                Ok(Rule {
                    target,
                    kind: def.kind,
                    patterns,
                    unless: def.unless.iter().map(|u| canonical(u)).collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            always_remove: parse_selectors(&file.always_remove, "always_remove")?,
            skip_tables: file.skip_tables.iter().map(|u| canonical(u)).collect(),
            seeds: file
                .context_seeds
                .into_iter()
                .map(|s| ContextSeed {
                    contains: s.contains.to_lowercase(),
                    label: s.label,
                })
                .collect(),
            layouts,
            rules,
            default,
        })
    }

    /// First matching rule wins; no match yields the default layout.
    pub fn detect(&self, url: &str) -> LayoutMatch<'_> {
        let url = url.trim().to_lowercase();
        for rule in &self.rules {
            if rule.matches(&url) {
                let matched = match rule.target {
                    Some(i) => LayoutMatch::Layout(&self.layouts[i]),
                    None => LayoutMatch::Skip,
                };
                debug!(url = %url, layout = matched.name(), "layout detected");
                return matched;
            }
        }
        LayoutMatch::Layout(&self.layouts[self.default])
    }

    /// Selectors removed on every page in addition to the layout's own.
    pub fn always_remove(&self) -> &[Selector] {
        &self.always_remove
    }

    /// Labels of the context seeds whose substring occurs in `url`, in table order.
    pub fn context_seeds<'a>(&'a self, url: &str) -> impl Iterator<Item = &'a str> + 'a {
        let url = url.to_lowercase();
        self.seeds
            .iter()
            .filter(move |s| url.contains(s.contains.as_str()))
            .map(|s| s.label.as_str())
    }

    /// Whether tables on `url` should be ignored.
    pub fn skips_tables(&self, url: &str) -> bool {
        let url = canonical(url);
        self.skip_tables.iter().any(|u| *u == url)
    }

    pub fn layout(&self, name: &str) -> Option<&Layout> {
        self.layouts.iter().find(|l| l.name == name)
    }
}

fn parse_selectors(raw: &[String], owner: &str) -> Result<Vec<Selector>> {
    raw.iter()
        .map(|s| {
            Selector::parse(s).map_err(|e| {
                HarvestError::validation(format!("invalid selector '{s}' in {owner}: {e}"))
            })
        })
        .collect()
}

/// Lowercase, trimmed, without trailing slashes.
fn canonical(url: &str) -> String {
    url.trim().to_lowercase().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LayoutTable {
        LayoutTable::builtin().expect("built-in table is valid")
    }

    #[test]
    fn builtin_table_loads() {
        let t = table();
        assert!(t.layout("default").is_some());
        assert!(t.layout("news_article").is_some());
        assert!(!t.always_remove().is_empty());
    }

    #[test]
    fn unknown_url_gets_default_layout() {
        let t = table();
        assert_eq!(t.detect("https://example.gov.br/qualquer-coisa").name(), "default");
    }

    #[test]
    fn skip_rules() {
        let t = table();
        assert!(matches!(t.detect("https://ifpi.edu.br/"), LayoutMatch::Skip));
        assert!(matches!(t.detect("https://ifpi.edu.br/picos"), LayoutMatch::Skip));
        assert!(matches!(
            t.detect("https://ifpi.edu.br/edital-2025.pdf"),
            LayoutMatch::Skip
        ));
        assert!(matches!(
            t.detect("https://ifpi.edu.br/floriano/o-campus"),
            LayoutMatch::Skip
        ));
    }

    #[test]
    fn rule_order_and_vetoes() {
        let t = table();
        assert_eq!(
            t.detect("https://ifpi.edu.br/ultimas-noticias/noticias/resultado").name(),
            "news_article"
        );
        assert_eq!(
            t.detect("https://ifpi.edu.br/area-do-estudante/bolsas").name(),
            "student_area"
        );
        // Vetoed from the student area rule, caught by a later exact rule.
        assert_eq!(
            t.detect("https://ifpi.edu.br/area-do-estudante/bibliotecas/periodicos-eletronicos")
                .name(),
            "process_lookup"
        );
        assert_eq!(
            t.detect("https://ifpi.edu.br/processos-seletivos/sisu").name(),
            "byline_links"
        );
        assert_eq!(
            t.detect("https://ifpi.edu.br/processos-seletivos/vestibular").name(),
            "byline_outstanding_header"
        );
        assert_eq!(t.detect("https://ifpi.edu.br/ensino/cursos").name(), "document_byline");
    }

    #[test]
    fn exact_match_ignores_case_and_trailing_slash() {
        let t = table();
        assert_eq!(t.detect("https://IFPI.edu.br/Profept/").name(), "tile_outstanding_header");
    }

    #[test]
    fn context_seeds_match_url_substring() {
        let t = table();
        let seeds: Vec<_> = t.context_seeds("https://ifpi.edu.br/picos/noticias/x").collect();
        assert_eq!(seeds, vec!["Conteúdo sobre o campus Picos"]);
        assert_eq!(t.context_seeds("https://ifpi.edu.br/reitoria").count(), 0);
    }

    #[test]
    fn custom_table_validation() {
        let bad_layout = r#"
default_layout = "default"
[[layouts]]
name = "default"
[[rules]]
layout = "missing"
match = "exact"
patterns = ["https://a.gov.br"]
"#;
        let err = LayoutTable::from_toml(bad_layout).unwrap_err();
        assert!(err.to_string().contains("unknown layout 'missing'"));

        let bad_selector = r#"
default_layout = "default"
[[layouts]]
name = "default"
remove = ["..nope"]
"#;
        assert!(LayoutTable::from_toml(bad_selector).is_err());

        let no_default = r#"
default_layout = "main"
"#;
        assert!(LayoutTable::from_toml(no_default).is_err());
    }

    #[test]
    fn custom_table_rules() {
        let toml = r#"
default_layout = "plain"
skip_tables = ["https://a.gov.br/grid/"]

[[layouts]]
name = "plain"

[[layouts]]
name = "blog"
remove = [".share"]

[[rules]]
layout = "skip"
match = "suffix"
patterns = ["/login"]

[[rules]]
layout = "blog"
match = "substring"
patterns = ["/blog/"]
"#;
        let t = LayoutTable::from_toml(toml).expect("valid");
        assert!(matches!(t.detect("https://a.gov.br/conta/login"), LayoutMatch::Skip));
        assert_eq!(t.detect("https://a.gov.br/blog/post").name(), "blog");
        assert_eq!(t.detect("https://a.gov.br/sobre").name(), "plain");
        assert!(t.skips_tables("https://a.gov.br/grid"));
        assert_eq!(t.layout("blog").map(|l| l.selectors().len()), Some(1));
    }
}
