//! Per-origin robots.txt cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Client;
use robotstxt::RobotsParseHandler;
use robotstxt::matcher::{LongestMatchRobotsMatchStrategy, RobotsMatchStrategy};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

/// Parsed robots.txt rules keyed by `scheme://host[:port]`. Each origin's file is fetched
/// and parsed at most once; later checks only match paths against the cached rules.
///
/// `None` means the file could not be retrieved, which allows everything.
#[derive(Debug, Default)]
pub(crate) struct RobotsCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Option<RobotsRules>>>>>,
}

impl RobotsCache {
    pub(crate) async fn is_allowed(&self, client: &Client, url: &Url, user_agent: &str) -> bool {
        if url.host_str().is_none() {
            return true;
        }
        let origin = url.origin().ascii_serialization();

        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(origin.clone()).or_default())
        };

        let rules = cell
            .get_or_init(|| async {
                let body = fetch_robots_txt(client, &origin).await?;
                Some(RobotsRules::parse(&body, user_agent))
            })
            .await;

        rules
            .as_ref()
            .is_none_or(|rules| rules.allows(&robotstxt::get_path_params_query(url.as_str())))
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    allow: bool,
    pattern: String,
}

/// The groups of one robots.txt that apply to a single crawler.
///
/// Longest matching pattern wins and `Allow` wins ties. Groups naming the crawler replace
/// the `*` group entirely once any of them exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RobotsRules {
    specific: Vec<Rule>,
    global: Vec<Rule>,
    has_specific_group: bool,
}

impl RobotsRules {
    pub(crate) fn parse(body: &str, user_agent: &str) -> Self {
        let mut collector = RuleCollector {
            product: product_token(user_agent),
            rules: RobotsRules::default(),
            in_global: false,
            in_specific: false,
            seen_separator: false,
        };
        robotstxt::parse_robotstxt(body, &mut collector);
        collector.rules
    }

    /// `path` is the path, params and query of the URL, starting with `/`.
    pub(crate) fn allows(&self, path: &str) -> bool {
        let (allow, disallow) = best_matches(&self.specific, path);
        if allow > 0 || disallow > 0 {
            return disallow <= allow;
        }
        if self.has_specific_group {
            return true;
        }
        let (allow, disallow) = best_matches(&self.global, path);
        if allow > 0 || disallow > 0 {
            return disallow <= allow;
        }
        true
    }
}

/// Longest allow and disallow match lengths, `-1` when nothing matches.
fn best_matches(rules: &[Rule], path: &str) -> (i32, i32) {
    rules.iter().fold((-1, -1), |(allow, disallow), rule| {
        if !LongestMatchRobotsMatchStrategy::matches(path, &rule.pattern) {
            return (allow, disallow);
        }
        let priority = i32::try_from(rule.pattern.len()).unwrap_or(i32::MAX);
        if rule.allow {
            (allow.max(priority), disallow)
        } else {
            (allow, disallow.max(priority))
        }
    })
}

/// `HarvesterBot/1.0 (+https://…)` matches robots groups named `HarvesterBot`.
fn product_token(user_agent: &str) -> &str {
    let end = user_agent
        .find(|c: char| !(c.is_ascii_alphabetic() || c == '-' || c == '_'))
        .unwrap_or(user_agent.len());
    &user_agent[..end]
}

struct RuleCollector<'a> {
    product: &'a str,
    rules: RobotsRules,
    in_global: bool,
    in_specific: bool,
    seen_separator: bool,
}

impl RuleCollector<'_> {
    fn push(&mut self, allow: bool, pattern: &str) {
        if !self.in_global && !self.in_specific {
            return;
        }
        self.seen_separator = true;
        let target = if self.in_specific {
            &mut self.rules.specific
        } else {
            &mut self.rules.global
        };
        target.push(Rule {
            allow,
            pattern: pattern.to_string(),
        });
        // `/dir/index.html` also allows `/dir/`.
        if allow {
            if let Some(slash) = pattern.rfind('/') {
                if pattern[slash..].starts_with("/index.htm") {
                    target.push(Rule {
                        allow,
                        pattern: format!("{}$", &pattern[..=slash]),
                    });
                }
            }
        }
    }
}

impl RobotsParseHandler for RuleCollector<'_> {
    fn handle_robots_start(&mut self) {}

    fn handle_robots_end(&mut self) {}

    fn handle_user_agent(&mut self, _line_num: u32, user_agent: &str) {
        if self.seen_separator {
            self.in_global = false;
            self.in_specific = false;
            self.seen_separator = false;
        }
        let global = user_agent.starts_with('*')
            && (user_agent.len() == 1 || user_agent[1..].starts_with(char::is_whitespace));
        if global {
            self.in_global = true;
        } else if !self.product.is_empty()
            && product_token(user_agent).eq_ignore_ascii_case(self.product)
        {
            self.in_specific = true;
            self.rules.has_specific_group = true;
        }
    }

    fn handle_allow(&mut self, _line_num: u32, value: &str) {
        self.push(true, value);
    }

    fn handle_disallow(&mut self, _line_num: u32, value: &str) {
        self.push(false, value);
    }

    fn handle_sitemap(&mut self, _line_num: u32, _value: &str) {
        self.seen_separator = true;
    }

    fn handle_unknown_action(&mut self, _line_num: u32, _action: &str, _value: &str) {
        self.seen_separator = true;
    }
}

async fn fetch_robots_txt(client: &Client, origin: &str) -> Option<String> {
    let robots_url = format!("{origin}/robots.txt");
    let response = match client.get(&robots_url).send().await {
        Ok(r) => r,
        Err(e) => {
            debug!(url = %robots_url, error = %e, "robots.txt unreachable, allowing all");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(url = %robots_url, status = %response.status(), "no robots.txt, allowing all");
        return None;
    }
    response.text().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "\
User-agent: *
Disallow: /private
Allow: /private/editais

User-agent: HarvesterBot
Disallow: /interno
";

    #[test]
    fn global_group_longest_match_wins() {
        let rules = RobotsRules::parse(BODY, "OtherBot/2.0");
        assert!(!rules.allows("/private/page"));
        assert!(rules.allows("/private/editais/2024.pdf"));
        assert!(rules.allows("/interno"));
        assert!(rules.allows("/"));
    }

    #[test]
    fn named_group_replaces_global_rules() {
        let rules = RobotsRules::parse(BODY, "HarvesterBot/1.0 (+https://example.org)");
        assert!(!rules.allows("/interno/relatorio"));
        assert!(rules.allows("/private/page"));
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n", "HarvesterBot");
        assert!(rules.allows("/qualquer"));
        assert!(RobotsRules::parse("", "HarvesterBot").allows("/"));
    }

    #[test]
    fn index_page_allow_covers_directory() {
        let rules = RobotsRules::parse(
            "User-agent: *\nDisallow: /docs\nAllow: /docs/index.html\n",
            "HarvesterBot",
        );
        assert!(rules.allows("/docs/"));
        assert!(!rules.allows("/docs/outro"));
    }

    #[test]
    fn wildcard_and_anchor_patterns() {
        let rules = RobotsRules::parse(
            "User-agent: *\nDisallow: /*.pdf$\nDisallow: /busca?\n",
            "HarvesterBot",
        );
        assert!(!rules.allows("/edital/2024.pdf"));
        assert!(rules.allows("/edital/2024.pdf.html"));
        assert!(!rules.allows("/busca?q=enem"));
    }
}
