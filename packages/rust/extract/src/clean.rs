//! Boilerplate removal on an isolated copy of a content region.

use scraper::{Html, Selector};

/// Parse `html` into a fresh fragment and detach every element matching any selector.
///
/// The source document is never modified. Elements nested inside an already removed
/// subtree are detached along with it.
pub fn clean_fragment<'a, I>(html: &str, selectors: I) -> Html
where
    I: IntoIterator<Item = &'a Selector>,
{
    let mut fragment = Html::parse_fragment(html);

    let doomed: Vec<ego_tree::NodeId> = selectors
        .into_iter()
        .flat_map(|sel| fragment.select(sel).map(|el| el.id()).collect::<Vec<_>>())
        .collect();

    for id in doomed {
        if let Some(mut node) = fragment.tree.get_mut(id) {
            node.detach();
        }
    }

    fragment
}
