//! Categorized, domain-indexed rule store
//!
//! Each category owns an immutable [`CategoryRules`] snapshot. Loads build a
//! replacement off to the side and publish the whole category map with a
//! single `ArcSwap` store, so a lookup sees either all-old or all-new rules
//! for a category and never waits on a writer. Writers are serialized by a
//! plain mutex.

use super::category::{Category, CategoryMask};
use super::domain::{normalize_host, suffixes};
use super::error::Result;
use super::rule_parser::{parse_filter_list, parse_trigger_list, ParsedRule};
use super::selector::{CategorizedSelector, SelectorException};
use super::trigger::{RequestInfo, TextTrigger};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a load call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub loaded: usize,
    pub failed: usize,
}

/// Per-category rule totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleCounts {
    pub selectors: usize,
    pub selector_exceptions: usize,
    pub url_triggers: usize,
    pub content_triggers: usize,
}

impl RuleCounts {
    pub fn total(&self) -> usize {
        self.selectors + self.selector_exceptions + self.url_triggers + self.content_triggers
    }
}

/// Domain → rules map plus a wildcard bucket consulted for every host
struct DomainIndex<T> {
    wildcard: Vec<Arc<T>>,
    by_domain: HashMap<String, Vec<Arc<T>>>,
    len: usize,
}

impl<T> DomainIndex<T> {
    fn new() -> Self {
        Self {
            wildcard: Vec::new(),
            by_domain: HashMap::new(),
            len: 0,
        }
    }

    fn insert(&mut self, domains: &[String], rule: T) {
        let rule = Arc::new(rule);
        if domains.is_empty() {
            self.wildcard.push(rule);
        } else {
            for domain in domains {
                self.by_domain
                    .entry(domain.clone())
                    .or_default()
                    .push(Arc::clone(&rule));
            }
        }
        self.len += 1;
    }

    /// Wildcard rules then every suffix bucket of `host`, each rule once
    fn collect(&self, host: &str, out: &mut Vec<Arc<T>>, seen: &mut HashSet<usize>) {
        let buckets = std::iter::once(&self.wildcard)
            .chain(suffixes(host).filter_map(|suffix| self.by_domain.get(suffix)));

        for bucket in buckets {
            for rule in bucket {
                if seen.insert(Arc::as_ptr(rule) as *const () as usize) {
                    out.push(Arc::clone(rule));
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl<T> Clone for DomainIndex<T> {
    fn clone(&self) -> Self {
        Self {
            wildcard: self.wildcard.clone(),
            by_domain: self.by_domain.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for DomainIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable rule snapshot for one category
#[derive(Clone, Default)]
pub struct CategoryRules {
    selectors: DomainIndex<CategorizedSelector>,
    selector_exceptions: DomainIndex<SelectorException>,
    url_triggers: DomainIndex<TextTrigger>,
    content_triggers: Vec<Arc<TextTrigger>>,
}

impl CategoryRules {
    fn counts(&self) -> RuleCounts {
        RuleCounts {
            selectors: self.selectors.len(),
            selector_exceptions: self.selector_exceptions.len(),
            url_triggers: self.url_triggers.len(),
            content_triggers: self.content_triggers.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }

    fn add_filter_rules(&mut self, rules: Vec<ParsedRule>) {
        for rule in rules {
            match rule {
                ParsedRule::Selector(selector) => {
                    let domains = selector.domains().to_vec();
                    self.selectors.insert(&domains, selector);
                }
                ParsedRule::SelectorException(exception) => {
                    let domains = exception.domains.clone();
                    self.selector_exceptions.insert(&domains, exception);
                }
                ParsedRule::UrlTrigger(trigger) => {
                    let domains = trigger.domains().to_vec();
                    self.url_triggers.insert(&domains, trigger);
                }
            }
        }
    }

    fn clear_filter_rules(&mut self) {
        self.selectors = DomainIndex::new();
        self.selector_exceptions = DomainIndex::new();
        self.url_triggers = DomainIndex::new();
    }
}

/// Rules applicable to one host under one category mask
#[derive(Debug, Default, Clone)]
pub struct RuleMatches {
    /// Element-hiding selectors, minus excluded and excepted ones
    pub selectors: Vec<Arc<CategorizedSelector>>,
    /// Network rules, including `@@` exceptions
    pub url_triggers: Vec<Arc<TextTrigger>>,
    /// Content phrases
    pub content_triggers: Vec<Arc<TextTrigger>>,
}

impl RuleMatches {
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
            && self.url_triggers.is_empty()
            && self.content_triggers.is_empty()
    }

    /// First blocking network rule matching the request, unless an
    /// exception rule also matches
    pub fn blocking_url_trigger(&self, request: &RequestInfo<'_>) -> Option<&TextTrigger> {
        let mut blocking = None;
        for trigger in &self.url_triggers {
            if !trigger.matches_request(request) {
                continue;
            }
            if trigger.is_exception() {
                return None;
            }
            if blocking.is_none() {
                blocking = Some(trigger.as_ref());
            }
        }
        blocking
    }

    /// First content phrase found in the lower-cased document text
    pub fn matching_content_trigger(&self, lowercase_text: &str) -> Option<&TextTrigger> {
        self.content_triggers
            .iter()
            .map(Arc::as_ref)
            .find(|trigger| trigger.matches_text(lowercase_text))
    }
}

impl std::fmt::Debug for CategoryRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryRules")
            .field("counts", &self.counts())
            .finish()
    }
}

/// Shared rule store
pub struct RuleStore {
    categories: ArcSwap<HashMap<Category, Arc<CategoryRules>>>,
    write_lock: Mutex<()>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            categories: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Load filter-list text into `category`
    ///
    /// With `flush` the category's filter-list rules are replaced; its
    /// content triggers are kept.
    pub fn load_filter_list(&self, text: &str, category: Category, flush: bool) -> LoadCounts {
        let parsed = parse_filter_list(text, category);
        let counts = LoadCounts {
            loaded: parsed.loaded(),
            failed: parsed.failed,
        };

        self.update(category, |rules| {
            if flush {
                rules.clear_filter_rules();
            }
            rules.add_filter_rules(parsed.rules);
        });

        info!(
            category = category.id(),
            loaded = counts.loaded,
            failed = counts.failed,
            flush,
            "Loaded filter list"
        );
        counts
    }

    /// Read and load a filter-list file
    ///
    /// An unreadable file leaves the store untouched.
    pub fn load_filter_list_file(
        &self,
        path: impl AsRef<Path>,
        category: Category,
        flush: bool,
    ) -> Result<LoadCounts> {
        let text = read_list(path.as_ref())?;
        Ok(self.load_filter_list(&text, category, flush))
    }

    /// Load trigger-list text into `category`
    ///
    /// With `flush` only the category's content triggers are replaced.
    pub fn load_text_triggers(&self, text: &str, category: Category, flush: bool) -> LoadCounts {
        let parsed = parse_trigger_list(text, category);
        let counts = LoadCounts {
            loaded: parsed.loaded(),
            failed: parsed.failed,
        };

        self.update(category, |rules| {
            if flush {
                rules.content_triggers.clear();
            }
            rules
                .content_triggers
                .extend(parsed.rules.into_iter().map(Arc::new));
        });

        info!(
            category = category.id(),
            loaded = counts.loaded,
            flush,
            "Loaded text triggers"
        );
        counts
    }

    pub fn load_text_triggers_file(
        &self,
        path: impl AsRef<Path>,
        category: Category,
        flush: bool,
    ) -> Result<LoadCounts> {
        let text = read_list(path.as_ref())?;
        Ok(self.load_text_triggers(&text, category, flush))
    }

    /// Remove every rule in `category`; a no-op when nothing is loaded
    pub fn unload(&self, category: Category) {
        let _guard = self.write_lock.lock();
        let current = self.categories.load();
        if !current.contains_key(&category) {
            return;
        }

        let mut next = HashMap::clone(&current);
        next.remove(&category);
        self.categories.store(Arc::new(next));
        info!(category = category.id(), "Unloaded category");
    }

    /// Collect the rules for `host` across the categories set in `mask`
    pub fn lookup(&self, host: &str, mask: &CategoryMask) -> RuleMatches {
        let host = normalize_host(host);
        let snapshot = self.categories.load();

        let mut enabled: Vec<(&Category, &Arc<CategoryRules>)> = snapshot
            .iter()
            .filter(|(category, _)| mask.contains(**category))
            .collect();
        enabled.sort_by_key(|(category, _)| **category);

        let mut matches = RuleMatches::default();
        let mut selectors = Vec::new();
        let mut exceptions = Vec::new();
        let mut seen_selectors = HashSet::new();
        let mut seen_exceptions = HashSet::new();
        let mut seen_triggers = HashSet::new();

        for (_, rules) in enabled {
            rules
                .selectors
                .collect(&host, &mut selectors, &mut seen_selectors);
            rules
                .selector_exceptions
                .collect(&host, &mut exceptions, &mut seen_exceptions);
            rules
                .url_triggers
                .collect(&host, &mut matches.url_triggers, &mut seen_triggers);
            matches
                .content_triggers
                .extend(rules.content_triggers.iter().cloned());
        }

        let excepted: HashSet<&str> = exceptions
            .iter()
            .map(|e| e.selector_text.as_str())
            .collect();

        matches.selectors = selectors
            .into_iter()
            .filter(|s| !s.is_excluded_for(&host) && !excepted.contains(s.original_selector()))
            .collect();

        debug!(
            target_host = %host,
            selectors = matches.selectors.len(),
            url_triggers = matches.url_triggers.len(),
            content_triggers = matches.content_triggers.len(),
            "Rule lookup"
        );
        matches
    }

    /// Rule totals for one category, `None` when nothing is loaded
    pub fn rule_counts(&self, category: Category) -> Option<RuleCounts> {
        self.categories.load().get(&category).map(|r| r.counts())
    }

    /// Rule total across all categories
    pub fn total_rules(&self) -> usize {
        self.categories
            .load()
            .values()
            .map(|r| r.counts().total())
            .sum()
    }

    fn update(&self, category: Category, apply: impl FnOnce(&mut CategoryRules)) {
        let _guard = self.write_lock.lock();
        let current = self.categories.load();

        let mut rules = current
            .get(&category)
            .map(|r| CategoryRules::clone(r))
            .unwrap_or_default();
        apply(&mut rules);

        let mut next = HashMap::clone(&current);
        if rules.is_empty() {
            next.remove(&category);
        } else {
            next.insert(category, Arc::new(rules));
        }
        self.categories.store(Arc::new(next));
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("total_rules", &self.total_rules())
            .finish()
    }
}

fn read_list(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(ids: &[u8]) -> CategoryMask {
        ids.iter().copied().map(Category).collect()
    }

    #[test]
    fn test_generic_selector_applies_everywhere() {
        let store = RuleStore::new();
        let counts = store.load_filter_list("##.ad-banner", Category(1), false);
        assert_eq!(counts, LoadCounts { loaded: 1, failed: 0 });

        let matches = store.lookup("any.site.org", &mask(&[1]));
        assert_eq!(matches.selectors.len(), 1);
        assert_eq!(matches.selectors[0].original_selector(), ".ad-banner");
    }

    #[test]
    fn test_lookup_respects_mask() {
        let store = RuleStore::new();
        store.load_filter_list("##.ad-banner", Category(1), false);

        assert!(store.lookup("example.com", &mask(&[2])).is_empty());
        assert!(store.lookup("example.com", &CategoryMask::empty()).is_empty());
    }

    #[test]
    fn test_domain_scoped_selector_suffix_match() {
        let store = RuleStore::new();
        store.load_filter_list("example.com##.sponsor", Category(1), false);

        let m = mask(&[1]);
        assert_eq!(store.lookup("example.com", &m).selectors.len(), 1);
        assert_eq!(store.lookup("a.b.Example.COM:443", &m).selectors.len(), 1);
        assert!(store.lookup("notexample.com", &m).selectors.is_empty());
    }

    #[test]
    fn test_multi_domain_rule_returned_once() {
        let store = RuleStore::new();
        store.load_filter_list("example.com,www.example.com##.sponsor", Category(1), false);

        let matches = store.lookup("www.example.com", &mask(&[1]));
        assert_eq!(matches.selectors.len(), 1);
    }

    #[test]
    fn test_exclusions_and_exceptions() {
        let store = RuleStore::new();
        store.load_filter_list(
            "~shop.example.com##.promo\n##.ad-banner\nnews.org#@#.ad-banner",
            Category(1),
            false,
        );

        let m = mask(&[1]);
        let shop = store.lookup("shop.example.com", &m);
        assert_eq!(shop.selectors.len(), 1);
        assert_eq!(shop.selectors[0].original_selector(), ".ad-banner");

        let news = store.lookup("www.news.org", &m);
        assert_eq!(news.selectors.len(), 1);
        assert_eq!(news.selectors[0].original_selector(), ".promo");
    }

    #[test]
    fn test_flush_replaces_only_filter_rules() {
        let store = RuleStore::new();
        store.load_filter_list("##.a\n##.b", Category(1), false);
        store.load_text_triggers("casino", Category(1), false);

        store.load_filter_list("##.c", Category(1), true);
        let counts = store.rule_counts(Category(1)).unwrap();
        assert_eq!(counts.selectors, 1);
        assert_eq!(counts.content_triggers, 1);

        store.load_text_triggers("poker\nslots", Category(1), true);
        let counts = store.rule_counts(Category(1)).unwrap();
        assert_eq!(counts.selectors, 1);
        assert_eq!(counts.content_triggers, 2);
    }

    #[test]
    fn test_append_without_flush() {
        let store = RuleStore::new();
        store.load_filter_list("##.a", Category(1), false);
        store.load_filter_list("##.b", Category(1), false);
        assert_eq!(store.rule_counts(Category(1)).unwrap().selectors, 2);
    }

    #[test]
    fn test_unload_idempotent_and_isolated() {
        let store = RuleStore::new();
        store.load_filter_list("##.a", Category(1), false);
        store.load_filter_list("##.b", Category(2), false);

        store.unload(Category(1));
        store.unload(Category(1));
        store.unload(Category(9));

        assert!(store.rule_counts(Category(1)).is_none());
        assert_eq!(store.rule_counts(Category(2)).unwrap().selectors, 1);
        assert_eq!(store.total_rules(), 1);
    }

    #[test]
    fn test_blocking_trigger_and_exception() {
        let store = RuleStore::new();
        store.load_filter_list(
            "||ads.example.com^\n@@||ads.example.com/allowed/",
            Category(1),
            false,
        );
        let matches = store.lookup("ads.example.com", &mask(&[1]));

        let blocked = RequestInfo {
            url: "http://ads.example.com/banner.gif",
            host: "ads.example.com",
            page_host: None,
        };
        assert!(matches.blocking_url_trigger(&blocked).is_some());

        let allowed = RequestInfo {
            url: "http://ads.example.com/allowed/x.gif",
            host: "ads.example.com",
            page_host: None,
        };
        assert!(matches.blocking_url_trigger(&allowed).is_none());
    }

    #[test]
    fn test_content_trigger_lookup() {
        let store = RuleStore::new();
        store.load_text_triggers("Online Casino", Category(3), false);

        let matches = store.lookup("example.com", &mask(&[3]));
        assert!(matches
            .matching_content_trigger("play at our online casino today")
            .is_some());
        assert!(matches.matching_content_trigger("nothing to see").is_none());
    }

    #[test]
    fn test_missing_file_keeps_state() {
        let store = RuleStore::new();
        store.load_filter_list("##.a", Category(1), false);

        let result = store.load_filter_list_file("/nonexistent/list.txt", Category(1), true);
        assert!(result.is_err());
        assert_eq!(store.rule_counts(Category(1)).unwrap().selectors, 1);
    }
}
