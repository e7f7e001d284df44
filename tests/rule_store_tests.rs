//! Rule store integration tests
//!
//! Loading from files, category isolation, and readers racing a flushing
//! reload.

use filterproxy::filtering::{Category, CategoryMask, RequestInfo, RuleStore};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

fn list_of(prefix: &str, count: usize) -> String {
    (0..count)
        .map(|i| format!("##.{}-{}\n", prefix, i))
        .collect()
}

fn request<'a>(url: &'a str, host: &'a str) -> RequestInfo<'a> {
    RequestInfo {
        url,
        host,
        page_host: None,
    }
}

#[test]
fn test_load_filter_list_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "! Title: test list").unwrap();
    writeln!(file, "example.com##.sidebar-ad").unwrap();
    writeln!(file, "||tracker.example.net^").unwrap();
    writeln!(file, "0.0.0.0 malware.example.org").unwrap();
    writeln!(file, "##[[bad").unwrap();
    file.flush().unwrap();

    let store = RuleStore::new();
    let category = Category(4);
    let counts = store
        .load_filter_list_file(file.path(), category, true)
        .unwrap();
    assert_eq!(counts.loaded, 3);
    assert_eq!(counts.failed, 1);

    let totals = store.rule_counts(category).unwrap();
    assert_eq!(totals.selectors, 1);
    assert_eq!(totals.url_triggers, 2);

    let mask = CategoryMask::only(category);
    let matches = store.lookup("www.example.com", &mask);
    assert_eq!(matches.selectors.len(), 1);

    let matches = store.lookup("malware.example.org", &mask);
    assert!(matches
        .blocking_url_trigger(&request("http://malware.example.org/", "malware.example.org"))
        .is_some());

    let matches = store.lookup("tracker.example.net", &mask);
    let trigger = matches
        .blocking_url_trigger(&request(
            "https://tracker.example.net/pixel.gif",
            "tracker.example.net",
        ))
        .unwrap();
    assert_eq!(trigger.category(), category);
}

#[test]
fn test_load_missing_file_is_error() {
    let store = RuleStore::new();
    store.load_filter_list("##.keep-me\n", Category(1), true);

    let result = store.load_filter_list_file("/nonexistent/filterproxy/list.txt", Category(1), true);
    assert!(result.is_err());
    assert_eq!(store.rule_counts(Category(1)).unwrap().selectors, 1);
}

#[test]
fn test_text_triggers_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# gambling phrases").unwrap();
    writeln!(file, "online casino").unwrap();
    writeln!(file, "Sports Betting").unwrap();
    file.flush().unwrap();

    let store = RuleStore::new();
    let counts = store
        .load_text_triggers_file(file.path(), Category(9), true)
        .unwrap();
    assert_eq!(counts.loaded, 2);

    let matches = store.lookup("anything.example", &CategoryMask::only(Category(9)));
    assert!(matches
        .matching_content_trigger("the best sports betting odds")
        .is_some());
    assert!(matches.matching_content_trigger("weather report").is_none());
}

#[test]
fn test_categories_are_isolated() {
    let store = RuleStore::new();
    store.load_filter_list(&list_of("ads", 3), Category(1), true);
    store.load_filter_list(&list_of("social", 2), Category(2), true);
    assert_eq!(store.total_rules(), 5);

    assert_eq!(
        store.lookup("example.com", &CategoryMask::only(Category(1))).selectors.len(),
        3
    );
    assert_eq!(
        store.lookup("example.com", &CategoryMask::all()).selectors.len(),
        5
    );
    assert!(store
        .lookup("example.com", &CategoryMask::empty())
        .is_empty());

    store.unload(Category(1));
    assert!(store.rule_counts(Category(1)).is_none());
    assert_eq!(store.rule_counts(Category(2)).unwrap().selectors, 2);
}

#[test]
fn test_reload_is_atomic_for_readers() {
    const RULES: usize = 50;

    let store = Arc::new(RuleStore::new());
    let category = Category(1);
    let first = list_of("first", RULES);
    let second = list_of("second", RULES);
    store.load_filter_list(&first, category, true);

    let done = Arc::new(AtomicBool::new(false));
    let mask = CategoryMask::only(category);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut lookups = 0usize;
                while !done.load(Ordering::Relaxed) || lookups == 0 {
                    let matches = store.lookup("news.example.com", &mask);
                    assert_eq!(matches.selectors.len(), RULES);

                    let from_first = matches
                        .selectors
                        .iter()
                        .filter(|s| s.original_selector().starts_with(".first-"))
                        .count();
                    assert!(
                        from_first == 0 || from_first == RULES,
                        "reader saw a mix of two list versions"
                    );
                    lookups += 1;
                }
                lookups
            })
        })
        .collect();

    for round in 0..200 {
        let text = if round % 2 == 0 { &second } else { &first };
        let counts = store.load_filter_list(text, category, true);
        assert_eq!(counts.loaded, RULES);
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}
