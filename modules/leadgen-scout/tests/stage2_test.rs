//! Directory matching against mock directory pages.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use leadgen_common::{BusinessRecord, Config, DirectoryMatchRecord, NOT_AVAILABLE};
use leadgen_scout::dataset;
use leadgen_scout::stage2::{directory_lookup_url, Stage2Pipeline};
use leadgen_scout::testing::{JsonDirectoryExtractor, MockSessionFactory};
use leadgen_scout::traits::SessionError;

fn test_config(data_dir: &Path) -> Config {
    let data_dir = data_dir.display().to_string();
    Config::from_lookup(|key| match key {
        "DATA_DIR" => Some(data_dir.clone()),
        "LEADGEN_DIRECTORY_SEARCH_URL" => Some("https://directory.test/search".into()),
        "LEADGEN_MATCH_DELAY_MS" => Some("0".into()),
        _ => None,
    })
    .unwrap()
}

fn lead(name: &str, zip: &str) -> BusinessRecord {
    BusinessRecord {
        business_name: name.into(),
        location: zip.into(),
        industry: "Roofing".into(),
        ..Default::default()
    }
}

fn url(config: &Config, name: &str, zip: &str) -> String {
    directory_lookup_url(&config.directory_search_url, name, zip).unwrap()
}

fn card(name: &str, href: &str, promoted: bool) -> String {
    format!(
        r#"{{"name": "{name}", "url": "{href}", "phone": "(404) 555-0100", "address": "1 Main St", "promoted": {promoted}}}"#
    )
}

fn pipeline(config: &Config, workers: usize, factory: Arc<MockSessionFactory>, cancel: CancellationToken) -> Stage2Pipeline {
    Stage2Pipeline::new(config, workers, factory, Arc::new(JsonDirectoryExtractor), cancel)
}

fn load_matches(config: &Config) -> Vec<DirectoryMatchRecord> {
    dataset::load_list(&config.paths().directory_matches).unwrap()
}

#[tokio::test]
async fn sponsored_only_result_is_unmatched_and_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    dataset::save_list(&config.paths().search_filtered, &[lead("Acme Roofing", "30301")]).unwrap();

    let factory = Arc::new(MockSessionFactory::new().on_page(
        &url(&config, "Acme Roofing", "30301"),
        format!("[{}]", card("Acme Roofing", "https://directory.test/sponsored", true)),
    ));
    let stage = pipeline(&config, 1, factory, CancellationToken::new());

    let outcome = stage.run_match("r1").await.unwrap();
    assert_eq!(outcome.matched, 0);
    assert_eq!(outcome.unmatched, 1);

    stage.merge().unwrap();
    let matches = load_matches(&config);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].directory_url, NOT_AVAILABLE);
    assert_eq!(matches[0].directory_name, NOT_AVAILABLE);

    assert_eq!(stage.final_filter().unwrap().total, 0);
    let leads: Vec<DirectoryMatchRecord> = dataset::load_list(&config.paths().final_leads).unwrap();
    assert!(leads.is_empty());
}

#[tokio::test]
async fn first_organic_card_wins_over_leading_ad() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    dataset::save_list(&config.paths().search_filtered, &[lead("Acme Roofing", "30301")]).unwrap();

    let factory = Arc::new(MockSessionFactory::new().on_page(
        &url(&config, "Acme Roofing", "30301"),
        format!(
            "[{}, {}, {}]",
            card("Ad Roofing", "https://directory.test/ad", true),
            card("Acme Roofing", "https://directory.test/acme", false),
            card("Acme Roofing II", "https://directory.test/acme-2", false),
        ),
    ));
    let stage = pipeline(&config, 1, factory, CancellationToken::new());
    stage.run_match("r1").await.unwrap();
    stage.merge().unwrap();

    let matches = load_matches(&config);
    assert_eq!(matches[0].directory_url, "https://directory.test/acme");
    assert_eq!(matches[0].directory_phone, "(404) 555-0100");
}

#[tokio::test]
async fn transient_failure_recreates_session_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    dataset::save_list(
        &config.paths().search_filtered,
        &[lead("Acme Roofing", "30301"), lead("Summit Roofs", "30302")],
    )
    .unwrap();

    let factory = Arc::new(
        MockSessionFactory::new()
            .on_error(
                &url(&config, "Acme Roofing", "30301"),
                SessionError::Blocked("interstitial".into()),
            )
            .on_page(
                &url(&config, "Summit Roofs", "30302"),
                format!("[{}]", card("Summit Roofs", "https://directory.test/summit", false)),
            ),
    );
    let stage = pipeline(&config, 1, factory.clone(), CancellationToken::new());

    let outcome = stage.run_match("r1").await.unwrap();
    assert_eq!(outcome.session_restarts, 1);
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.unmatched, 1);
    assert_eq!(factory.created(), 2);
    assert_eq!(factory.opened().len(), 2);

    stage.merge().unwrap();
    let matches = load_matches(&config);
    let acme = matches
        .iter()
        .find(|m| m.business.business_name == "Acme Roofing")
        .unwrap();
    assert!(!acme.is_matched());
}

#[tokio::test]
async fn other_page_failures_keep_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    dataset::save_list(
        &config.paths().search_filtered,
        &[lead("Acme Roofing", "30301"), lead("Summit Roofs", "30302")],
    )
    .unwrap();

    // Nothing registered: every open is a plain load failure.
    let factory = Arc::new(MockSessionFactory::new());
    let outcome = pipeline(&config, 1, factory.clone(), CancellationToken::new())
        .run_match("r1")
        .await
        .unwrap();
    assert_eq!(outcome.unmatched, 2);
    assert_eq!(outcome.session_restarts, 0);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn known_names_are_not_looked_up_again() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let paths = config.paths();
    dataset::save_list(
        &paths.search_filtered,
        &[
            lead("Acme Roofing", "30301"),
            lead("Summit Roofs", "30302"),
            lead("Summit Roofs", "30303"),
        ],
    )
    .unwrap();
    let mut known = DirectoryMatchRecord::unmatched(lead("Acme Roofing", "30301"));
    known.directory_url = "https://directory.test/acme".into();
    dataset::save_list(&paths.final_leads, &[known]).unwrap();

    let factory = Arc::new(MockSessionFactory::new());
    let outcome = pipeline(&config, 3, factory.clone(), CancellationToken::new())
        .run_match("r1")
        .await
        .unwrap();

    assert_eq!(outcome.candidates, 1);
    assert_eq!(factory.opened(), vec![url(&config, "Summit Roofs", "30302")]);
}

#[tokio::test]
async fn workers_flush_named_part_files_and_final_leads_dedupe() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let paths = config.paths();
    let leads: Vec<BusinessRecord> = (1..=6).map(|i| lead(&format!("Roofer {i}"), "30301")).collect();
    dataset::save_list(&paths.search_filtered, &leads).unwrap();

    let mut factory = MockSessionFactory::new();
    for i in 1..=6 {
        // Two businesses resolve to the same directory profile.
        let href = if i == 2 { "https://directory.test/roofer-1".to_string() } else { format!("https://directory.test/roofer-{i}") };
        factory = factory.on_page(
            &url(&config, &format!("Roofer {i}"), "30301"),
            format!("[{}]", card(&format!("Roofer {i}"), &href, false)),
        );
    }
    let stage = pipeline(&config, 3, Arc::new(factory), CancellationToken::new());

    let outcome = stage.run_match("run-x").await.unwrap();
    assert_eq!(outcome.matched, 6);

    let parts = dataset::partition_files(&paths.directory_parts_dir).unwrap();
    assert!(!parts.is_empty() && parts.len() <= 3);
    assert!(parts.iter().all(|p| p
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("run-x-worker-")));

    assert_eq!(stage.merge().unwrap().total, 6);
    assert_eq!(stage.final_filter().unwrap().total, 5);

    // Re-running the merge and filter changes nothing.
    assert_eq!(stage.merge().unwrap().added, 0);
    assert_eq!(stage.final_filter().unwrap().added, 0);
}

#[tokio::test]
async fn cancelled_match_still_merges() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    dataset::save_list(&config.paths().search_filtered, &[lead("Acme Roofing", "30301")]).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let stage = pipeline(&config, 2, Arc::new(MockSessionFactory::new()), cancel);
    let outcome = stage.run_match("r1").await.unwrap();
    assert!(outcome.interrupted);
    assert_eq!(stage.merge().unwrap().total, 0);
    assert_eq!(stage.final_filter().unwrap().total, 0);
}
