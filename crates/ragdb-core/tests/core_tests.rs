use std::fs;
use std::io::Write;
use tempfile::TempDir;

use chrono::Utc;
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use ragdb_core::chunking::{Chunker, ChunkingConfig};
use ragdb_core::config::{expand_path, resolve_with_base, Config, EmbedDevice, Settings};
use ragdb_core::data_processor::DataProcessor;
use ragdb_core::types::{ChunkMetadata, MetaValue, MetadataFilter, Metric, SourceDocument};

#[test]
fn load_directory_single_small_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    let mut f = fs::File::create(dir.join("a.txt")).unwrap();
    writeln!(f, "Short text").unwrap();

    let docs = DataProcessor::new().load_directory(dir).expect("load");

    assert_eq!(docs.len(), 1, "one file becomes one document");
    assert_eq!(docs[0].id.as_deref(), Some("a"));
    assert_eq!(docs[0].text.trim(), "Short text");
    assert_eq!(docs[0].extra.get("category"), Some(&MetaValue::Str("/misc".into())));
}

#[test]
fn load_directory_limited_skips_empty_and_nested_category() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::create_dir_all(dir.join("fire/craft")).unwrap();
    fs::write(dir.join("fire/craft/b.txt"), "charlie delta").unwrap();
    fs::write(dir.join("a.txt"), "   ").unwrap();
    fs::write(dir.join("c.md"), "not a text file").unwrap();

    let docs = DataProcessor::new().load_directory_limited(dir, 5).expect("load");
    assert_eq!(docs.len(), 1, "blank and non-.txt files are skipped");
    assert_eq!(docs[0].extra.get("category"), Some(&MetaValue::Str("/fire/craft".into())));
}

#[test]
fn chunker_keeps_short_text_in_one_chunk() {
    let chunker = Chunker::new(ChunkingConfig::default()).expect("chunker");
    let chunks = chunker.chunk("doc1", "the quick brown fox", Utc::now());
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].id, "doc1-0");
    assert_eq!(chunks[0].source_offset.start, 0);
    assert_eq!(chunks[0].source_offset.end, "the quick brown fox".len());
}

#[test]
fn chunker_rejects_overlap_not_smaller_than_window() {
    assert!(Chunker::new(ChunkingConfig { window_tokens: 8, overlap_tokens: 8 }).is_err());
    assert!(Chunker::new(ChunkingConfig { window_tokens: 0, overlap_tokens: 0 }).is_err());
}

#[test]
fn chunker_returns_nothing_for_blank_text() {
    let chunker = Chunker::new(ChunkingConfig::default()).expect("chunker");
    assert!(chunker.chunk("doc", " \n\t ", Utc::now()).is_empty());
}

#[test]
fn metadata_filter_requires_every_clause() {
    let chunker = Chunker::new(ChunkingConfig::default()).expect("chunker");
    let mut doc = SourceDocument::new("manual", "how to light a fire");
    doc.title = Some("Fire".into());
    doc.extra.insert("lang".into(), "en".into());
    let chunk = &chunker.chunk("manual", &doc.text, Utc::now())[0];
    let meta = ChunkMetadata::for_chunk(chunk, &doc);

    assert!(MetadataFilter::default().matches(&meta));
    let mut filter = MetadataFilter { source_id: Some("manual".into()), ..MetadataFilter::default() };
    assert!(filter.matches(&meta));
    filter.extra.insert("lang".into(), "de".into());
    assert!(!filter.matches(&meta));
    filter.extra.insert("lang".into(), "en".into());
    filter.created_before = Some(meta.created_at);
    assert!(!filter.matches(&meta), "created_before is exclusive");
}

#[test]
fn settings_merge_toml_over_defaults() {
    let figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string(
        r#"
        [index]
        metric = "euclidean"

        [query]
        max_k = 20
        "#,
    ));
    let settings = Config::from_figment(figment).settings().expect("settings");
    assert_eq!(settings.index.metric, Metric::Euclidean);
    assert_eq!(settings.query.max_k, 20);
    assert_eq!(settings.query.default_k, 3, "untouched keys keep their defaults");
    assert_eq!(settings.chunking, ChunkingConfig::default());
}

#[test]
fn embedder_device_is_a_lowercase_choice() {
    assert_eq!(Settings::default().embedder.device, EmbedDevice::Auto);

    let figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string("[embedder]\ndevice = \"cpu\"\n"));
    let settings = Config::from_figment(figment).settings().expect("settings");
    assert_eq!(settings.embedder.device, EmbedDevice::Cpu);

    let figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string("[embedder]\ndevice = \"gpu\"\n"));
    assert!(Config::from_figment(figment).settings().is_err());
}

#[test]
fn settings_validation_rejects_default_k_above_max_k() {
    let figment = Figment::from(Serialized::defaults(Settings::default()))
        .merge(Toml::string("[query]\ndefault_k = 10\nmax_k = 5\n"));
    assert!(Config::from_figment(figment).settings().is_err());
}

#[test]
fn paths_expand_env_and_resolve_against_base() {
    std::env::set_var("RAGDB_TEST_DOCS", "/srv/rag");
    assert_eq!(expand_path("$RAGDB_TEST_DOCS/docs"), std::path::PathBuf::from("/srv/rag/docs"));

    let base = std::path::Path::new("/etc/ragdb");
    assert_eq!(resolve_with_base(base, "docs"), base.join("docs"));
    assert_eq!(resolve_with_base(base, "/abs/docs"), std::path::PathBuf::from("/abs/docs"));
}
