use std::path::{Path, PathBuf};
use std::sync::Arc;

use ssr_harness::persona::csv::{personas_from_csv_str, write_personas_csv};
use ssr_harness::persona::{
    filter_personas, PersonaError, PersonaFilter, PersonaLibrary, PersonaLibraryCache,
};
use tempfile::tempdir;

fn bundled_library() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("data/personas")
}

#[test]
fn bundled_library_loads_with_group_metadata() {
    let library = PersonaLibrary::load(bundled_library()).unwrap();
    let group = library.get_group("us_toothpaste_buyers").unwrap();

    assert_eq!(group.personas.len(), 4);
    assert_eq!(group.personas[0].name, "Budget Parent");
    assert_eq!(
        group.source.as_deref(),
        Some("illustrative panel, not survey-derived")
    );
    assert!((group.personas[0].weight - 1.4).abs() < 1e-12);
    assert_eq!(group.personas[1].descriptors, vec!["eco-conscious".to_string()]);
}

#[test]
fn missing_group_is_not_found() {
    let dir = tempdir().unwrap();
    let library = PersonaLibrary::load(dir.path()).unwrap();
    match library.get_group("nobody").unwrap_err() {
        PersonaError::NotFound { name, directory } => {
            assert_eq!(name, "nobody");
            assert_eq!(directory, dir.path());
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn group_added_after_load_is_found_by_reload_on_miss() {
    let dir = tempdir().unwrap();
    let library = PersonaLibrary::load(dir.path()).unwrap();
    assert!(library.group_names().is_empty());

    std::fs::write(
        dir.path().join("late.yml"),
        "personas:\n  - name: Latecomer\n",
    )
    .unwrap();
    let group = library.get_group("late").unwrap();
    assert_eq!(group.personas[0].name, "Latecomer");
}

#[test]
fn duplicate_group_names_fail_the_load() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.yml"), "group: dup\npersonas:\n  - name: A\n").unwrap();
    std::fs::write(dir.path().join("b.yaml"), "group: dup\npersonas:\n  - name: B\n").unwrap();

    let err = PersonaLibrary::load(dir.path()).unwrap_err();
    assert!(matches!(err, PersonaError::DuplicateGroup { ref name, .. } if name == "dup"));
}

#[test]
fn library_cache_shares_loaded_libraries() {
    let cache = PersonaLibraryCache::new();
    let first = cache.get(&bundled_library()).unwrap();
    let second = cache.get(&bundled_library()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    cache.invalidate(&bundled_library());
    let third = cache.get(&bundled_library()).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
}

#[test]
fn filter_combines_fields_and_keywords() {
    let library = PersonaLibrary::load(bundled_library()).unwrap();

    let mut filter = PersonaFilter {
        group: Some("us_toothpaste_buyers".into()),
        ..Default::default()
    };
    filter
        .include
        .insert("gender".into(), vec!["Female".into()]);
    let women = filter_personas(&library, &filter).unwrap();
    let names: Vec<&str> = women.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Budget Parent", "Retired Value Seeker"]);

    filter.keywords = vec!["coupons".into()];
    let couponers = filter_personas(&library, &filter).unwrap();
    assert_eq!(couponers.len(), 1);
    assert_eq!(couponers[0].name, "Retired Value Seeker");
}

#[test]
fn filter_exclude_and_limit() {
    let library = PersonaLibrary::load(bundled_library()).unwrap();
    let mut filter = PersonaFilter {
        limit: Some(1),
        ..Default::default()
    };
    filter.exclude.insert("age".into(), vec!["25-44".into()]);

    let out = filter_personas(&library, &filter).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "Retired Value Seeker");
}

#[test]
fn filter_rejects_unknown_fields() {
    let library = PersonaLibrary::load(bundled_library()).unwrap();
    let mut filter = PersonaFilter::default();
    filter.include.insert("shoe_size".into(), vec!["9".into()]);
    let err = filter_personas(&library, &filter).unwrap_err();
    assert!(matches!(err, PersonaError::UnknownField(_)));
}

#[test]
fn library_personas_survive_a_csv_round_trip() {
    let library = PersonaLibrary::load(bundled_library()).unwrap();
    let personas = library.list_personas(Some("us_toothpaste_buyers")).unwrap();

    let mut buf = Vec::new();
    write_personas_csv(&mut buf, &personas).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.starts_with("name,age,gender,income"));

    let back = personas_from_csv_str(&text).unwrap();
    assert_eq!(back.len(), personas.len());
    assert_eq!(back[0].habits, personas[0].habits);
    assert_eq!(back[3].income.as_deref(), Some("<$25k"));
    assert!((back[0].weight - 1.4).abs() < 1e-9);
}
