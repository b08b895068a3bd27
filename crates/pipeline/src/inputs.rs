//! Loading of static inputs: the per-user feature table, the keyword
//! mapping, the workflow template and style seeds.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use cardsmith_core::features::{split_keywords, FeatureSet, KeywordMapping, StyleSeed, UserRecord};
use cardsmith_core::template::WorkflowTemplate;

use crate::error::PipelineError;

/// Extensions accepted for style seed images.
const STYLE_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Read the feature table. Every column becomes a field; the user id
/// comes from `id_column`. Rows without an id, with an id that is not
/// usable in a file name, or repeating an earlier id are skipped.
pub fn load_user_records(path: &Path, id_column: &str) -> Result<Vec<UserRecord>, PipelineError> {
    let csv_err = |source| PipelineError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(str::to_string)
        .collect();
    if !headers.iter().any(|h| h == id_column) {
        return Err(PipelineError::Input(format!(
            "{} has no '{id_column}' column",
            path.display()
        )));
    }

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(csv_err)?;
        let fields: BTreeMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();

        let line = idx + 2;
        match fields.get(id_column).filter(|id| !id.is_empty()) {
            None => tracing::warn!(line, "Skipping row without user id"),
            Some(id) if !is_file_safe_id(id) => {
                tracing::warn!(line, user_id = %id, "Skipping row with unusable user id");
            }
            Some(id) if !seen.insert(id.clone()) => {
                tracing::warn!(line, user_id = %id, "Skipping repeated user id");
            }
            Some(id) => records.push(UserRecord {
                user_id: id.clone(),
                fields,
            }),
        }
    }

    tracing::info!(path = %path.display(), users = records.len(), "Loaded user records");
    Ok(records)
}

/// Keep only the requested users (in table order), then apply the limit.
pub fn select_users(
    records: Vec<UserRecord>,
    only: Option<&[String]>,
    limit: Option<usize>,
) -> Vec<UserRecord> {
    let selected = records
        .into_iter()
        .filter(|r| only.map_or(true, |ids| ids.contains(&r.user_id)));
    match limit {
        Some(n) => selected.take(n).collect(),
        None => selected.collect(),
    }
}

pub fn load_keyword_mapping(path: &Path) -> Result<KeywordMapping, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| PipelineError::json(path, e))
}

pub fn load_template(path: &Path) -> Result<WorkflowTemplate, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let template = WorkflowTemplate::parse(&text)?;
    tracing::info!(
        path = %path.display(),
        name = template.name(),
        slots = template.slots().len(),
        "Loaded workflow template",
    );
    Ok(template)
}

/// Ids of every style seed under `seeds_dir`: stems of `texts/*.txt`
/// and names of `images/<id>/` directories, sorted and deduplicated.
pub fn list_style_seeds(seeds_dir: &Path) -> Result<Vec<String>, PipelineError> {
    let mut ids = Vec::new();

    let texts = seeds_dir.join("texts");
    for path in read_dir_paths(&texts)? {
        if path.extension().and_then(|e| e.to_str()) == Some("txt") && path.is_file() {
            ids.extend(path.file_stem().and_then(|s| s.to_str()).map(str::to_string));
        }
    }

    let images = seeds_dir.join("images");
    for path in read_dir_paths(&images)? {
        if path.is_dir() {
            ids.extend(path.file_name().and_then(|s| s.to_str()).map(str::to_string));
        }
    }

    ids.retain(|id| {
        let ok = is_file_safe_id(id);
        if !ok {
            tracing::warn!(seed_id = %id, "Skipping style seed with unusable id");
        }
        ok
    });
    ids.sort();
    ids.dedup();
    Ok(ids)
}

/// Load a style seed from `<seeds_dir>/images/<id>/<id>.*` and
/// `<seeds_dir>/texts/<id>.txt`. Missing parts leave the seed empty;
/// the feature mapper records the downgrade.
pub fn load_style_seed(seeds_dir: &Path, seed_id: &str) -> Result<StyleSeed, PipelineError> {
    if !is_file_safe_id(seed_id) {
        return Err(PipelineError::Input(format!(
            "style seed id '{seed_id}' cannot be used in a file name"
        )));
    }
    let image_dir = seeds_dir.join("images").join(seed_id);
    let mut images: Vec<PathBuf> = read_dir_paths(&image_dir)?
        .into_iter()
        .filter(|p| is_seed_image(p, seed_id))
        .collect();
    images.sort();

    let text_path = seeds_dir.join("texts").join(format!("{seed_id}.txt"));
    let keywords = match std::fs::read_to_string(&text_path) {
        Ok(text) => parse_style_keywords(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(PipelineError::io(&text_path, e)),
    };

    tracing::info!(seed_id, images = images.len(), keywords = keywords.len(), "Loaded style seed");
    Ok(StyleSeed {
        id: seed_id.to_string(),
        images,
        keywords,
    })
}

/// Comma- or slash-separated keywords across all lines, first occurrence kept.
pub fn parse_style_keywords(text: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for keyword in text
        .lines()
        .flat_map(|line| line.split(','))
        .flat_map(split_keywords)
    {
        if !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    keywords
}

/// Write the mapped feature sets for inspection.
pub fn write_feature_sets(path: &Path, features: &[FeatureSet]) -> Result<(), PipelineError> {
    let json = serde_json::to_vec_pretty(features).map_err(|e| PipelineError::json(path, e))?;
    std::fs::write(path, json).map_err(|e| PipelineError::io(path, e))
}

/// Ids end up in artifact file names, so they must stay a single
/// path component.
pub fn is_file_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.chars().any(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
}

fn read_dir_paths(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(PipelineError::io(dir, e)),
    }
}

fn is_seed_image(path: &Path, seed_id: &str) -> bool {
    let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(seed_id);
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| STYLE_IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    stem_matches && ext_ok && path.is_file()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    // -- user records --

    #[test]
    fn csv_rows_become_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        write(
            &path,
            "number,User color preference,User visual style preference\n\
             1, Dark/Neon ,Gothic\n\
             ,Bright,Cute\n\
             3,Pastel\n",
        );

        let records = load_user_records(&path, "number").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, "1");
        assert_eq!(records[0].field("User color preference"), Some("Dark/Neon"));
        assert_eq!(records[1].user_id, "3");
        assert_eq!(records[1].field("User visual style preference"), None);
    }

    #[test]
    fn repeated_and_unsafe_ids_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        write(
            &path,
            "number,color\n\
             1,red\n\
             ../etc,blue\n\
             a/b,green\n\
             1,black\n\
             2,white\n",
        );

        let records = load_user_records(&path, "number").unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(records[0].field("color"), Some("red"));
    }

    #[test]
    fn file_safe_ids() {
        assert!(is_file_safe_id("42"));
        assert!(is_file_safe_id("user 7"));
        assert!(!is_file_safe_id(""));
        assert!(!is_file_safe_id(".."));
        assert!(!is_file_safe_id("a\\b"));
        assert!(!is_file_safe_id("x/y"));
    }

    #[test]
    fn missing_id_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        write(&path, "id,color\n1,red\n");
        assert_matches!(load_user_records(&path, "number"), Err(PipelineError::Input(_)));
    }

    #[test]
    fn selection_filters_then_limits() {
        let records: Vec<UserRecord> = ["1", "2", "3", "4"]
            .iter()
            .map(|id| UserRecord {
                user_id: id.to_string(),
                fields: BTreeMap::new(),
            })
            .collect();

        let only = vec!["4".to_string(), "2".to_string(), "3".to_string()];
        let picked = select_users(records.clone(), Some(only.as_slice()), Some(2));
        let ids: Vec<_> = picked.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        assert_eq!(select_users(records, None, None).len(), 4);
    }

    // -- style seeds --

    #[test]
    fn style_seed_collects_matching_images_and_keywords() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("images/s1/s1.png"), "a");
        write(&dir.path().join("images/s1/s1.jpg"), "b");
        write(&dir.path().join("images/s1/other.png"), "c");
        write(&dir.path().join("images/s1/s1.txt"), "d");
        write(
            &dir.path().join("texts/s1.txt"),
            "ink wash, ukiyo-e\nmuted tones, ink wash\n",
        );

        let seed = load_style_seed(dir.path(), "s1").unwrap();
        assert_eq!(
            seed.images,
            vec![
                dir.path().join("images/s1/s1.jpg"),
                dir.path().join("images/s1/s1.png"),
            ]
        );
        assert_eq!(seed.keywords, vec!["ink wash", "ukiyo-e", "muted tones"]);
    }

    #[test]
    fn style_seeds_are_listed_from_texts_and_image_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("texts/s2.txt"), "ink");
        write(&dir.path().join("texts/s1.txt"), "wash");
        write(&dir.path().join("texts/notes.md"), "x");
        write(&dir.path().join("images/s1/s1.png"), "a");
        write(&dir.path().join("images/s3/s3.png"), "b");

        assert_eq!(list_style_seeds(dir.path()).unwrap(), vec!["s1", "s2", "s3"]);
        assert!(list_style_seeds(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn style_seed_id_must_be_file_safe() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(load_style_seed(dir.path(), "../s1"), Err(PipelineError::Input(_)));
    }

    #[test]
    fn missing_style_seed_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let seed = load_style_seed(dir.path(), "nope").unwrap();
        assert!(seed.images.is_empty());
        assert!(seed.keywords.is_empty());
    }

    // -- configuration documents --

    #[test]
    fn keyword_mapping_and_template_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mapping_path = dir.path().join("mapping.json");
        write(&mapping_path, r#"{ "id_column": "uid", "negative_count": 3 }"#);
        let mapping = load_keyword_mapping(&mapping_path).unwrap();
        assert_eq!(mapping.id_column, "uid");
        assert_eq!(mapping.negative_count, 3);

        let template_path = dir.path().join("template.json");
        write(
            &template_path,
            r#"{ "name": "t", "graph": { "1": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } } },
                 "slots": [ { "node": "1", "field": "filename_prefix", "key": "filename_prefix", "kind": "text" } ] }"#,
        );
        let template = load_template(&template_path).unwrap();
        assert_eq!(template.slots().len(), 1);
    }

    #[test]
    fn shipped_configuration_resolves_a_user() {
        use cardsmith_core::builder::resolve;
        use cardsmith_core::features::{build_feature_set, MapperContext};

        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");
        let mapping = load_keyword_mapping(&root.join("keyword_mapping.json")).unwrap();
        let template = load_template(&root.join("workflow_template.json")).unwrap();

        let record = UserRecord {
            user_id: "42".into(),
            fields: BTreeMap::from([
                ("number".to_string(), "42".to_string()),
                (
                    "What is your favorite type of movies or games?".to_string(),
                    "Cyberpunk/Horror".to_string(),
                ),
                (
                    "Which character or monster type do you like best?".to_string(),
                    "Mecha Dragons".to_string(),
                ),
                ("User color preference".to_string(), "Metallic".to_string()),
            ]),
        };
        let features = build_feature_set(&record, &mapping, MapperContext::default());
        let job = resolve(&template, &features).unwrap();

        assert_eq!(job.graph["18"]["inputs"]["filename_prefix"], "monster_42");
        assert!(job.graph["2"]["inputs"]["text"]
            .as_str()
            .unwrap()
            .starts_with("a dragon"));
        assert!(job.uploads.is_empty());
    }

    #[test]
    fn invalid_template_surfaces_core_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.json");
        write(&path, r#"{ "name": "t", "graph": {} }"#);
        assert_matches!(load_template(&path), Err(PipelineError::Core(_)));
    }
}
