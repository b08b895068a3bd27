//! Per-user feature mapping.
//!
//! Turns one row of the feature table plus the static keyword mapping
//! into a flat [`FeatureSet`] whose keys are bound to workflow template
//! slots by the job builder. Mapping is best-effort: missing columns
//! and missing reference files fall back to defaults and are recorded
//! as notes, never as errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hashing::stable_seed;
use crate::types::UserId;

// ---------------------------------------------------------------------------
// Feature keys
// ---------------------------------------------------------------------------

pub const FEATURE_POSITIVE_PROMPT: &str = "positive_prompt";
pub const FEATURE_NEGATIVE_PROMPT: &str = "negative_prompt";
pub const FEATURE_CREATURE_TYPE: &str = "creature_type";
pub const FEATURE_SEED: &str = "seed";
pub const FEATURE_FILENAME_PREFIX: &str = "filename_prefix";
pub const FEATURE_CONTROL_IMAGE: &str = "control_image";

/// Prefix for cycled style reference images (`style_image_1`, ...).
pub const FEATURE_STYLE_IMAGE_PREFIX: &str = "style_image_";

/// Suffix for per-category token lists (`visual_tokens`, ...).
pub const FEATURE_TOKENS_SUFFIX: &str = "_tokens";

/// Image extensions tried for per-user reference images, in order.
pub const REFERENCE_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

const DEFAULT_STYLE_DESCRIPTION: &str = "detailed artistic style";

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One row of the feature table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub fields: BTreeMap<String, String>,
}

impl UserRecord {
    /// Trimmed, non-empty value of a column.
    pub fn field(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Keywords of a `/`-separated column, trimmed, empties dropped.
    pub fn keywords(&self, column: &str) -> Vec<String> {
        self.field(column)
            .map(split_keywords)
            .unwrap_or_default()
    }
}

/// A style seed fused into every user's job: reference images plus the
/// style keywords read from its text file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleSeed {
    pub id: String,
    pub images: Vec<PathBuf>,
    pub keywords: Vec<String>,
}

/// Filesystem context the mapper resolves reference images against.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapperContext<'a> {
    /// Directory holding `P<user_id>.<ext>` reference images.
    pub user_images_dir: Option<&'a Path>,
    pub style_seed: Option<&'a StyleSeed>,
}

// ---------------------------------------------------------------------------
// Keyword mapping configuration
// ---------------------------------------------------------------------------

/// Static keyword -> effect configuration, loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordMapping {
    /// Column holding the stable user identifier.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub categories: Vec<KeywordCategory>,
    #[serde(default)]
    pub creature: CreatureRules,
    #[serde(default = "default_quality_suffix")]
    pub quality_suffix: String,
    /// Ordered negative prompt vocabulary.
    #[serde(default)]
    pub negative_terms: Vec<String>,
    /// How many of `negative_terms` go into the negative prompt.
    #[serde(default = "default_negative_count")]
    pub negative_count: usize,
    #[serde(default)]
    pub weight_rules: Vec<WeightRule>,
    /// Numeric features every user receives unless a weight rule overrides them.
    #[serde(default)]
    pub numeric_defaults: BTreeMap<String, f64>,
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
    /// Number of `style_image_<n>` features produced from the style seed.
    #[serde(default = "default_style_image_slots")]
    pub style_image_slots: usize,
}

impl Default for KeywordMapping {
    fn default() -> Self {
        Self {
            id_column: default_id_column(),
            categories: Vec::new(),
            creature: CreatureRules::default(),
            quality_suffix: default_quality_suffix(),
            negative_terms: Vec::new(),
            negative_count: default_negative_count(),
            weight_rules: Vec::new(),
            numeric_defaults: BTreeMap::new(),
            filename_prefix: default_filename_prefix(),
            style_image_slots: default_style_image_slots(),
        }
    }
}

/// A column whose keywords expand into descriptive tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordCategory {
    pub name: String,
    pub column: String,
    /// Mapping key -> tokens. A keyword matches when it contains the key.
    #[serde(default)]
    pub keywords: BTreeMap<String, Vec<String>>,
    /// How many tokens of this category are woven into the positive prompt.
    #[serde(default)]
    pub prompt_tokens: usize,
    /// Use the raw keywords when no mapping key matches.
    #[serde(default = "default_true")]
    pub fallback_to_raw: bool,
}

/// Rules deriving the creature phrase from a column's first keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatureRules {
    pub column: Option<String>,
    /// Checked in order against the lowercased first keyword.
    #[serde(default)]
    pub rules: Vec<CreatureRule>,
    #[serde(default = "default_creature")]
    pub default: String,
}

impl Default for CreatureRules {
    fn default() -> Self {
        Self {
            column: None,
            rules: Vec::new(),
            default: default_creature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatureRule {
    pub contains: String,
    pub creature: String,
}

/// Sets a numeric feature when a column contains a keyword.
/// Later rules win over earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightRule {
    pub column: String,
    pub contains: String,
    pub feature: String,
    pub value: f64,
}

fn default_id_column() -> String {
    "number".to_string()
}

fn default_quality_suffix() -> String {
    "highly detailed, professional, masterpiece, best quality".to_string()
}

fn default_negative_count() -> usize {
    15
}

fn default_filename_prefix() -> String {
    "monster".to_string()
}

fn default_style_image_slots() -> usize {
    3
}

fn default_creature() -> String {
    "creature".to_string()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A single feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FeatureValue {
    Text(String),
    Integer(i64),
    Float(f64),
    /// A local file that must reach the backend before submission.
    Path(PathBuf),
}

/// Immutable per-user feature mapping consumed by the job builder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSet {
    user_id: UserId,
    /// Style seed fused into this set, if any.
    style_seed: Option<String>,
    /// Batch key of the job built from this set.
    key: String,
    values: BTreeMap<String, FeatureValue>,
    /// Downgrades applied while mapping (missing columns, missing files).
    notes: Vec<String>,
}

impl FeatureSet {
    /// Build a feature set from explicit values.
    pub fn from_values<I, K>(user_id: impl Into<UserId>, values: I) -> Self
    where
        I: IntoIterator<Item = (K, FeatureValue)>,
        K: Into<String>,
    {
        let user_id = user_id.into();
        Self {
            key: user_id.clone(),
            user_id,
            style_seed: None,
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            notes: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn style_seed(&self) -> Option<&str> {
        self.style_seed.as_deref()
    }

    /// Key the job is tracked under: the user id, or `<user_id>_<seed_id>`
    /// when a style seed is fused in.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, key: &str) -> Option<&FeatureValue> {
        self.values.get(key)
    }

    pub fn values(&self) -> &BTreeMap<String, FeatureValue> {
        &self.values
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Map a user record onto template parameters.
///
/// Deterministic for identical inputs: token order follows first
/// appearance, the negative prompt takes the first N configured terms,
/// and the sampler seed is derived from the user id.
pub fn build_feature_set(
    record: &UserRecord,
    mapping: &KeywordMapping,
    ctx: MapperContext<'_>,
) -> FeatureSet {
    let mut values = BTreeMap::new();
    let mut notes = Vec::new();
    let key = job_key(&record.user_id, ctx.style_seed.map(|seed| seed.id.as_str()));

    // -- keyword categories --
    let mut prompt_features = Vec::new();
    for category in &mapping.categories {
        if record.field(&category.column).is_none() {
            notes.push(format!(
                "column '{}' missing or empty, no {} tokens",
                category.column, category.name
            ));
        }
        let tokens = category_tokens(record, category);
        prompt_features.extend(tokens.iter().take(category.prompt_tokens).cloned());
        values.insert(
            format!("{}{FEATURE_TOKENS_SUFFIX}", category.name),
            FeatureValue::Text(tokens.join(", ")),
        );
    }

    // -- prompts --
    let creature = creature_type(record, &mapping.creature);
    let positive = positive_prompt(&creature, &prompt_features, mapping, ctx.style_seed);
    let negative = mapping
        .negative_terms
        .iter()
        .take(mapping.negative_count)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    values.insert(FEATURE_CREATURE_TYPE.to_string(), FeatureValue::Text(creature));
    values.insert(FEATURE_POSITIVE_PROMPT.to_string(), FeatureValue::Text(positive));
    values.insert(FEATURE_NEGATIVE_PROMPT.to_string(), FeatureValue::Text(negative));
    values.insert(
        FEATURE_SEED.to_string(),
        FeatureValue::Integer(stable_seed(&record.user_id)),
    );
    values.insert(
        FEATURE_FILENAME_PREFIX.to_string(),
        FeatureValue::Text(format!("{}_{key}", mapping.filename_prefix)),
    );

    // -- numeric weights --
    for (key, value) in &mapping.numeric_defaults {
        values.insert(key.clone(), FeatureValue::Float(*value));
    }
    for rule in &mapping.weight_rules {
        if record
            .keywords(&rule.column)
            .iter()
            .any(|kw| kw.contains(&rule.contains))
        {
            values.insert(rule.feature.clone(), FeatureValue::Float(rule.value));
        }
    }

    // -- reference images --
    if let Some(dir) = ctx.user_images_dir {
        match find_user_image(dir, &record.user_id) {
            Some(path) => {
                values.insert(FEATURE_CONTROL_IMAGE.to_string(), FeatureValue::Path(path));
            }
            None => notes.push(format!(
                "no reference image P{}.* in {}, {FEATURE_CONTROL_IMAGE} uses template default",
                record.user_id,
                dir.display()
            )),
        }
    }

    if let Some(seed) = ctx.style_seed {
        insert_style_images(&mut values, &mut notes, seed, mapping.style_image_slots);
    }

    FeatureSet {
        user_id: record.user_id.clone(),
        style_seed: ctx.style_seed.map(|seed| seed.id.clone()),
        key,
        values,
        notes,
    }
}

/// Batch key for one user and optional style seed.
pub fn job_key(user_id: &str, style_seed: Option<&str>) -> String {
    match style_seed {
        Some(seed_id) => format!("{user_id}_{seed_id}"),
        None => user_id.to_string(),
    }
}

/// Split a `/`-separated preference cell into trimmed keywords.
pub fn split_keywords(raw: &str) -> Vec<String> {
    raw.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn category_tokens(record: &UserRecord, category: &KeywordCategory) -> Vec<String> {
    let keywords = record.keywords(&category.column);
    let mut tokens = Vec::new();

    for keyword in &keywords {
        for (key, mapped) in &category.keywords {
            if keyword.contains(key.as_str()) {
                tokens.extend(mapped.iter().cloned());
            }
        }
    }

    if tokens.is_empty() && category.fallback_to_raw {
        tokens = keywords;
    }

    dedup_preserving_order(tokens)
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn creature_type(record: &UserRecord, rules: &CreatureRules) -> String {
    let first = rules
        .column
        .as_deref()
        .and_then(|column| record.keywords(column).into_iter().next());

    let Some(keyword) = first else {
        return rules.default.clone();
    };

    let lowered = keyword.to_lowercase();
    rules
        .rules
        .iter()
        .find(|rule| lowered.contains(&rule.contains.to_lowercase()))
        .map(|rule| rule.creature.clone())
        .unwrap_or_else(|| format!("{lowered} creature"))
}

fn positive_prompt(
    creature: &str,
    features: &[String],
    mapping: &KeywordMapping,
    style_seed: Option<&StyleSeed>,
) -> String {
    let mut main = format!("a {creature}");
    if !features.is_empty() {
        main.push_str(" with ");
        main.push_str(&features.join(", "));
    }

    let style = match style_seed {
        Some(seed) if !seed.keywords.is_empty() => {
            format!("in style of {}", seed.keywords.join(", "))
        }
        _ => DEFAULT_STYLE_DESCRIPTION.to_string(),
    };

    let mut parts = vec![main];
    if !mapping.quality_suffix.trim().is_empty() {
        parts.push(mapping.quality_suffix.trim().to_string());
    }
    parts.push(style);
    parts.join(", ")
}

fn find_user_image(dir: &Path, user_id: &str) -> Option<PathBuf> {
    REFERENCE_IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("P{user_id}.{ext}")))
        .find(|path| path.is_file())
}

fn insert_style_images(
    values: &mut BTreeMap<String, FeatureValue>,
    notes: &mut Vec<String>,
    seed: &StyleSeed,
    slots: usize,
) {
    if seed.images.is_empty() {
        notes.push(format!(
            "style seed '{}' has no images, style image slots use template defaults",
            seed.id
        ));
        return;
    }

    // Fewer images than slots: cycle through them.
    for slot in 0..slots {
        let path = &seed.images[slot % seed.images.len()];
        let key = format!("{FEATURE_STYLE_IMAGE_PREFIX}{}", slot + 1);
        if path.is_file() {
            values.insert(key, FeatureValue::Path(path.clone()));
        } else {
            notes.push(format!(
                "style image {} missing, {key} uses template default",
                path.display()
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
