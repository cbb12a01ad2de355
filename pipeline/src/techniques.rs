//! Static catalog of therapeutic techniques.
//!
//! The topic extractor tags each session with a dominant technique id; this
//! library turns known ids into display names and short clinical
//! definitions. Lookup is pure and synchronous. The catalog lives for the
//! process lifetime and can be swapped wholesale from a TOML file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technique {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    techniques: HashMap<String, Technique>,
}

/// Read-mostly technique catalog.
#[derive(Debug)]
pub struct TechniqueLibrary {
    catalog: RwLock<HashMap<String, Technique>>,
}

impl TechniqueLibrary {
    /// The built-in catalog shipped with the binary.
    pub fn builtin() -> Self {
        let mut catalog = HashMap::new();
        let mut add = |id: &str, name: &str, definition: &str| {
            catalog.insert(
                id.to_string(),
                Technique {
                    name: name.to_string(),
                    definition: definition.to_string(),
                },
            );
        };

        add(
            "cbt_cognitive_restructuring",
            "Cognitive Restructuring (CBT)",
            "Identifying distorted automatic thoughts and testing them against evidence. \
             The patient learns to generate balanced alternative thoughts, weakening the \
             link between the distortion and the emotional response.",
        );
        add(
            "cbt_behavioral_activation",
            "Behavioral Activation",
            "Scheduling rewarding activities to counteract withdrawal and low mood. \
             Action precedes motivation; re-engagement with valued activities lifts mood \
             and disconfirms hopeless predictions.",
        );
        add(
            "dbt_distress_tolerance",
            "Distress Tolerance (DBT)",
            "Skills for surviving emotional crises without making them worse, such as \
             TIPP, self-soothing, and radical acceptance. Used when the problem cannot \
             be solved in the moment.",
        );
        add(
            "dbt_emotion_regulation",
            "Emotion Regulation (DBT)",
            "Identifying, labeling, and changing emotional responses through opposite \
             action, checking the facts, and reducing vulnerability factors. Builds the \
             patient's sense of control over affect.",
        );
        add(
            "act_defusion",
            "Cognitive Defusion (ACT)",
            "Creating distance from thoughts by observing them as mental events rather \
             than literal truths. Reduces the behavioral grip of difficult thoughts \
             without disputing their content.",
        );
        add(
            "act_values_clarification",
            "Values Clarification (ACT)",
            "Articulating what matters to the patient across life domains and using \
             those values to guide committed action, especially where avoidance has \
             narrowed life.",
        );
        add(
            "mi_motivational_interviewing",
            "Motivational Interviewing",
            "Collaborative, non-confrontational exploration of ambivalence about \
             change. The therapist elicits and reinforces the patient's own change \
             talk rather than arguing for change.",
        );
        add(
            "mindfulness_grounding",
            "Mindfulness and Grounding",
            "Present-moment attention practices, such as breath focus and five-senses \
             grounding, used to interrupt rumination and reduce physiological arousal.",
        );
        add(
            "psychodynamic_exploration",
            "Psychodynamic Exploration",
            "Exploring how early relational patterns repeat in present relationships \
             and in the therapy itself. Insight into these patterns loosens their \
             hold on current behavior.",
        );
        add(
            "exposure_hierarchy",
            "Graded Exposure",
            "Systematic, repeated contact with feared situations ordered from easiest \
             to hardest. Fear declines through habituation and expectancy violation \
             while avoidance behaviors are withdrawn.",
        );

        Self {
            catalog: RwLock::new(catalog),
        }
    }

    /// Parse a catalog from TOML:
    ///
    /// ```toml
    /// [techniques.cbt_cognitive_restructuring]
    /// name = "Cognitive Restructuring (CBT)"
    /// definition = "..."
    /// ```
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = toml::from_str(input)?;
        Ok(Self {
            catalog: RwLock::new(file.techniques),
        })
    }

    /// Replace the whole catalog from a TOML file.
    pub fn reload_from_path(&self, path: &Path) -> anyhow::Result<usize> {
        let input = std::fs::read_to_string(path)?;
        let file: CatalogFile = toml::from_str(&input)?;
        let count = file.techniques.len();
        let mut guard = self
            .catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = file.techniques;
        tracing::info!(count, path = %path.display(), "technique catalog reloaded");
        Ok(count)
    }

    /// Constant-time lookup. Unknown ids return `None`; the caller surfaces
    /// the id as free text with no definition.
    pub fn lookup(&self, technique_id: &str) -> Option<Technique> {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(technique_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Known ids, for prompt construction.
    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_core_techniques() {
        let lib = TechniqueLibrary::builtin();
        assert!(lib.len() >= 8);
        let cbt = lib.lookup("cbt_cognitive_restructuring").unwrap();
        assert!(cbt.name.contains("CBT"));
        assert!(!cbt.definition.is_empty());
    }

    #[test]
    fn unknown_id_returns_none() {
        let lib = TechniqueLibrary::builtin();
        assert!(lib.lookup("interpretive_dance_therapy").is_none());
    }

    #[test]
    fn toml_catalog_round_trip() {
        let toml_input = r#"
            [techniques.test_technique]
            name = "Test Technique"
            definition = "A technique used in tests."
        "#;
        let lib = TechniqueLibrary::from_toml_str(toml_input).unwrap();
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.lookup("test_technique").unwrap().name, "Test Technique");
    }

    #[test]
    fn reload_replaces_catalog() {
        let lib = TechniqueLibrary::builtin();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("techniques.toml");
        std::fs::write(
            &path,
            r#"
            [techniques.only_one]
            name = "Only One"
            definition = "The only remaining technique."
            "#,
        )
        .unwrap();

        let count = lib.reload_from_path(&path).unwrap();
        assert_eq!(count, 1);
        assert!(lib.lookup("cbt_cognitive_restructuring").is_none());
        assert!(lib.lookup("only_one").is_some());
    }

    #[test]
    fn known_ids_are_sorted() {
        let lib = TechniqueLibrary::builtin();
        let ids = lib.known_ids();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
