//! The configured label set.

use crate::config::TaxonomyConfig;
use crate::types::ScoreMap;
use crate::{Error, Result};

/// Allowed categories plus the fallback label.
#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    categories: Vec<String>,
    fallback: String,
}

impl Taxonomy {
    pub fn new(categories: Vec<String>, fallback: impl Into<String>) -> Result<Self> {
        let fallback = fallback.into();
        let mut deduped: Vec<String> = Vec::with_capacity(categories.len());
        for category in categories {
            let category = category.trim().to_string();
            if category.is_empty() {
                return Err(Error::Config("taxonomy contains an empty label".to_string()));
            }
            if !deduped.contains(&category) {
                deduped.push(category);
            }
        }
        if deduped.is_empty() {
            return Err(Error::Config("taxonomy has no categories".to_string()));
        }
        if !deduped.contains(&fallback) {
            return Err(Error::Config(format!(
                "fallback category '{}' is not in the taxonomy",
                fallback
            )));
        }
        Ok(Self {
            categories: deduped,
            fallback,
        })
    }

    pub fn from_config(config: &TaxonomyConfig) -> Result<Self> {
        Self::new(config.categories.clone(), config.fallback_category.clone())
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn contains(&self, label: &str) -> bool {
        self.categories.iter().any(|c| c == label)
    }

    /// Equal score for every category
    pub fn uniform_scores(&self) -> ScoreMap {
        let score = 1.0 / self.categories.len() as f64;
        self.categories
            .iter()
            .map(|c| (c.clone(), score))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_taxonomy_validation() {
        assert!(Taxonomy::new(labels(&["a", "b"]), "b").is_ok());
        assert!(Taxonomy::new(labels(&["a", "b"]), "c").is_err());
        assert!(Taxonomy::new(vec![], "a").is_err());
        assert!(Taxonomy::new(labels(&["a", " "]), "a").is_err());
    }

    #[test]
    fn test_uniform_scores() {
        let taxonomy = Taxonomy::new(labels(&["a", "b", "a", "c", "d"]), "d").unwrap();
        assert_eq!(taxonomy.categories().len(), 4);
        let scores = taxonomy.uniform_scores();
        assert_eq!(scores.len(), 4);
        assert!(scores.values().all(|s| (*s - 0.25).abs() < f64::EPSILON));
    }
}
