//! Static persona catalog
//!
//! Personas live in a JSON catalog with stable codes. A default catalog is
//! embedded in the binary; deployments can point at their own file. Every
//! selected code is validated against the catalog before use.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::types::{CatalogError, Persona, PersonaCode};

const DEFAULT_CATALOG_JSON: &str = include_str!("../../personas.json");

#[derive(Deserialize)]
struct CatalogFile {
    personas: Vec<Persona>,
}

/// Immutable persona catalog indexed by code.
#[derive(Debug, Clone)]
pub struct PersonaCatalog {
    by_code: HashMap<PersonaCode, Persona>,
    order: Vec<PersonaCode>,
}

impl PersonaCatalog {
    /// The catalog embedded in the binary.
    pub fn builtin() -> Self {
        // The embedded catalog is validated by tests; a parse failure here
        // is a build defect, not a runtime condition.
        Self::from_json(DEFAULT_CATALOG_JSON).expect("embedded persona catalog is valid")
    }

    /// Parse a catalog from JSON, rejecting duplicate codes.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;

        let mut by_code = HashMap::new();
        let mut order = Vec::with_capacity(file.personas.len());
        for persona in file.personas {
            let code = persona.code.clone();
            if by_code.insert(code.clone(), persona).is_some() {
                return Err(CatalogError::DuplicateCode(code.0));
            }
            order.push(code);
        }
        Ok(Self { by_code, order })
    }

    /// Load a catalog from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|_| CatalogError::FileNotFound(path.display().to_string()))?;
        Self::from_json(&json)
    }

    /// Look up a persona, or fail with the unknown code.
    pub fn get(&self, code: &PersonaCode) -> Result<&Persona, CatalogError> {
        self.by_code
            .get(code)
            .ok_or_else(|| CatalogError::UnknownCode(code.0.clone()))
    }

    pub fn contains(&self, code: &PersonaCode) -> bool {
        self.by_code.contains_key(code)
    }

    /// All personas in catalog order.
    pub fn all(&self) -> impl Iterator<Item = &Persona> {
        self.order.iter().filter_map(|code| self.by_code.get(code))
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Validate a set of codes, returning the resolved personas or the
    /// first unknown code.
    pub fn resolve(&self, codes: &[PersonaCode]) -> Result<Vec<Persona>, CatalogError> {
        codes
            .iter()
            .map(|code| self.get(code).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = PersonaCatalog::builtin();
        assert!(catalog.len() >= 12);
    }

    #[test]
    fn test_builtin_has_expected_codes() {
        let catalog = PersonaCatalog::builtin();
        for code in ["growth_strategist", "financial_analyst", "user_advocate"] {
            assert!(
                catalog.contains(&PersonaCode::from(code)),
                "missing {}",
                code
            );
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        let catalog = PersonaCatalog::builtin();
        let err = catalog.get(&PersonaCode::from("nonexistent")).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownCode(_)));
    }

    #[test]
    fn test_duplicate_codes_rejected() {
        let json = r#"{"personas": [
            {"code": "dup", "name": "A", "role": "r", "expertise_domain": "d",
             "perspective": "strategic", "risk_tolerance": "moderate",
             "time_horizon": "short_term", "outlook": "pragmatic",
             "system_role_text": "s"},
            {"code": "dup", "name": "B", "role": "r", "expertise_domain": "d",
             "perspective": "tactical", "risk_tolerance": "averse",
             "time_horizon": "long_term", "outlook": "cautious",
             "system_role_text": "s"}
        ]}"#;
        let err = PersonaCatalog::from_json(json).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateCode(_)));
    }

    #[test]
    fn test_resolve_validates_every_code() {
        let catalog = PersonaCatalog::builtin();
        let ok = catalog.resolve(&[
            PersonaCode::from("growth_strategist"),
            PersonaCode::from("financial_analyst"),
        ]);
        assert_eq!(ok.unwrap().len(), 2);

        let err = catalog.resolve(&[
            PersonaCode::from("growth_strategist"),
            PersonaCode::from("ghost"),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = PersonaCatalog::from_file("/nonexistent/personas.json").unwrap_err();
        assert!(matches!(err, CatalogError::FileNotFound(_)));
    }

    #[test]
    fn test_builtin_styles_are_diverse() {
        let catalog = PersonaCatalog::builtin();
        let styles: std::collections::HashSet<_> =
            catalog.all().map(|p| p.style()).collect();
        // Enough distinct style fingerprints for the selector to work with.
        assert!(styles.len() >= 6);
    }
}
