//! FHIR `CodeSystem` catalogs built from either vocabulary.

use serde::Serialize;

use crate::error::Result;
use crate::icd::IcdClient;
use crate::index::namaste::NamasteIndex;

pub const DEFAULT_SIZE: usize = 5000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSystem {
    pub resource_type: &'static str,
    pub id: &'static str,
    pub url: String,
    pub version: &'static str,
    pub name: &'static str,
    pub status: &'static str,
    pub content: &'static str,
    pub concept: Vec<Concept>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Concept {
    pub code: String,
    pub display: String,
    pub definition: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub property: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub code: &'static str,
    pub value_string: String,
}

impl CodeSystem {
    fn new(id: &'static str, name: &'static str, url: &str, concept: Vec<Concept>) -> Self {
        Self {
            resource_type: "CodeSystem",
            id,
            url: url.to_string(),
            version: "1.0",
            name,
            status: "active",
            content: "complete",
            concept,
        }
    }
}

/// Up to `size` NAMASTE records in corpus order, each tagged with its category.
pub async fn namaste_code_system(
    index: &NamasteIndex,
    size: usize,
    url: &str,
) -> Result<CodeSystem> {
    let hits = index.list(size).await?;
    let concept = hits
        .into_iter()
        .map(|hit| Concept {
            property: vec![Property {
                code: "type",
                value_string: hit.category.to_string(),
            }],
            code: hit.code,
            display: hit.display_name,
            definition: hit.description,
        })
        .collect();
    Ok(CodeSystem::new("NAMASTE", "NAMASTE Codes", url, concept))
}

pub async fn icd_code_system(icd: &IcdClient, size: usize, url: &str) -> Result<CodeSystem> {
    let matches = icd.list(size).await?;
    let concept = matches
        .into_iter()
        .map(|m| Concept {
            code: m.id,
            display: m.name,
            definition: m.desc,
            property: Vec::new(),
        })
        .collect();
    Ok(CodeSystem::new("ICD11", "ICD-11 MMS Codes", url, concept))
}
