//! Document-level attribute tagging.

use std::collections::BTreeMap;
use std::path::Path;

use crate::{
    IndexConfig, ATTR_DOCUMENT_NAME, ATTR_DOCUMENT_TYPE, ATTR_EQUIPMENT_MODEL,
    ATTR_ERROR_CODE_TAG,
};

/// Classify a document by the words in its file name, falling back to the
/// extension.
pub fn document_type(name: &str) -> String {
    let lower = name.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |pred: &dyn Fn(&str) -> bool| words.iter().any(|w| pred(w));

    if has(&|w| w == "manual" || w == "manuals") {
        return "manual".to_string();
    }
    if has(&|w| w == "sop" || w.starts_with("procedure")) {
        return "sop".to_string();
    }
    if has(&|w| w.starts_with("troubleshoot")) {
        return "troubleshooting_guide".to_string();
    }
    if has(&|w| w == "spec" || w == "specs" || w.starts_with("specification")) {
        return "specification".to_string();
    }

    match Path::new(&lower).extension().and_then(|e| e.to_str()) {
        Some("md") | Some("markdown") => "markdown".to_string(),
        Some("txt") => "text".to_string(),
        _ => "document".to_string(),
    }
}

/// First configured model mentioned anywhere in the document.
pub fn equipment_model(text: &str, models: &[String]) -> Option<String> {
    let haystack = text.to_lowercase();
    models
        .iter()
        .find(|m| !m.is_empty() && haystack.contains(&m.to_lowercase()))
        .cloned()
}

/// First configured error code appearing in the chunk (substring match).
pub fn error_code_tag(chunk: &str, codes: &[String]) -> Option<String> {
    let haystack = chunk.to_uppercase();
    codes
        .iter()
        .find(|c| !c.is_empty() && haystack.contains(&c.to_uppercase()))
        .cloned()
}

/// Attributes shared by every chunk of a document.
pub fn document_attributes(name: &str, text: &str, config: &IndexConfig) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    attributes.insert(ATTR_DOCUMENT_NAME.to_string(), name.to_string());
    attributes.insert(ATTR_DOCUMENT_TYPE.to_string(), document_type(name));
    if let Some(model) = equipment_model(text, &config.equipment_models) {
        attributes.insert(ATTR_EQUIPMENT_MODEL.to_string(), model);
    }
    attributes
}

/// Document attributes plus the chunk's own error-code tag.
pub fn chunk_attributes(
    document: &BTreeMap<String, String>,
    chunk: &str,
    config: &IndexConfig,
) -> BTreeMap<String, String> {
    let mut attributes = document.clone();
    if let Some(code) = error_code_tag(chunk, &config.error_codes) {
        attributes.insert(ATTR_ERROR_CODE_TAG.to_string(), code);
    }
    attributes
}
