use std::sync::Arc;

use serde::Deserialize;

use mailgraph_core::entity::{EmailDocument, Properties};
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::llm::LanguageModelClient;

/// Bodies beyond this many characters are cut before prompting.
const MAX_BODY_CHARS: usize = 12_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub type_category: String,
    pub properties: Properties,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    pub properties: Properties,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentExtraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelation>,
}

// ── Intermediate JSON schema for LLM output parsing ────────────────────────

#[derive(Debug, Deserialize)]
struct LlmExtractionOutput {
    #[serde(default)]
    entities: Vec<LlmEntity>,
    #[serde(default)]
    relationships: Vec<LlmRelationship>,
}

#[derive(Debug, Deserialize)]
struct LlmEntity {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    properties: serde_json::Value,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct LlmRelationship {
    source: String,
    target: String,
    #[serde(rename = "type")]
    relation_type: String,
    #[serde(default)]
    properties: serde_json::Value,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

fn into_properties(value: serde_json::Value) -> Properties {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Properties::new(),
    }
}

/// Maps the model's free-form type label onto the open type vocabulary. Common
/// synonyms collapse onto one category; anything else is kept as snake_case.
pub fn normalize_type_category(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace([' ', '-'], "_");
    match lowered.as_str() {
        "person" | "people" | "individual" => "person".to_string(),
        "organization" | "organisation" | "org" | "company" => "organization".to_string(),
        "location" | "place" | "city" | "country" => "location".to_string(),
        "concept" | "topic" | "idea" => "concept".to_string(),
        _ => lowered,
    }
}

/// Relationship verbs become `UPPER_SNAKE_CASE` with anything outside
/// `[A-Z0-9_]` dropped. Returns `None` when nothing usable remains.
pub fn normalize_edge_type(raw: &str) -> Option<String> {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_uppercase() })
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
        .collect();
    let normalized = normalized.trim_matches('_').to_string();
    (!normalized.is_empty()).then_some(normalized)
}

/// Entity and relationship extraction from an email body through the
/// language model.
#[derive(Clone)]
pub struct ContentExtractor {
    llm: Arc<dyn LanguageModelClient>,
}

impl ContentExtractor {
    pub fn new(llm: Arc<dyn LanguageModelClient>) -> Self {
        Self { llm }
    }

    fn build_system_prompt() -> &'static str {
        r#"You are an entity and relationship extraction system for a corporate email archive.

Given one email, extract the notable entities it mentions and the relationships between them.

Return ONLY valid JSON (no markdown fences, no commentary) matching this exact schema:

{
  "entities": [
    {
      "name": "Entity Name",
      "type": "person | organization | location | project | concept | event | product | ...",
      "properties": { "email": "only for people, when the address is known" },
      "confidence": 0.0 to 1.0
    }
  ],
  "relationships": [
    {
      "source": "Source Entity Name",
      "target": "Target Entity Name",
      "type": "works_for | reports_to | located_in | part_of | discusses | ...",
      "properties": {},
      "confidence": 0.0 to 1.0
    }
  ]
}

Rules:
- Entity names in relationships MUST exactly match an entity in the entities list.
- Do not extract the sender or recipients unless the body itself says something about them.
- Only extract entities and relationships that are clearly supported by the text.
- If nothing can be extracted, return {"entities": [], "relationships": []}.
- Output ONLY the JSON object. No additional text."#
    }

    fn build_user_prompt(document: &EmailDocument) -> String {
        let body: String = document.body.chars().take(MAX_BODY_CHARS).collect();
        let mut prompt = String::new();
        prompt.push_str(&format!("From: {}\n", document.from));
        if !document.to.is_empty() {
            prompt.push_str(&format!("To: {}\n", document.to.join(", ")));
        }
        prompt.push_str(&format!("Subject: {}\n", document.subject));
        prompt.push_str(&format!("Date: {}\n", document.timestamp.to_rfc2822()));
        prompt.push_str(&format!("\nBody:\n{}", body));
        prompt
    }

    pub async fn extract(&self, document: &EmailDocument) -> Result<ContentExtraction> {
        tracing::debug!(
            message_id = %document.message_id,
            body_len = document.body.len(),
            "Starting content extraction"
        );

        let raw = self
            .llm
            .complete(Self::build_system_prompt(), &Self::build_user_prompt(document))
            .await?;
        let extraction = Self::parse_response(&raw)?;

        tracing::debug!(
            message_id = %document.message_id,
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            "Content extraction complete"
        );

        Ok(extraction)
    }

    pub fn parse_response(raw_json: &str) -> Result<ContentExtraction> {
        // Strip markdown fences the model sometimes adds despite instructions
        let cleaned = raw_json.trim();
        let cleaned = if cleaned.starts_with("```") {
            let start = cleaned.find('{').unwrap_or(0);
            let end = cleaned.rfind('}').map(|i| i + 1).unwrap_or(cleaned.len());
            &cleaned[start..end.max(start)]
        } else {
            cleaned
        };

        let output: LlmExtractionOutput = serde_json::from_str(cleaned).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse extraction JSON");
            MailgraphError::Extraction(format!("Failed to parse LLM JSON output: {e}"))
        })?;

        let entities = output
            .entities
            .into_iter()
            .filter(|e| !e.name.trim().is_empty())
            .map(|e| ExtractedEntity {
                name: e.name.trim().to_string(),
                type_category: normalize_type_category(&e.entity_type),
                properties: into_properties(e.properties),
                confidence: e.confidence.clamp(0.0, 1.0),
            })
            .collect();

        let mut relationships = Vec::with_capacity(output.relationships.len());
        for rel in output.relationships {
            let Some(relation_type) = normalize_edge_type(&rel.relation_type) else {
                tracing::warn!(relation_type = %rel.relation_type, "Skipping relationship with unusable type");
                continue;
            };
            relationships.push(ExtractedRelation {
                source: rel.source.trim().to_string(),
                target: rel.target.trim().to_string(),
                relation_type,
                properties: into_properties(rel.properties),
                confidence: rel.confidence.clamp(0.0, 1.0),
            });
        }

        Ok(ContentExtraction {
            entities,
            relationships,
        })
    }
}
