pub mod content;
pub mod email;
pub mod llm;
pub mod pipeline;
pub mod relationships;
pub mod resolver;

pub use content::{ContentExtraction, ContentExtractor, ExtractedEntity, ExtractedRelation};
pub use email::{parse_mailbox, parse_raw_email, split_address_list, Mailbox};
pub use llm::AnthropicClient;
pub use pipeline::ExtractionPipeline;
pub use relationships::RelationshipSynthesizer;
pub use resolver::{
    canonical_key, EntityCandidate, EntityConstructor, EntityResolver, OrganizationConstructor,
    Resolution, TypeRegistry,
};
