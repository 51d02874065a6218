//! Reference data models and recognizer predicates.
//!
//! Recognizers are pure functions of a schema's field set. Two strategies,
//! both expressed through [`Schema::contains`]:
//! - canonical: the schema contains the full reference schema
//! - presence-only: the schema declares the listed field names, with any
//!   type and any required flag

use serde_json::{json, Value};

use crate::schema::{Field, FieldType, Schema};

/// Chat message roles.
pub const CHAT_ROLES: [&str; 3] = ["system", "user", "assistant"];

pub const PREDICTION_LABEL: &str = "Prediction";
pub const INSTRUCTIONS_LABEL: &str = "Instructions";

fn any_map(name: &str, description: &str) -> Field {
    Field::required(name, FieldType::map(FieldType::Any)).with_description(description)
}

fn embedding_field() -> Field {
    Field::required("embedding", FieldType::list(FieldType::Number))
        .with_description("The embedding vector")
}

fn entity_label() -> Field {
    Field::required("label", FieldType::String).with_description("The entity label")
}

fn reward_field(description: &str) -> Field {
    Field::optional("reward", FieldType::optional(FieldType::Number))
        .with_default(Value::Null)
        .with_description(description)
}

fn search_label(name: &str, description: &str) -> Field {
    Field::required(name, FieldType::String).with_description(description)
}

pub fn generic_inputs() -> Schema {
    Schema::from_unique("GenericInputs", vec![any_map("inputs", "The inputs")])
}

pub fn generic_outputs() -> Schema {
    Schema::from_unique("GenericOutputs", vec![any_map("outputs", "The outputs")])
}

pub fn generic_io() -> Schema {
    Schema::from_unique(
        "GenericIO",
        vec![
            any_map("inputs", "The inputs"),
            any_map("outputs", "The outputs"),
        ],
    )
}

pub fn generic_result() -> Schema {
    Schema::from_unique(
        "GenericResult",
        vec![Field::required("result", FieldType::list(FieldType::Any))
            .with_description("The result")],
    )
}

pub fn chat_message() -> Schema {
    Schema::from_unique(
        "ChatMessage",
        vec![
            Field::required("role", FieldType::string_enum(CHAT_ROLES)),
            Field::required("content", FieldType::String),
        ],
    )
}

pub fn chat_messages() -> Schema {
    Schema::from_unique(
        "ChatMessages",
        vec![
            Field::required("messages", FieldType::list(FieldType::Object(chat_message())))
                .with_description("The list of chat messages"),
        ],
    )
}

pub fn embedding() -> Schema {
    Schema::from_unique("Embedding", vec![embedding_field()])
}

pub fn embeddings() -> Schema {
    Schema::from_unique(
        "Embeddings",
        vec![Field::required(
            "embeddings",
            FieldType::list(FieldType::list(FieldType::Number)),
        )
        .with_description("The list of embedding vectors")],
    )
}

pub fn entity() -> Schema {
    Schema::from_unique("Entity", vec![entity_label()])
}

pub fn embedded_entity() -> Schema {
    Schema::from_unique("EmbeddedEntity", vec![entity_label(), embedding_field()])
}

pub fn relation() -> Schema {
    Schema::from_unique(
        "Relation",
        vec![
            Field::required("subj", FieldType::Object(entity()))
                .with_description("The subject entity"),
            Field::required("label", FieldType::String).with_description("The relation label"),
            Field::required("obj", FieldType::Object(entity()))
                .with_description("The object entity"),
        ],
    )
}

pub fn entities() -> Schema {
    Schema::from_unique(
        "Entities",
        vec![
            Field::required("entities", FieldType::list(FieldType::Object(entity())))
                .with_description("The list of entities"),
        ],
    )
}

pub fn relations() -> Schema {
    Schema::from_unique(
        "Relations",
        vec![
            Field::required("relations", FieldType::list(FieldType::Object(relation())))
                .with_description("The list of relations"),
        ],
    )
}

pub fn knowledge_graph() -> Schema {
    Schema::from_unique(
        "KnowledgeGraph",
        vec![
            Field::required("entities", FieldType::list(FieldType::Object(entity())))
                .with_description("The list of entities"),
            Field::required("relations", FieldType::list(FieldType::Object(relation())))
                .with_description("The list of relations"),
        ],
    )
}

pub fn prediction() -> Schema {
    Schema::from_unique(
        "Prediction",
        vec![
            Field::optional("label", FieldType::String).with_default(json!(PREDICTION_LABEL)),
            any_map("inputs", "The inputs"),
            any_map("outputs", "The outputs"),
            reward_field("The prediction's reward"),
        ],
    )
}

pub fn instructions() -> Schema {
    Schema::from_unique(
        "Instructions",
        vec![
            Field::optional("label", FieldType::String).with_default(json!(INSTRUCTIONS_LABEL)),
            Field::required("instructions", FieldType::list(FieldType::String))
                .with_description("The list of instructions"),
            reward_field("The instruction's reward"),
        ],
    )
}

pub fn similarity_search() -> Schema {
    Schema::from_unique(
        "SimilaritySearch",
        vec![
            search_label(
                "entity_label",
                "The label of the entity to look for (use `*` to match them all)",
            ),
            search_label(
                "similarity_search",
                "The natural language similarity query to match specific entities",
            ),
        ],
    )
}

pub fn triplet_search() -> Schema {
    Schema::from_unique(
        "TripletSearch",
        vec![
            search_label(
                "subject_label",
                "The label of the subject entity (use `*` to match them all)",
            ),
            search_label(
                "subject_similarity_search",
                "The natural language similarity query to match specific subject entities",
            ),
            search_label("relation_label", "The label of the relation to search for"),
            search_label(
                "object_label",
                "The label of the object entity (use `*` to match them all)",
            ),
            search_label(
                "object_similarity_search",
                "The natural language similarity query to match specific object entities",
            ),
        ],
    )
}

/// Schema declaring `names` with `any` type and no required flag.
fn presence(names: &[&str]) -> Schema {
    Schema::from_unique(
        "Presence",
        names
            .iter()
            .map(|name| Field::optional(*name, FieldType::Any))
            .collect(),
    )
}

pub fn is_chat_message(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&chat_message())
}

pub fn is_chat_messages(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&chat_messages())
}

pub fn is_embedding(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&embedding())
}

pub fn is_embeddings(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&embeddings())
}

pub fn is_prediction(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&prediction())
}

pub fn is_instructions(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&instructions())
}

pub fn is_entity(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&["label"]))
}

pub fn is_embedded_entity(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&["label", "embedding"]))
}

pub fn is_relation(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&["subj", "label", "obj"]))
}

pub fn is_entities(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&["entities"]))
}

pub fn is_relations(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&["relations"]))
}

pub fn is_knowledge_graph(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&["entities", "relations"]))
}

pub fn is_similarity_search(x: impl AsRef<Schema>) -> bool {
    x.as_ref()
        .contains(&presence(&["entity_label", "similarity_search"]))
}

pub fn is_triplet_search(x: impl AsRef<Schema>) -> bool {
    x.as_ref().contains(&presence(&[
        "subject_label",
        "subject_similarity_search",
        "relation_label",
        "object_label",
        "object_similarity_search",
    ]))
}
