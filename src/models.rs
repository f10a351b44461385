/// Data for the /v1/models endpoint.
/// This endpoint mimics the openai API's models endpoint. Each 'model' is a name served by at
/// least one registered backend.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const OWNED_BY: &str = "borg";

/// Requests to the /v1/{*} endpoints get forwarded onto OpenAI compatible backends.
/// The backend is chosen based on the model specified in the request body.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ExtractedModel<'a> {
    #[serde(borrow)]
    pub(crate) model: &'a str,
}

/// The returned models from the /v1/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Model {
    /// The model identifier, which can be referenced in the API endpoints.
    pub id: String,
    /// The Unix timestamp (in seconds) when the model was created.
    pub created: Option<u32>,
    /// The object type, which is always "model".
    pub object: String,
    /// The organization that owns the model.
    pub owned_by: String,
}

impl Model {
    pub fn named(id: &str) -> Self {
        Model {
            id: id.to_owned(),
            created: None,
            object: "model".into(),
            owned_by: OWNED_BY.into(),
        }
    }
}

/// The response from the /v1/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    /// A list of model objects.
    pub data: Vec<Model>,
}

impl ListModelResponse {
    /// One entry per distinct model name, in name order.
    pub fn from_names(names: &BTreeSet<String>) -> Self {
        ListModelResponse {
            object: "list".into(),
            data: names.iter().map(|name| Model::named(name)).collect(),
        }
    }
}
