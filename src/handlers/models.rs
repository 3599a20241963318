//! # REST API Request Models
//!
//! Request bodies for the session management endpoints. Responses are built
//! with `json!` in the handlers.

use serde::Deserialize;

/// Body of `POST /api/v1/sessions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// ISO 639-1 code of the language the speaker will talk in
    pub source_language: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_request_is_camel_case() {
        let request: CreateSessionRequest =
            serde_json::from_str(r#"{"sourceLanguage":"en"}"#).unwrap();
        assert_eq!(request.source_language, "en");
    }
}
