use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ClarificationQuestion, "clarification_question", {
    session_id: String,
    question: String,
    suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    answer: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    answered_at: Option<DateTime<Utc>>
});

impl ClarificationQuestion {
    /// One outstanding question per session: the record id is the session id,
    /// so asking again replaces the previous question.
    pub fn new(session_id: String, question: String, suggestions: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: session_id.clone(),
            created_at: now,
            updated_at: now,
            session_id,
            question,
            suggestions,
            answer: None,
            answered_at: None,
        }
    }

    pub async fn submit_answer(
        session_id: &str,
        answer: String,
        db: &SurrealDbClient,
    ) -> Result<ClarificationQuestion, AppError> {
        let Some(mut question) = db.get_item::<ClarificationQuestion>(session_id).await? else {
            return Err(AppError::NotFound(format!(
                "no open clarification question for session {session_id}"
            )));
        };
        question.answer = Some(answer);
        question.answered_at = Some(Utc::now());
        question.updated_at = Utc::now();
        let stored = db.upsert_item(question).await?;
        stored.ok_or_else(|| AppError::InternalError("clarification update returned nothing".into()))
    }

    pub async fn fetch_answer(
        session_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<String>, AppError> {
        let question = db.get_item::<ClarificationQuestion>(session_id).await?;
        Ok(question.and_then(|q| q.answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_ask_answer_roundtrip() {
        let db = SurrealDbClient::memory("clarify_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let question = ClarificationQuestion::new(
            "session-1".into(),
            "Which locale should actor detection use?".into(),
            vec!["english".into(), "german".into()],
        );
        db.upsert_item(question).await.expect("store question");

        assert_eq!(
            ClarificationQuestion::fetch_answer("session-1", &db)
                .await
                .expect("fetch"),
            None
        );

        ClarificationQuestion::submit_answer("session-1", "english".into(), &db)
            .await
            .expect("answer");

        assert_eq!(
            ClarificationQuestion::fetch_answer("session-1", &db)
                .await
                .expect("fetch"),
            Some("english".to_string())
        );
    }

    #[tokio::test]
    async fn test_answer_without_question_fails() {
        let db = SurrealDbClient::memory("clarify_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let result =
            ClarificationQuestion::submit_answer("missing-session", "yes".into(), &db).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
