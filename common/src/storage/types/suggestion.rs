use crate::stored_object;
use uuid::Uuid;

stored_object!(Suggestion, "suggestion", {
    requirement_checksum: String,
    suggestion_text: String,
    model: String
});

impl Suggestion {
    pub fn new(requirement_checksum: String, suggestion_text: String, model: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            requirement_checksum,
            suggestion_text,
            model,
        }
    }
}
