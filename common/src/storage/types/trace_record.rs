use crate::stored_object;
use uuid::Uuid;

stored_object!(TraceRecord, "trace", {
    thoughts: String,
    plan: String,
    evidence: String,
    #[serde(rename = "final")]
    final_answer: String,
    critique: String,
    decision: String,
    meta: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    req_id: Option<String>,
    agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    session_id: Option<String>
});

impl TraceRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_type: String,
        req_id: Option<String>,
        session_id: Option<String>,
        thoughts: String,
        plan: String,
        evidence: String,
        final_answer: String,
        critique: String,
        decision: String,
        meta: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            thoughts,
            plan,
            evidence,
            final_answer,
            critique,
            decision,
            meta,
            req_id,
            agent_type,
            session_id,
        }
    }

    /// The only trace text allowed to leave the orchestrator toward clients:
    /// the final answer, else the decision, never thoughts or critique.
    pub fn ui_payload(&self) -> &str {
        if !self.final_answer.trim().is_empty() {
            &self.final_answer
        } else if !self.decision.trim().is_empty() {
            &self.decision
        } else {
            ""
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_payload_never_exposes_thoughts_or_critique() {
        let trace = TraceRecord::new(
            "solver".into(),
            Some("REQ-001".into()),
            None,
            "private reasoning".into(),
            String::new(),
            "some evidence".into(),
            "REQ-001 done".into(),
            "too short".into(),
            "PASS".into(),
            serde_json::json!({}),
        );

        let ui = trace.ui_payload();
        assert_eq!(ui, "REQ-001 done");
        assert!(!ui.contains("private reasoning"));
        assert!(!ui.contains("too short"));
    }

    #[test]
    fn ui_payload_falls_back_to_decision() {
        let trace = TraceRecord::new(
            "verifier".into(),
            None,
            None,
            "thinking".into(),
            String::new(),
            String::new(),
            String::new(),
            "weak evidence".into(),
            "PASS - acceptable".into(),
            serde_json::json!({}),
        );
        assert_eq!(trace.ui_payload(), "PASS - acceptable");
    }
}
