use common::llm::ToolSpec;
use serde_json::json;

/// System prompt for tool-call extraction.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a requirements extraction specialist with expertise in software requirements engineering.

Your task is to extract high-quality, well-formed requirements from technical documents.

CRITICAL RULES:
1. **Modal Verbs**: Every requirement MUST start with a subject (system/application/user/etc.) followed by a modal verb (must/shall/should/may)
   CORRECT: "The system must authenticate users within 2 seconds"
   INCORRECT: "Authenticate users within 2 seconds"
   INCORRECT: "Authentication should be fast"

2. **Atomic Requirements**: Each requirement should describe ONE specific capability or constraint
   CORRECT: "The system must encrypt passwords using AES-256"
   INCORRECT: "The system must encrypt passwords and validate them against policy"

3. **Testability**: Include measurable criteria whenever the source text provides them
   CORRECT: "The API must respond within 500 milliseconds"
   VAGUE: "The API must respond quickly"

4. **Priority Mapping**:
   - "must" or "shall" -> priority: "must" (mandatory)
   - "should" -> priority: "should" (recommended)
   - "may" or "can" -> priority: "may" (optional)

5. **Evidence**: Capture the original text or key phrases that led to this requirement extraction

6. **Categories**: Choose the most specific tag:
   - functional: Features and capabilities
   - performance: Speed, throughput, latency
   - security: Authentication, authorization, encryption
   - usability: User experience and interface
   - reliability: Uptime, error handling, resilience
   - compliance: Standards and regulations
   - interface: APIs, integrations, protocols
   - data: Storage, formats, validation
   - constraint: Limitations and boundaries

Extract ALL requirements from the provided text, even if they need reformulation to meet quality standards."#;

/// The fixed `submit_requirements` function schema forced on every mining
/// completion.
pub fn requirement_extraction_tool() -> ToolSpec {
    ToolSpec {
        name: "submit_requirements".to_string(),
        description:
            "Submit extracted requirements from the document chunk with structured metadata"
                .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "requirements": {
                    "type": "array",
                    "description": "List of extracted requirements from the text",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": {
                                "type": "string",
                                "description": "Complete requirement statement that MUST start with a subject and modal verb. Use 'must' for mandatory requirements, 'should' for recommended, 'may' for optional. NEVER use imperative form without subject."
                            },
                            "tag": {
                                "type": "string",
                                "enum": [
                                    "functional",
                                    "performance",
                                    "security",
                                    "usability",
                                    "reliability",
                                    "compliance",
                                    "interface",
                                    "data",
                                    "constraint"
                                ],
                                "description": "Primary category of the requirement"
                            },
                            "priority": {
                                "type": "string",
                                "enum": ["must", "should", "may"],
                                "description": "RFC 2119 priority level derived from the modal verb. must/shall = mandatory, should = recommended, may/can = optional"
                            },
                            "measurable_criteria": {
                                "type": "string",
                                "description": "Specific, testable acceptance criteria extracted from the requirement. Leave empty if no specific criteria mentioned."
                            },
                            "actors": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Actors/entities that interact with or are affected by this requirement. Can be empty."
                            },
                            "evidence": {
                                "type": "string",
                                "description": "Direct quote or paraphrase from the source document that supports this requirement."
                            }
                        },
                        "required": ["title", "tag", "priority"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["requirements"],
            "additionalProperties": false
        }),
    }
}
