pub mod planner;
pub mod req_worker;
pub mod solver;
pub mod verifier;

pub use planner::PlannerAgent;
pub use req_worker::ReqWorkerAgent;
pub use solver::SolverAgent;
pub use verifier::VerifierAgent;

/// Ground rules shared by all reflection agents.
pub const BASE_PROMPT_GUARD: &str = "General rules for all agents:\n\
- Keep outputs concise and structured. Prefer bullet points and fenced code blocks for Mermaid.\n\
- Requirements MUST be labeled REQ-### (e.g., REQ-001) to enable traceability.\n\
- When you mention a requirement in any diagram/section, include the REQ ID in a node label, note, or comment.\n\
- Do not invent tools or APIs; stick to widely used patterns.\n\
- Never remove existing REQ IDs; only add or refine.\n";

pub const REQUIREMENTS_POLICY: &str = "Requirements coverage policy:\n\
- Provide a normalized list of functional and non-functional REQs with unique IDs REQ-001, REQ-002, ...\n\
- Each REQ entry must include a short description and a tag in {functional|security|performance|ux|ops}.\n\
- Keep total REQs between 10 and 20 for manageable coverage.\n";
