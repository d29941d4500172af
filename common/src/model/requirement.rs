use serde::{Deserialize, Serialize};

use super::chunk::EvidenceRef;

/// Domain category of a requirement. Unknown values remap to `Functional`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequirementTag {
    Functional,
    Security,
    Performance,
    Ux,
    Ops,
    Usability,
    Reliability,
    Compliance,
    Interface,
    Data,
    Constraint,
}

impl RequirementTag {
    pub fn as_str(self) -> &'static str {
        match self {
            RequirementTag::Functional => "functional",
            RequirementTag::Security => "security",
            RequirementTag::Performance => "performance",
            RequirementTag::Ux => "ux",
            RequirementTag::Ops => "ops",
            RequirementTag::Usability => "usability",
            RequirementTag::Reliability => "reliability",
            RequirementTag::Compliance => "compliance",
            RequirementTag::Interface => "interface",
            RequirementTag::Data => "data",
            RequirementTag::Constraint => "constraint",
        }
    }

    /// Lenient parse; anything outside the canonical set becomes `Functional`.
    pub fn from_loose(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "security" => RequirementTag::Security,
            "performance" => RequirementTag::Performance,
            "ux" => RequirementTag::Ux,
            "ops" => RequirementTag::Ops,
            "usability" => RequirementTag::Usability,
            "reliability" => RequirementTag::Reliability,
            "compliance" => RequirementTag::Compliance,
            "interface" => RequirementTag::Interface,
            "data" => RequirementTag::Data,
            "constraint" => RequirementTag::Constraint,
            _ => RequirementTag::Functional,
        }
    }
}

/// RFC 2119 style priority derived from the modal verb.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequirementPriority {
    Must,
    Should,
    May,
}

impl RequirementPriority {
    pub fn from_loose(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "must" | "shall" => Some(RequirementPriority::Must),
            "should" => Some(RequirementPriority::Should),
            "may" | "can" => Some(RequirementPriority::May),
            _ => None,
        }
    }
}

/// Atomic requirement statement mined from a document chunk.
/// Identity is `req_id`; provenance lives in `evidence_refs` (always >= 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub req_id: String,
    pub title: String,
    pub tag: RequirementTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<RequirementPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurable_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actors: Vec<String>,
    pub evidence_refs: Vec<EvidenceRef>,
    /// Verbatim supporting quote captured by the extraction tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl Requirement {
    /// Appends additional evidence refs, deduplicating by
    /// `(source_file, sha1, chunk_index)` while preserving order.
    pub fn merge_evidence(&mut self, additional: &[EvidenceRef]) {
        for ev in additional {
            if !self.evidence_refs.contains(ev) {
                self.evidence_refs.push(ev.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tags_remap_to_functional() {
        assert_eq!(RequirementTag::from_loose("weird"), RequirementTag::Functional);
        assert_eq!(RequirementTag::from_loose("SECURITY"), RequirementTag::Security);
    }

    #[test]
    fn merge_evidence_deduplicates() {
        let base = EvidenceRef {
            source_file: "a.txt".into(),
            sha1: "abc".into(),
            chunk_index: 0,
        };
        let neighbor = EvidenceRef {
            source_file: "a.txt".into(),
            sha1: "abc".into(),
            chunk_index: 1,
        };
        let mut req = Requirement {
            req_id: "REQ-abc123-000".into(),
            title: "The system shall work".into(),
            tag: RequirementTag::Functional,
            priority: None,
            measurable_criteria: None,
            actors: Vec::new(),
            evidence_refs: vec![base.clone()],
            evidence: None,
        };

        req.merge_evidence(&[base.clone(), neighbor.clone()]);

        assert_eq!(req.evidence_refs, vec![base, neighbor]);
    }
}
