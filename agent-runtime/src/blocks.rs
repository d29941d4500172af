use std::collections::BTreeMap;

pub const SECTION_KEYS: [&str; 7] = [
    "THOUGHTS",
    "PLAN",
    "EVIDENCE",
    "FINAL_ANSWER",
    "CRITIQUE",
    "DECISION",
    "TOOL_CALL",
];

/// Header spellings accepted per canonical key, longest first so
/// `FINAL_ANSWER` wins over `FINAL`.
const HEADER_VARIANTS: [(&str, &str); 12] = [
    ("FINAL_ANSWER", "FINAL_ANSWER"),
    ("FINAL-ANSWER", "FINAL_ANSWER"),
    ("FINAL ANSWER", "FINAL_ANSWER"),
    ("TOOL_CALL", "TOOL_CALL"),
    ("TOOL-CALL", "TOOL_CALL"),
    ("TOOL CALL", "TOOL_CALL"),
    ("THOUGHTS", "THOUGHTS"),
    ("THOUGHT", "THOUGHTS"),
    ("EVIDENCE", "EVIDENCE"),
    ("CRITIQUE", "CRITIQUE"),
    ("DECISION", "DECISION"),
    ("PLAN", "PLAN"),
];

/// Matches a section header at the start of a trimmed line: the header word,
/// optional `:` or `-`, optional inline content. Returns the canonical key
/// and the inline remainder.
fn parse_header(line: &str) -> Option<(&'static str, Option<String>)> {
    let trimmed = line.trim_start();
    for (variant, key) in HEADER_VARIANTS {
        if trimmed.len() < variant.len() {
            continue;
        }
        let Some(prefix) = trimmed.get(..variant.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(variant) {
            continue;
        }
        let rest = trimmed.get(variant.len()..).unwrap_or_default();
        // Word boundary: the header may only be followed by whitespace,
        // a separator, or the line end.
        let mut chars = rest.chars();
        match chars.next() {
            None => return Some((key, None)),
            Some(c) if c.is_whitespace() || c == ':' || c == '-' => {}
            Some(_) => continue,
        }
        let mut inline = rest.trim_start();
        if let Some(stripped) = inline.strip_prefix(':').or_else(|| inline.strip_prefix('-')) {
            inline = stripped;
        }
        let inline = inline.trim();
        if inline.is_empty() {
            return Some((key, None));
        }
        return Some((key, Some(inline.to_string())));
    }
    None
}

/// Extracts CoT blocks from free-form LLM text. Tolerant of case, `:`/`-`
/// separators and code fences. Text without any recognized header becomes a
/// single FINAL_ANSWER block.
pub fn extract_blocks(text: &str) -> BTreeMap<String, String> {
    let lines: Vec<&str> = text.lines().collect();

    let mut headers: Vec<(usize, &'static str, Option<String>)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some((key, inline)) = parse_header(line) {
            headers.push((i, key, inline));
        }
    }

    if headers.is_empty() {
        let mut blocks = BTreeMap::new();
        blocks.insert("FINAL_ANSWER".to_string(), text.trim().to_string());
        return blocks;
    }

    let mut blocks = BTreeMap::new();
    for (pos, (line_idx, key, inline)) in headers.iter().enumerate() {
        let chunk = if let Some(inline) = inline {
            strip_fences(inline)
        } else {
            let body_start = line_idx.saturating_add(1);
            let body_end = headers
                .get(pos.saturating_add(1))
                .map_or(lines.len(), |(next_idx, _, _)| *next_idx);
            let body = lines
                .get(body_start..body_end)
                .unwrap_or_default()
                .join("\n");
            strip_fences(body.trim())
        };
        blocks.insert((*key).to_string(), chunk);
    }

    // If EVIDENCE came out empty but the text carries a fenced block, unwrap
    // the first fenced body as evidence.
    let evidence_is_blank = blocks
        .get("EVIDENCE")
        .is_some_and(|e| e.trim().is_empty() || e.trim() == "```");
    if evidence_is_blank {
        if let Some(body) = first_fenced_body(text) {
            blocks.insert("EVIDENCE".to_string(), body);
        }
    }

    blocks
}

/// Unwraps a surrounding ``` fence pair, dropping an optional language token
/// after the opening fence. Text without fences passes through trimmed.
pub fn strip_fences(s: &str) -> String {
    let s = s.trim();
    let Some(first) = s.find("```") else {
        return s.to_string();
    };
    let Some(last) = s.rfind("```") else {
        return s.to_string();
    };
    if last <= first.saturating_add(3) {
        // A single fence: drop fence lines and keep the rest.
        let kept: Vec<&str> = s
            .lines()
            .filter(|line| !line.trim_start().starts_with("```"))
            .collect();
        return kept.join("\n").trim().to_string();
    }

    let tail = s
        .get(first.saturating_add(3)..last)
        .unwrap_or_default()
        .replace("\r\n", "\n");
    let body = match tail.find('\n') {
        // The first line of the fence body is a language token; drop it.
        Some(newline) => tail.get(newline.saturating_add(1)..).unwrap_or_default(),
        None => tail.as_str(),
    };
    let body = body.trim();
    if body.is_empty() {
        s.to_string()
    } else {
        body.to_string()
    }
}

fn first_fenced_body(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = text.get(start.saturating_add(3)..)?;
    let newline = after_fence.find('\n')?;
    let body_start = newline.saturating_add(1);
    let rest = after_fence.get(body_start..)?;
    let end = rest.find("```")?;
    let body = rest.get(..end)?.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// The UI-safe text for a sequence of block maps: the last non-empty
/// FINAL_ANSWER, else the last non-empty DECISION, else empty. THOUGHTS and
/// CRITIQUE never pass through here.
pub fn ui_payload(blocks_list: &[BTreeMap<String, String>]) -> String {
    for key in ["FINAL_ANSWER", "DECISION"] {
        for blocks in blocks_list.iter().rev() {
            if let Some(value) = blocks.get(key) {
                if !value.trim().is_empty() {
                    return value.trim().to_string();
                }
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_inline_sections() {
        let text = "THOUGHTS: private reasoning\nFINAL_ANSWER: REQ-001 done\nCRITIQUE: too short";
        let blocks = extract_blocks(text);
        assert_eq!(blocks.get("THOUGHTS").map(String::as_str), Some("private reasoning"));
        assert_eq!(blocks.get("FINAL_ANSWER").map(String::as_str), Some("REQ-001 done"));
        assert_eq!(blocks.get("CRITIQUE").map(String::as_str), Some("too short"));
    }

    #[test]
    fn extracts_multiline_bodies() {
        let text = "PLAN:\n- step one\n- step two\nDECISION:\nPASS because fine";
        let blocks = extract_blocks(text);
        assert_eq!(
            blocks.get("PLAN").map(String::as_str),
            Some("- step one\n- step two")
        );
        assert_eq!(blocks.get("DECISION").map(String::as_str), Some("PASS because fine"));
    }

    #[test]
    fn tolerates_case_and_separators() {
        let text = "final answer - all good\ndecision: PASS";
        let blocks = extract_blocks(text);
        assert_eq!(blocks.get("FINAL_ANSWER").map(String::as_str), Some("all good"));
        assert_eq!(blocks.get("DECISION").map(String::as_str), Some("PASS"));
    }

    #[test]
    fn unstructured_text_becomes_final_answer() {
        let blocks = extract_blocks("just some text");
        assert_eq!(blocks.get("FINAL_ANSWER").map(String::as_str), Some("just some text"));
    }

    #[test]
    fn evidence_fences_are_unwrapped() {
        let text = "EVIDENCE:\n```\ncited line one\ncited line two\n```\nFINAL_ANSWER: ok";
        let blocks = extract_blocks(text);
        assert_eq!(
            blocks.get("EVIDENCE").map(String::as_str),
            Some("cited line one\ncited line two")
        );
    }

    #[test]
    fn header_requires_word_boundary() {
        let text = "PLANETARY: not a plan header\nPLAN: real plan";
        let blocks = extract_blocks(text);
        assert_eq!(blocks.get("PLAN").map(String::as_str), Some("real plan"));
    }

    #[test]
    fn ui_payload_prefers_last_final_answer() {
        let first = extract_blocks("FINAL_ANSWER: draft");
        let second = extract_blocks("THOUGHTS: hidden\nFINAL_ANSWER: final text");
        assert_eq!(ui_payload(&[first, second]), "final text");
    }

    #[test]
    fn ui_payload_falls_back_to_decision_then_empty() {
        let only_decision = extract_blocks("CRITIQUE: weak\nDECISION: REJECT");
        assert_eq!(ui_payload(&[only_decision]), "REJECT");
        let empty: Vec<BTreeMap<String, String>> = Vec::new();
        assert_eq!(ui_payload(&empty), "");
    }

    #[test]
    fn ui_payload_never_contains_private_blocks() {
        let blocks =
            extract_blocks("THOUGHTS: private reasoning\nFINAL_ANSWER: REQ-001 done\nCRITIQUE: too short");
        let ui = ui_payload(&[blocks]);
        assert!(!ui.contains("THOUGHTS"));
        assert!(!ui.contains("private reasoning"));
        assert!(!ui.contains("CRITIQUE"));
        assert!(!ui.contains("too short"));
    }
}
