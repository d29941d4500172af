use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use common::{error::AppError, utils::embedding::Embedder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const DEFAULT_THRESHOLD: f32 = 0.90;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub req_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateMember {
    pub req_id: String,
    pub title: String,
    pub similarity_to_representative: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateGroup {
    pub group_id: String,
    pub requirements: Vec<DuplicateMember>,
    pub avg_similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateStats {
    pub total_requirements: usize,
    pub unique_requirements: usize,
    pub duplicate_groups: usize,
    pub total_duplicates: usize,
    /// `embedding`, or `jaccard` when the embedder was unavailable.
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub stats: DuplicateStats,
}

/// Near-duplicate clustering over requirement titles: pairwise cosine over
/// embeddings, union-find components of size >= 2. When embeddings fail the
/// detector degrades to word-set Jaccard and says so in the stats.
pub struct DuplicateDetector {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
}

/// Union-find with deterministic roots: ties resolve toward the lower
/// `req_id` in lexicographic order.
struct UnionFind<'a> {
    parent: Vec<usize>,
    req_ids: &'a [String],
}

impl<'a> UnionFind<'a> {
    fn new(req_ids: &'a [String]) -> Self {
        Self {
            parent: (0..req_ids.len()).collect(),
            req_ids,
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent.get(x).copied().unwrap_or(x) != x {
            let grandparent = {
                let parent = self.parent.get(x).copied().unwrap_or(x);
                self.parent.get(parent).copied().unwrap_or(parent)
            };
            if let Some(slot) = self.parent.get_mut(x) {
                *slot = grandparent;
            }
            x = grandparent;
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        let id_a = self.req_ids.get(root_a).map(String::as_str).unwrap_or_default();
        let id_b = self.req_ids.get(root_b).map(String::as_str).unwrap_or_default();
        let (winner, loser) = if id_a <= id_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        if let Some(slot) = self.parent.get_mut(loser) {
            *slot = winner;
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

fn jaccard(a: &str, b: &str) -> f32 {
    let set_a: BTreeSet<String> = a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let set_b: BTreeSet<String> = b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

impl DuplicateDetector {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: Option<f32>) -> Self {
        Self {
            embedder,
            threshold: threshold.unwrap_or(DEFAULT_THRESHOLD),
        }
    }

    pub async fn find_duplicates(&self, candidates: &[DuplicateCandidate]) -> DuplicateReport {
        let total = candidates.len();
        if total < 2 {
            return DuplicateReport {
                groups: Vec::new(),
                stats: DuplicateStats {
                    total_requirements: total,
                    unique_requirements: total,
                    duplicate_groups: 0,
                    total_duplicates: 0,
                    method: "embedding".to_string(),
                },
            };
        }

        let titles: Vec<String> = candidates.iter().map(|c| c.title.clone()).collect();
        let (similarity, method): (Box<dyn Fn(usize, usize) -> f32>, &str) =
            match self.embedder.embed_batch(&titles).await {
                Ok(embeddings) if embeddings.len() == total => {
                    let embeddings = Arc::new(embeddings);
                    (
                        Box::new(move |i, j| {
                            let (Some(a), Some(b)) = (embeddings.get(i), embeddings.get(j)) else {
                                return 0.0;
                            };
                            cosine(a, b)
                        }),
                        "embedding",
                    )
                }
                other => {
                    if let Err(err) = other {
                        warn!(error = %err, "embedding failed; falling back to jaccard similarity");
                    }
                    let titles = titles.clone();
                    (
                        Box::new(move |i, j| {
                            let (Some(a), Some(b)) = (titles.get(i), titles.get(j)) else {
                                return 0.0;
                            };
                            jaccard(a, b)
                        }),
                        "jaccard",
                    )
                }
            };

        let req_ids: Vec<String> = candidates.iter().map(|c| c.req_id.clone()).collect();
        let mut union_find = UnionFind::new(&req_ids);

        // Pairs in ascending (i, j) order keep clustering deterministic.
        for i in 0..total {
            for j in i.saturating_add(1)..total {
                if similarity(i, j) >= self.threshold {
                    union_find.union(i, j);
                }
            }
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for index in 0..total {
            let root = union_find.find(index);
            components.entry(root).or_default().push(index);
        }

        let mut groups = Vec::new();
        for (root, members) in components {
            if members.len() < 2 {
                continue;
            }

            let mut rows: Vec<DuplicateMember> = members
                .iter()
                .map(|&index| DuplicateMember {
                    req_id: req_ids.get(index).cloned().unwrap_or_default(),
                    title: titles.get(index).cloned().unwrap_or_default(),
                    similarity_to_representative: if index == root {
                        1.0
                    } else {
                        similarity(root.min(index), root.max(index))
                    },
                })
                .collect();
            rows.sort_by(|a, b| a.req_id.cmp(&b.req_id));

            let non_rep: Vec<f32> = members
                .iter()
                .filter(|&&index| index != root)
                .map(|&index| similarity(root.min(index), root.max(index)))
                .collect();
            let avg_similarity = if non_rep.is_empty() {
                1.0
            } else {
                non_rep.iter().sum::<f32>() / non_rep.len() as f32
            };

            groups.push(DuplicateGroup {
                group_id: format!("dup_{}", groups.len().saturating_add(1)),
                requirements: rows,
                avg_similarity,
            });
        }

        let total_duplicates: usize = groups
            .iter()
            .map(|g| g.requirements.len().saturating_sub(1))
            .sum();
        info!(
            total,
            groups = groups.len(),
            total_duplicates,
            method,
            "duplicate detection finished"
        );

        DuplicateReport {
            stats: DuplicateStats {
                total_requirements: total,
                unique_requirements: total.saturating_sub(total_duplicates),
                duplicate_groups: groups.len(),
                total_duplicates,
                method: method.to_string(),
            },
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Stub placing the first two titles at cosine ~0.94 and the third
    /// orthogonal to both.
    struct ScriptedEmbedder;

    #[async_trait]
    impl Embedder for ScriptedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
            if text.contains("Dashboard") {
                Ok(vec![0.0, 0.0, 1.0])
            } else if text.contains("authentication") {
                // ~0.94 cosine against (1, 0, 0)
                Ok(vec![0.94, 0.341, 0.0])
            } else {
                Ok(vec![1.0, 0.0, 0.0])
            }
        }
        fn dimension(&self) -> usize {
            3
        }
        fn backend_label(&self) -> &'static str {
            "scripted"
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Err(AppError::UpstreamUnavailable("embedder down".into()))
        }
        fn dimension(&self) -> usize {
            3
        }
        fn backend_label(&self) -> &'static str {
            "broken"
        }
    }

    fn candidates() -> Vec<DuplicateCandidate> {
        vec![
            DuplicateCandidate {
                req_id: "REQ-001".to_string(),
                title: "System shall authenticate users via OAuth 2.0".to_string(),
            },
            DuplicateCandidate {
                req_id: "REQ-002".to_string(),
                title: "User authentication shall use OAuth 2.0 protocol".to_string(),
            },
            DuplicateCandidate {
                req_id: "REQ-003".to_string(),
                title: "Dashboard must load within 2 seconds".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_one_group_of_two_above_threshold() {
        let detector = DuplicateDetector::new(Arc::new(ScriptedEmbedder), Some(0.90));
        let report = detector.find_duplicates(&candidates()).await;

        assert_eq!(report.stats.method, "embedding");
        assert_eq!(report.groups.len(), 1);
        let group = report.groups.first().expect("group");
        assert_eq!(group.requirements.len(), 2);
        let ids: Vec<&str> = group.requirements.iter().map(|m| m.req_id.as_str()).collect();
        assert_eq!(ids, vec!["REQ-001", "REQ-002"]);
        assert!(group.avg_similarity >= 0.90);
        assert_eq!(report.stats.total_duplicates, 1);
        assert_eq!(report.stats.unique_requirements, 2);
    }

    #[tokio::test]
    async fn test_jaccard_fallback_is_reported() {
        let detector = DuplicateDetector::new(Arc::new(BrokenEmbedder), Some(0.5));
        let pair = vec![
            DuplicateCandidate {
                req_id: "REQ-A".to_string(),
                title: "the system shall log events".to_string(),
            },
            DuplicateCandidate {
                req_id: "REQ-B".to_string(),
                title: "the system shall log events fully".to_string(),
            },
        ];
        let report = detector.find_duplicates(&pair).await;

        assert_eq!(report.stats.method, "jaccard");
        assert_eq!(report.groups.len(), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_produces_no_groups() {
        let detector = DuplicateDetector::new(Arc::new(ScriptedEmbedder), Some(0.99));
        let report = detector.find_duplicates(&candidates()).await;
        assert!(report.groups.is_empty());
        assert_eq!(report.stats.unique_requirements, 3);
    }

    #[tokio::test]
    async fn test_single_candidate_short_circuits() {
        let detector = DuplicateDetector::new(Arc::new(ScriptedEmbedder), None);
        let report = detector
            .find_duplicates(&candidates().into_iter().take(1).collect::<Vec<_>>())
            .await;
        assert!(report.groups.is_empty());
        assert_eq!(report.stats.total_requirements, 1);
    }
}
