use crate::graph::{Category, InteractionGraph};
use std::collections::HashMap;

/// Sums every category per counterpart and sorts by descending score.
///
/// Equal scores are ordered by ascending id so the output does not depend on
/// map iteration order. The subject's own id is never ranked.
pub fn rank(graph: &InteractionGraph) -> (Vec<String>, Vec<u64>) {
    let mut scores: HashMap<&str, u64> = HashMap::new();
    for category in Category::ALL {
        for (id, count) in graph.counts(category) {
            if *id == graph.subject_id {
                continue;
            }
            *scores.entry(id.as_str()).or_insert(0) += count;
        }
    }

    let mut ranked: Vec<(&str, u64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    ranked
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .unzip()
}
