//! Turns pages of tweets into interaction counts.
//!
//! These functions are pure: they fold one page into a graph and report the
//! records they had to skip. Logging is left to the caller.

use crate::feeds::{Page, ReferenceKind};
use crate::graph::{Category, InteractionGraph};

/// A record that could not be attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skipped {
    /// The referenced tweet's author is missing from the page's includes.
    UnresolvedReference { record_id: String, referenced_id: String },
    /// A received reply or retweet, or a liked tweet, without an author id.
    MissingAuthor { record_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyReport {
    /// Number of interactions added to the graph.
    pub recorded: usize,
    pub skipped: Vec<Skipped>,
}

/// Classifies replies, retweets and quotes of a timeline or search page.
///
/// A reply counts as received when it targets the subject and as sent
/// otherwise. Retweets and quotes are attributed the same way, comparing the
/// referenced tweet's author against the subject.
pub fn classify_interactions(subject_id: &str, page: &Page, graph: &mut InteractionGraph) -> ClassifyReport {
    let mut report = ClassifyReport::default();

    for record in &page.records {
        if let Some(target) = record.in_reply_to_user_id.as_deref().filter(|t| !t.is_empty()) {
            if target != subject_id {
                graph.record(Category::ReplyTo, target);
                report.recorded += 1;
            } else if record.author_id.is_empty() {
                report.skipped.push(Skipped::MissingAuthor {
                    record_id: record.id.clone(),
                });
            } else {
                graph.record(Category::ReplyFrom, &record.author_id);
                report.recorded += 1;
            }
            continue;
        }

        let shares = record
            .references
            .iter()
            .filter(|r| matches!(r.kind, ReferenceKind::Retweeted | ReferenceKind::Quoted));

        for reference in shares {
            match page.referenced_authors.get(&reference.id) {
                Some(original_author) if original_author == subject_id && record.author_id.is_empty() => {
                    report.skipped.push(Skipped::MissingAuthor {
                        record_id: record.id.clone(),
                    });
                }
                Some(original_author) if original_author == subject_id => {
                    graph.record(Category::RetweetFrom, &record.author_id);
                    report.recorded += 1;
                }
                Some(original_author) => {
                    graph.record(Category::RetweetTo, original_author);
                    report.recorded += 1;
                }
                None => report.skipped.push(Skipped::UnresolvedReference {
                    record_id: record.id.clone(),
                    referenced_id: reference.id.clone(),
                }),
            }
        }
    }

    report
}

/// Classifies a page of tweets liked by the subject. When `only` is given,
/// likes of anyone else are ignored.
pub fn classify_likes(page: &Page, graph: &mut InteractionGraph, only: Option<&[String]>) -> ClassifyReport {
    let mut report = ClassifyReport::default();

    for record in &page.records {
        if record.author_id.is_empty() {
            report.skipped.push(Skipped::MissingAuthor {
                record_id: record.id.clone(),
            });
            continue;
        }
        if let Some(only) = only {
            if !only.iter().any(|id| *id == record.author_id) {
                continue;
            }
        }
        graph.record(Category::Like, &record.author_id);
        report.recorded += 1;
    }

    report
}
