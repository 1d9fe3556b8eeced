use serde::Serialize;
use std::collections::HashMap;

/// The kinds of interaction tracked per counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// The subject replied to the counterpart.
    ReplyTo,
    /// The counterpart replied to the subject.
    ReplyFrom,
    /// The subject retweeted or quoted the counterpart.
    RetweetTo,
    /// The counterpart retweeted or quoted the subject.
    RetweetFrom,
    /// The subject liked a tweet of the counterpart.
    Like,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::ReplyTo,
        Category::ReplyFrom,
        Category::RetweetTo,
        Category::RetweetFrom,
        Category::Like,
    ];
}

/// Interaction counts of one subject, keyed by counterpart user id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InteractionGraph {
    pub subject_id: String,
    pub replies_to_others: HashMap<String, u64>,
    pub replies_from_others: HashMap<String, u64>,
    pub retweets_to_others: HashMap<String, u64>,
    pub retweets_from_others: HashMap<String, u64>,
    pub likes_given: HashMap<String, u64>,
}

impl InteractionGraph {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    pub fn counts(&self, category: Category) -> &HashMap<String, u64> {
        match category {
            Category::ReplyTo => &self.replies_to_others,
            Category::ReplyFrom => &self.replies_from_others,
            Category::RetweetTo => &self.retweets_to_others,
            Category::RetweetFrom => &self.retweets_from_others,
            Category::Like => &self.likes_given,
        }
    }

    fn counts_mut(&mut self, category: Category) -> &mut HashMap<String, u64> {
        match category {
            Category::ReplyTo => &mut self.replies_to_others,
            Category::ReplyFrom => &mut self.replies_from_others,
            Category::RetweetTo => &mut self.retweets_to_others,
            Category::RetweetFrom => &mut self.retweets_from_others,
            Category::Like => &mut self.likes_given,
        }
    }

    pub fn record(&mut self, category: Category, counterpart: &str) {
        *self
            .counts_mut(category)
            .entry(counterpart.to_string())
            .or_insert(0) += 1;
    }

    pub fn count(&self, category: Category, counterpart: &str) -> u64 {
        self.counts(category).get(counterpart).copied().unwrap_or(0)
    }

    /// Drops the subject's own id from every category.
    pub fn remove_subject(&mut self) {
        let subject = self.subject_id.clone();
        for category in Category::ALL {
            self.counts_mut(category).remove(&subject);
        }
    }

    pub fn is_empty(&self) -> bool {
        Category::ALL.iter().all(|c| self.counts(*c).is_empty())
    }

    /// Total number of recorded interactions across all categories.
    pub fn total(&self) -> u64 {
        Category::ALL
            .iter()
            .flat_map(|c| self.counts(*c).values())
            .sum()
    }

    pub fn ranked(&self) -> (Vec<String>, Vec<u64>) {
        crate::ranking::rank(self)
    }
}
