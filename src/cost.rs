//! Per-exchange token and cost accounting.

use std::sync::Arc;

use crate::models::CostEstimate;
use crate::tokenizer::{ApproxTokenizer, Tokenizer};

/// Computes [`CostEstimate`]s for completed exchanges.
#[derive(Clone)]
pub struct CostAccountant {
    tokenizer: Arc<dyn Tokenizer>,
}

impl Default for CostAccountant {
    fn default() -> Self {
        Self::new(Arc::new(ApproxTokenizer))
    }
}

impl CostAccountant {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    /// Estimate the cost of a query and its answer.
    ///
    /// The two texts are joined with a single space so the last word of the
    /// query and the first word of the answer stay separate. Cost is
    /// `tokens × cost_per_1000_tokens / 1000`.
    pub fn estimate(
        &self,
        query: &str,
        answer: &str,
        model_name: &str,
        cost_per_1000_tokens: f64,
    ) -> CostEstimate {
        if query.is_empty() && answer.is_empty() {
            return CostEstimate::default();
        }
        let text = format!("{} {}", query, answer);
        let word_count = text.split_whitespace().count();
        let token_count = self.tokenizer.encode(&text, model_name).len();
        CostEstimate {
            word_count,
            token_count,
            estimated_cost: token_count as f64 * cost_per_1000_tokens / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_exchange_costs_nothing() {
        let est = CostAccountant::default().estimate("", "", "gpt-3.5-turbo", 0.002);
        assert_eq!(est, CostEstimate::default());
    }

    #[test]
    fn words_do_not_fuse_across_the_join() {
        let est = CostAccountant::default().estimate("hi", "there", "m", 0.0);
        assert_eq!(est.word_count, 2);
        assert_eq!(est.token_count, 2);
    }

    #[test]
    fn cost_scales_with_price() {
        let acct = CostAccountant::default();
        let est = acct.estimate("The sky is", "blue.", "m", 2.0);
        assert_eq!(est.token_count, 5);
        assert!((est.estimated_cost - 0.01).abs() < 1e-12);
    }

    #[test]
    fn extending_the_answer_never_lowers_counts() {
        let acct = CostAccountant::default();
        let short = acct.estimate("What color is the sky?", "Blue", "m", 0.002);
        let long = acct.estimate("What color is the sky?", "Blue, usually.", "m", 0.002);
        assert!(long.word_count >= short.word_count);
        assert!(long.token_count >= short.token_count);
        assert!(long.estimated_cost >= short.estimated_cost);
    }
}
