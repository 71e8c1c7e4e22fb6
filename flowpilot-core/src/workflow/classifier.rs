//! Content classification strategies used by the router

use crate::models::workflow::{ExecutionState, CATEGORY_KEY};
use serde_json::Value;

/// Maps the latest step output to a routing category
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, state: &ExecutionState) -> Option<String>;
}

/// Ordered keyword table; the first category with a matching keyword wins.
///
/// A `category` string set in the context by the step just run takes
/// precedence over the keyword scan of the latest message.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    table: Vec<(String, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new(table: Vec<(String, Vec<String>)>) -> Self {
        let table = table
            .into_iter()
            .map(|(category, keywords)| {
                (
                    category,
                    keywords.into_iter().map(|k| k.to_lowercase()).collect(),
                )
            })
            .collect();
        Self { table }
    }

    /// Category for a piece of text. Single words match whole tokens,
    /// phrases match as substrings.
    pub fn classify_text(&self, text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        self.table
            .iter()
            .find(|(_, keywords)| {
                keywords.iter().any(|keyword| {
                    if keyword.contains(' ') {
                        lowered.contains(keyword.as_str())
                    } else {
                        tokens.contains(&keyword.as_str())
                    }
                })
            })
            .map(|(category, _)| category.clone())
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let table: &[(&str, &[&str])] = &[
            (
                "crm",
                &[
                    "crm", "customer", "lead", "leads", "deal", "pipeline", "prospect",
                    "contact",
                ],
            ),
            (
                "hr",
                &[
                    "hr",
                    "employee",
                    "hiring",
                    "recruit",
                    "payroll",
                    "onboarding",
                    "vacation",
                    "leave request",
                ],
            ),
            (
                "marketing",
                &["marketing", "campaign", "advertising", "ads", "seo", "newsletter"],
            ),
            (
                "calendar",
                &["calendar", "meeting", "appointment", "schedule", "reschedule"],
            ),
            ("email", &["email", "inbox", "mail", "reply"]),
            (
                "finance",
                &["invoice", "payment", "budget", "expense", "refund"],
            ),
            (
                "support",
                &["support", "ticket", "issue", "bug", "complaint"],
            ),
        ];

        Self::new(
            table
                .iter()
                .map(|(category, keywords)| {
                    (
                        category.to_string(),
                        keywords.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }
}

impl ContentClassifier for KeywordClassifier {
    fn classify(&self, state: &ExecutionState) -> Option<String> {
        if let Some(category) = state.context.get(CATEGORY_KEY).and_then(Value::as_str) {
            return Some(category.to_string());
        }
        state
            .last_message()
            .and_then(|message| self.classify_text(&message.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_categories() {
        let classifier = KeywordClassifier::default();
        assert_eq!(
            classifier.classify_text("Please add this Lead to the pipeline"),
            Some("crm".to_string())
        );
        assert_eq!(
            classifier.classify_text("Submit a leave request for Friday"),
            Some("hr".to_string())
        );
        assert_eq!(
            classifier.classify_text("Book a meeting with the design team"),
            Some("calendar".to_string())
        );
        assert_eq!(classifier.classify_text("hello there"), None);
    }

    #[test]
    fn test_whole_word_matching() {
        let classifier = KeywordClassifier::default();
        // "ads" must not match inside "loads"
        assert_eq!(classifier.classify_text("the page loads slowly"), None);
    }

    #[test]
    fn test_table_order_wins() {
        let classifier = KeywordClassifier::new(vec![
            ("first".into(), vec!["overlap".into()]),
            ("second".into(), vec!["overlap".into()]),
        ]);
        assert_eq!(classifier.classify_text("overlap"), Some("first".into()));
    }
}
