//! Confirm-satisfaction answer classification.
//!
//! This is a fixed keyword heuristic. Anything it does not recognise,
//! including mixed or hedged answers, counts as unsatisfied.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfaction {
    Satisfied,
    Unsatisfied,
}

const NEGATIVE_CJK: &[&str] = &["不", "没", "否", "别", "重做"];
const POSITIVE_CJK: &[&str] = &["是", "满意", "可以", "好", "行", "对"];

const NEGATIVE_WORDS: &[&str] = &[
    "no",
    "not",
    "nope",
    "nah",
    "unsatisfied",
    "dissatisfied",
    "bad",
    "wrong",
    "redo",
    "again",
    "retry",
    "incorrect",
];
const POSITIVE_WORDS: &[&str] = &[
    "yes", "y", "yeah", "yep", "ok", "okay", "satisfied", "good", "great", "fine", "thanks",
    "perfect", "done", "lgtm",
];

fn words(answer: &str) -> Vec<String> {
    answer
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Negative markers win over positive ones.
pub fn classify_answer(answer: &str) -> Satisfaction {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return Satisfaction::Unsatisfied;
    }
    let words = words(trimmed);

    let negative = NEGATIVE_CJK.iter().any(|m| trimmed.contains(m))
        || words
            .iter()
            .any(|w| NEGATIVE_WORDS.contains(&w.as_str()) || w.contains("n't"));
    if negative {
        return Satisfaction::Unsatisfied;
    }

    let positive = POSITIVE_CJK.iter().any(|m| trimmed.contains(m))
        || words.iter().any(|w| POSITIVE_WORDS.contains(&w.as_str()));
    if positive {
        Satisfaction::Satisfied
    } else {
        Satisfaction::Unsatisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chinese_answers() {
        assert_eq!(classify_answer("是的，可以"), Satisfaction::Satisfied);
        assert_eq!(classify_answer("不满意"), Satisfaction::Unsatisfied);
        assert_eq!(classify_answer("没问题吗？重做"), Satisfaction::Unsatisfied);
    }

    #[test]
    fn english_answers() {
        assert_eq!(classify_answer("Yes, looks good"), Satisfaction::Satisfied);
        assert_eq!(classify_answer("LGTM"), Satisfaction::Satisfied);
        assert_eq!(classify_answer("no"), Satisfaction::Unsatisfied);
        assert_eq!(classify_answer("it isn't right"), Satisfaction::Unsatisfied);
        assert_eq!(classify_answer("good but redo the intro"), Satisfaction::Unsatisfied);
    }

    #[test]
    fn ambiguous_defaults_to_unsatisfied() {
        assert_eq!(classify_answer("maybe"), Satisfaction::Unsatisfied);
        assert_eq!(classify_answer("   "), Satisfaction::Unsatisfied);
        assert_eq!(classify_answer("know what"), Satisfaction::Unsatisfied);
    }
}
