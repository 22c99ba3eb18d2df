//! Content safety screening
//!
//! Keyword screening on both sides of the LLM: the child's transcribed input
//! and each reply segment before it reaches synthesis. A flagged turn gets a
//! gentle canned reply instead; the risk source and reason are recorded on
//! the turn's record.

/// Built-in risk categories that apply regardless of per-device settings
const RISK_KEYWORDS: &[&str] = &[
    "suicide",
    "kill",
    "violence",
    "porn",
    "drug",
    "gamble",
    "weapon",
];

/// Where a safety intervention originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskSource {
    /// The child's transcribed input was flagged
    Input,
    /// The generated reply was flagged
    Output,
}

impl std::fmt::Display for RiskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Scan text against built-in categories plus the device's forbidden topics
///
/// Returns the matched keyword when the text is flagged.
#[must_use]
pub fn screen(text: &str, forbidden_topics: &[String]) -> Option<String> {
    let lowered = text.to_lowercase();

    for keyword in RISK_KEYWORDS {
        if lowered.contains(keyword) {
            return Some((*keyword).to_string());
        }
    }

    for topic in forbidden_topics {
        let topic = topic.trim();
        if !topic.is_empty() && lowered.contains(&topic.to_lowercase()) {
            return Some(topic.to_string());
        }
    }

    None
}

/// The canned reply used when a turn is flagged or the LLM returns nothing
#[must_use]
pub fn safe_reply(toy_name: &str) -> String {
    format!(
        "{toy_name} thinks that topic isn't quite right for us. \
         Let's talk about something fun instead! \
         You could tell me about something nice that happened today, \
         or about your favorite toy, cartoon, or game."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_passes() {
        assert!(screen("tell me about dinosaurs", &[]).is_none());
    }

    #[test]
    fn builtin_keyword_is_flagged() {
        let reason = screen("where can I find a weapon", &[]).unwrap();
        assert_eq!(reason, "weapon");
    }

    #[test]
    fn forbidden_topic_is_flagged_case_insensitively() {
        let topics = vec!["Scary Movies".to_string()];
        let reason = screen("I watched scary movies last night", &topics).unwrap();
        assert_eq!(reason, "Scary Movies");
    }

    #[test]
    fn blank_forbidden_topics_are_ignored() {
        let topics = vec![String::new(), "  ".to_string()];
        assert!(screen("anything at all", &topics).is_none());
    }

    #[test]
    fn safe_reply_names_the_toy() {
        assert!(safe_reply("Yoyo").starts_with("Yoyo"));
    }
}
