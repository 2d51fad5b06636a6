//! Memory trigger classifier
//!
//! Decides whether a turn's text asks the assistant to remember something,
//! to recall something, or neither. Rules are regular expressions checked
//! in order; the first match wins.

use regex::Regex;

use crate::config::TriggerConfig;
use crate::{Error, Result};

/// Built-in recall phrases, checked before save phrases
pub const DEFAULT_RECALL_PATTERNS: &[&str] = &[
    r"覚えて(?:る|いる|い?ますか)",
    r"何が好き",
    r"誕生日はいつ",
    r"(?i)\bdo you remember\b",
    r"(?i)\bwhat do you know about\b",
];

/// Built-in save phrases
pub const DEFAULT_SAVE_PATTERNS: &[&str] = &[
    r"覚えて(?:おいて|て)?",
    r"記憶して",
    r"(?i)\bremember(?: that)?\b",
];

/// Separators stripped around extracted content
const SEPARATORS: &[char] = &[
    ':', '：', '、', '，', ',', '。', '.', '？', '?', '！', '!', '「', '」',
];

/// Outcome of classifying one turn's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryTrigger {
    None,
    Save(String),
    Recall(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Save,
    Recall,
}

/// Compiled trigger rule
#[derive(Debug)]
struct CompiledRule {
    intent: Intent,
    pattern: Regex,
}

impl CompiledRule {
    fn compile(intent: Intent, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid trigger pattern {pattern:?}: {e}")))?;
        Ok(Self { intent, pattern })
    }

    fn apply(&self, text: &str) -> Option<MemoryTrigger> {
        let found = self.pattern.find(text)?;
        if self.intent == Intent::Recall {
            // the whole utterance carries the topic being asked about
            return Some(MemoryTrigger::Recall(strip_separators(text)));
        }

        let mut rest = String::with_capacity(text.len());
        rest.push_str(&text[..found.start()]);
        rest.push_str(&text[found.end()..]);
        let rest = strip_separators(&rest);

        // a bare "remember" with nothing to remember is ordinary dialogue
        (!rest.is_empty()).then_some(MemoryTrigger::Save(rest))
    }
}

fn strip_separators(text: &str) -> String {
    text.trim_matches(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
        .to_string()
}

/// Ordered rule set for save/recall intent
#[derive(Debug)]
pub struct TriggerClassifier {
    rules: Vec<CompiledRule>,
}

impl Default for TriggerClassifier {
    fn default() -> Self {
        Self::from_config(&TriggerConfig::default())
            .unwrap_or_else(|_| Self { rules: Vec::new() })
    }
}

impl TriggerClassifier {
    /// Compile recall rules followed by save rules
    ///
    /// # Errors
    ///
    /// Returns error if any pattern is not a valid regular expression
    pub fn from_config(config: &TriggerConfig) -> Result<Self> {
        let recall = config
            .recall
            .iter()
            .map(|p| CompiledRule::compile(Intent::Recall, p));
        let save = config
            .save
            .iter()
            .map(|p| CompiledRule::compile(Intent::Save, p));
        let rules = recall.chain(save).collect::<Result<Vec<_>>>()?;

        tracing::debug!(count = rules.len(), "loaded memory trigger rules");
        Ok(Self { rules })
    }

    /// Classify a turn's text
    ///
    /// Pure and total: the same text always yields the same result.
    #[must_use]
    pub fn classify(&self, text: &str) -> MemoryTrigger {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(text))
            .unwrap_or(MemoryTrigger::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        let classifier = TriggerClassifier::default();
        let cases = [
            ("覚えて: 誕生日は5月1日", MemoryTrigger::Save("誕生日は5月1日".into())),
            ("好きな色は青だよ、覚えておいて", MemoryTrigger::Save("好きな色は青だよ".into())),
            ("猫の名前はタマ。記憶して！", MemoryTrigger::Save("猫の名前はタマ".into())),
            ("Remember that I like tea", MemoryTrigger::Save("I like tea".into())),
            ("覚えてる？誕生日", MemoryTrigger::Recall("覚えてる？誕生日".into())),
            ("私の誕生日はいつ？", MemoryTrigger::Recall("私の誕生日はいつ".into())),
            ("何が好き？", MemoryTrigger::Recall("何が好き".into())),
            (
                "Do you remember my dog?",
                MemoryTrigger::Recall("Do you remember my dog".into()),
            ),
            ("覚えて", MemoryTrigger::None),
            ("今日はいい天気だね", MemoryTrigger::None),
            ("", MemoryTrigger::None),
        ];

        for (text, expected) in cases {
            assert_eq!(classifier.classify(text), expected, "text: {text:?}");
        }
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = TriggerClassifier::default();
        let text = "覚えてる？誕生日";
        assert_eq!(classifier.classify(text), classifier.classify(text));
    }

    #[test]
    fn test_custom_rules_replace_defaults() {
        let classifier = TriggerClassifier::from_config(&TriggerConfig {
            recall: vec![],
            save: vec![r"(?i)^note:".to_string()],
        })
        .unwrap();
        assert_eq!(
            classifier.classify("Note: buy milk"),
            MemoryTrigger::Save("buy milk".into())
        );
        assert_eq!(classifier.classify("覚えて: x"), MemoryTrigger::None);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = TriggerClassifier::from_config(&TriggerConfig {
            recall: vec!["(unclosed".to_string()],
            save: vec![],
        })
        .unwrap_err();
        assert!(err.to_string().contains("invalid trigger pattern"));
    }
}
