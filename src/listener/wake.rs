//! Wake-phrase matching on raw transcripts.

/// A wake phrase found in a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMatch {
    pub phrase: String,
    /// Transcript with the phrase removed and trimmed; empty for "wake only"
    pub residual: String,
}

impl WakeMatch {
    pub fn is_wake_only(&self) -> bool {
        self.residual.is_empty()
    }
}

/// Case-insensitive containment matcher over a fixed phrase list
#[derive(Debug, Clone)]
pub struct WakePhrases {
    // Lowercased, longest first so "hello mira" wins over "hi mira" style prefixes
    phrases: Vec<String>,
}

impl WakePhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        phrases.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        phrases.dedup();
        Self { phrases }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Find the first accepted phrase in `transcript`. The residual keeps the
    /// transcript's original casing.
    pub fn find(&self, transcript: &str) -> Option<WakeMatch> {
        let (lowered, offsets) = lowercase_with_offsets(transcript);
        self.phrases.iter().find_map(|phrase| {
            let start = lowered.find(phrase.as_str())?;
            let end = start + phrase.len();
            let residual = format!(
                "{} {}",
                &transcript[..offsets[start]],
                &transcript[offsets[end]..]
            );
            Some(WakeMatch {
                phrase: phrase.clone(),
                residual: clean_residual(&residual),
            })
        })
    }
}

/// Lowercase `text`, mapping every byte of the result (plus the end) to the
/// byte offset of the original char it came from
fn lowercase_with_offsets(text: &str) -> (String, Vec<usize>) {
    let mut lowered = String::with_capacity(text.len());
    let mut offsets = Vec::with_capacity(text.len() + 1);
    for (index, c) in text.char_indices() {
        for lower in c.to_lowercase() {
            lowered.push(lower);
            offsets.extend(std::iter::repeat(index).take(lower.len_utf8()));
        }
    }
    offsets.push(text.len());
    (lowered, offsets)
}

fn clean_residual(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace() || c == '।')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrases() -> WakePhrases {
        WakePhrases::new(["hey kisaan", "hey mira", "hi mira", "hello mira"])
    }

    #[test]
    fn test_wake_only() {
        let found = phrases().find("Hey Mira").unwrap();
        assert_eq!(found.phrase, "hey mira");
        assert!(found.is_wake_only());
    }

    #[test]
    fn test_residual_command() {
        let found = phrases().find("hey mira what is the price of wheat").unwrap();
        assert_eq!(found.residual, "what is the price of wheat");

        let found = phrases().find("Hello Mira, will it rain today?").unwrap();
        assert_eq!(found.phrase, "hello mira");
        assert_eq!(found.residual, "will it rain today");
    }

    #[test]
    fn test_residual_keeps_original_case() {
        let found = phrases().find("Hey Mira PM-KISAN status").unwrap();
        assert_eq!(found.residual, "PM-KISAN status");

        // Lowercasing 'İ' grows the string; offsets must stay on char boundaries
        let found = phrases().find("İzmir HEY MIRA Gehun ka bhav").unwrap();
        assert_eq!(found.residual, "İzmir Gehun ka bhav");

        let found = phrases().find("hey mira गेहूं का भाव").unwrap();
        assert_eq!(found.residual, "गेहूं का भाव");
    }

    #[test]
    fn test_no_match() {
        assert!(phrases().find("what is the price of wheat").is_none());
        assert!(phrases().find("").is_none());
    }

    #[test]
    fn test_trailing_punctuation_only_is_wake_only() {
        let found = phrases().find("hey kisaan!").unwrap();
        assert!(found.is_wake_only());
    }
}
