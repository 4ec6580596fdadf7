//! Supported kiosk languages and spoken language-switch detection.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// A language the kiosk can listen and reply in.
///
/// Serialized by name (`"hindi"`), which is what the stream server expects in
/// `start` and `change_language` messages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Hindi,
    English,
    Punjabi,
    Marathi,
    Gujarati,
    Tamil,
    Telugu,
    Kannada,
    Bengali,
}

impl Language {
    /// Two-letter code used by recognition engines.
    pub fn code(&self) -> &'static str {
        match self {
            Language::Hindi => "hi",
            Language::English => "en",
            Language::Punjabi => "pa",
            Language::Marathi => "mr",
            Language::Gujarati => "gu",
            Language::Tamil => "ta",
            Language::Telugu => "te",
            Language::Kannada => "kn",
            Language::Bengali => "bn",
        }
    }

    /// Locale tag handed to the recognition engine.
    pub fn locale(&self) -> String {
        format!("{}-IN", self.code())
    }

    /// Parse either a language name ("tamil") or a code ("ta", "ta-IN").
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(language) = value.parse::<Language>() {
            return Some(language);
        }
        let code = value.split(['-', '_']).next().unwrap_or(value).to_ascii_lowercase();
        Language::iter().find(|language| language.code() == code)
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Language::Hindi => &["हिंदी", "hindi", "हिन्दी"],
            Language::English => &["english", "अंग्रेजी", "angrezī"],
            Language::Punjabi => &["punjabi", "पंजाबी", "ਪੰਜਾਬੀ"],
            Language::Marathi => &["marathi", "मराठी"],
            Language::Gujarati => &["gujarati", "गुजराती"],
            Language::Tamil => &["tamil", "तमिल", "தமிழ்"],
            Language::Telugu => &["telugu", "तेलुगु", "తెలుగు"],
            Language::Kannada => &["kannada", "कन्नड़", "ಕನ್ನಡ"],
            Language::Bengali => &["bengali", "बंगाली", "বাংলা"],
        }
    }
}

/// Detect a language preference spoken by the user ("please speak in english").
///
/// Returns the first catalogue language whose keyword appears in the text.
pub fn detect_language_switch(text: &str) -> Option<Language> {
    let lowered = text.to_lowercase();
    Language::iter().find(|language| {
        language
            .keywords()
            .iter()
            .any(|keyword| lowered.contains(keyword))
    })
}
