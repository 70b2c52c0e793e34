//! Synthetic voice selection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceQuality {
    #[default]
    Default,
    Enhanced,
    Premium,
}

/// A voice installed on the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub name: String,
    /// BCP 47 tag, e.g. `en-GB`.
    pub lang: String,
    /// Rendered on-device rather than by a network service.
    pub local: bool,
    #[serde(default)]
    pub quality: VoiceQuality,
}

impl VoiceInfo {
    fn speaks(&self, language: &str) -> bool {
        self.lang
            .to_ascii_lowercase()
            .starts_with(&language.to_ascii_lowercase())
    }
}

/// Pick the best voice for `language`.
///
/// Tiers, first match wins: local enhanced voice in `language`; any local
/// voice in `language`; any voice for `locale`; the first voice listed.
pub fn select_voice(voices: &[VoiceInfo], language: &str, locale: &str) -> Option<VoiceInfo> {
    voices
        .iter()
        .find(|v| v.speaks(language) && v.local && v.quality == VoiceQuality::Enhanced)
        .or_else(|| voices.iter().find(|v| v.speaks(language) && v.local))
        .or_else(|| voices.iter().find(|v| v.speaks(locale)))
        .or_else(|| voices.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(name: &str, lang: &str, local: bool, quality: VoiceQuality) -> VoiceInfo {
        VoiceInfo {
            name: name.into(),
            lang: lang.into(),
            local,
            quality,
        }
    }

    fn pick(voices: &[VoiceInfo]) -> Option<String> {
        select_voice(voices, "en", "en-US").map(|v| v.name)
    }

    #[test]
    fn prefers_local_enhanced_english() {
        let voices = [
            voice("Remote", "en-US", false, VoiceQuality::Enhanced),
            voice("Plain", "en-GB", true, VoiceQuality::Default),
            voice("Ava", "en-US", true, VoiceQuality::Enhanced),
        ];
        assert_eq!(pick(&voices).as_deref(), Some("Ava"));
    }

    #[test]
    fn falls_back_through_tiers() {
        let local = [
            voice("Thomas", "fr-FR", true, VoiceQuality::Enhanced),
            voice("Daniel", "en-GB", true, VoiceQuality::Default),
        ];
        assert_eq!(pick(&local).as_deref(), Some("Daniel"));

        let remote = [
            voice("Anna", "de-DE", true, VoiceQuality::Default),
            voice("Cloud", "en-US", false, VoiceQuality::Default),
        ];
        assert_eq!(pick(&remote).as_deref(), Some("Cloud"));

        let foreign = [voice("Anna", "de-DE", true, VoiceQuality::Default)];
        assert_eq!(pick(&foreign).as_deref(), Some("Anna"));

        assert!(pick(&[]).is_none());
    }

    #[test]
    fn language_match_ignores_case() {
        let voices = [
            voice("Odd", "de-DE", true, VoiceQuality::Default),
            voice("Case", "EN-au", true, VoiceQuality::Default),
        ];
        assert_eq!(pick(&voices).as_deref(), Some("Case"));
    }
}
