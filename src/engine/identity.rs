use std::{collections::HashMap, sync::Arc};

use super::rules::{NoiseTier, ResolverRules};

const BITNESS_MARKERS: [&str; 4] = ["x64", "x86", "64", "32"];
const TITLE_SEPARATORS: [&str; 4] = [" - ", " \u{2013} ", " | ", ": "];
const TITLE_OVERLAP_THRESHOLD: f64 = 0.8;

/// Maps raw process names to canonical application identities and classifies
/// operating-system noise. One logical application frequently spans several
/// process names (helpers, updaters, multi-window instances); without folding
/// them together aggregated views fragment into noise.
pub struct IdentityResolver {
    rules: ResolverRules,
    alias_index: HashMap<String, Arc<str>>,
}

impl IdentityResolver {
    pub fn new(rules: ResolverRules) -> Self {
        let mut alias_index = HashMap::new();
        for alias_group in &rules.alias_groups {
            let canonical: Arc<str> = alias_group.canonical.to_lowercase().into();
            for member in &alias_group.members {
                alias_index.insert(member.to_lowercase(), canonical.clone());
            }
        }
        Self { rules, alias_index }
    }

    /// Canonical identity for a raw process name: file stem of the path,
    /// lowercased, with bitness markers stripped, then alias-resolved.
    pub fn normalize(&self, process_name: &str) -> Arc<str> {
        let base = base_name(process_name);
        match self.alias_index.get(&base) {
            Some(canonical) => canonical.clone(),
            None => base.into(),
        }
    }

    /// Whether two raw identities represent the same application. True when both
    /// normalize to the same base, and for applications marked always-consolidate
    /// also when their window titles look alike. Ambiguous pairs stay distinct.
    pub fn should_consolidate(
        &self,
        name_a: &str,
        name_b: &str,
        title_a: &str,
        title_b: &str,
    ) -> bool {
        let a = self.normalize(name_a);
        let b = self.normalize(name_b);
        if a == b {
            return true;
        }
        if self.rules.always_consolidate.contains(a.as_ref())
            && self.rules.always_consolidate.contains(b.as_ref())
        {
            return titles_similar(title_a, title_b);
        }
        false
    }

    /// Noise classification for a process, `None` for regular applications.
    pub fn noise_tier(&self, process_name: &str) -> Option<NoiseTier> {
        let identity = self.normalize(process_name);
        if self.rules.noise_core.contains(identity.as_ref()) {
            Some(NoiseTier::Core)
        } else if self.rules.noise_contextual.contains(identity.as_ref()) {
            Some(NoiseTier::Contextual)
        } else {
            None
        }
    }

    pub fn is_noise(&self, process_name: &str) -> bool {
        self.noise_tier(process_name).is_some()
    }
}

fn base_name(process_name: &str) -> String {
    // raw names arrive as full executable paths, from either path convention
    let file = process_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(process_name);
    let mut base = file.to_lowercase();
    if let Some(stripped) = base.strip_suffix(".exe") {
        base = stripped.to_string();
    }
    for marker in BITNESS_MARKERS {
        if base.len() > marker.len() {
            if let Some(stripped) = base.strip_suffix(marker) {
                base = stripped.trim_end_matches(['-', '_', ' ']).to_string();
                break;
            }
        }
    }
    base
}

/// Window title similarity: containment, a token-overlap ratio above the
/// threshold, or a shared trailing application-name segment.
pub fn titles_similar(title_a: &str, title_b: &str) -> bool {
    let a = title_a.trim().to_lowercase();
    let b = title_b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.contains(&b) || b.contains(&a) {
        return true;
    }

    let words_a = title_words(&a);
    let words_b = title_words(&b);
    let shared = words_a.iter().filter(|word| words_b.contains(*word)).count();
    let largest = words_a.len().max(words_b.len());
    if largest > 0 && shared as f64 / largest as f64 > TITLE_OVERLAP_THRESHOLD {
        return true;
    }

    match (trailing_segment(&a), trailing_segment(&b)) {
        (Some(tail_a), Some(tail_b)) => tail_a == tail_b,
        _ => false,
    }
}

fn title_words(title: &str) -> Vec<&str> {
    title
        .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|word| !word.is_empty())
        .collect()
}

/// The segment after the last title separator, which is where applications put
/// their own name ("Inbox - Chrome", "main.rs: editor").
fn trailing_segment(title: &str) -> Option<&str> {
    TITLE_SEPARATORS
        .iter()
        .filter_map(|separator| title.rsplit_once(separator))
        .map(|(_, tail)| tail.trim())
        .filter(|tail| !tail.is_empty())
        .min_by_key(|tail| tail.len())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{titles_similar, IdentityResolver};
    use crate::engine::rules::{AliasGroup, NoiseTier, ResolverRules};

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(ResolverRules::default())
    }

    #[test]
    fn normalize_is_case_insensitive() {
        let resolver = resolver();
        assert_eq!(resolver.normalize("Chrome"), resolver.normalize("chrome"));
    }

    #[test]
    fn normalize_strips_path_and_extension() {
        let resolver = resolver();
        assert_eq!(
            resolver.normalize(r"C:\Program Files\Mozilla Firefox\firefox.exe"),
            "firefox".into()
        );
        assert_eq!(resolver.normalize("/usr/bin/firefox"), "firefox".into());
    }

    #[test]
    fn normalize_strips_bitness_markers() {
        let resolver = resolver();
        assert_eq!(resolver.normalize("idea64.exe"), "idea".into());
        assert_eq!(resolver.normalize("notepad2-x64"), "notepad2".into());
        // a marker alone is a name, not a suffix
        assert_eq!(resolver.normalize("64"), "64".into());
    }

    #[test]
    fn normalize_resolves_alias_groups() {
        let resolver = resolver();
        assert_eq!(resolver.normalize("chromium"), "chrome".into());
        assert_eq!(resolver.normalize("DiscordCanary.exe"), "discord".into());
        assert_eq!(resolver.normalize("steamwebhelper"), "steam".into());
    }

    #[test]
    fn consolidates_same_base_name() {
        let resolver = resolver();
        assert!(resolver.should_consolidate("Chrome.exe", "chrome", "", ""));
    }

    #[test]
    fn consolidates_marked_apps_with_similar_titles() {
        let resolver = resolver();
        assert!(resolver.should_consolidate(
            "chrome",
            "msedge",
            "Inbox (3) - user@mail.com",
            "Inbox (3) - user@mail.com - Profile 1",
        ));
        assert!(!resolver.should_consolidate(
            "chrome",
            "msedge",
            "Inbox (3) - user@mail.com",
            "Release notes",
        ));
    }

    #[test]
    fn unrelated_processes_stay_distinct() {
        let resolver = resolver();
        assert!(!resolver.should_consolidate("gimp", "blender", "untitled", "untitled.blend"));
    }

    #[test]
    fn noise_tiers_are_classified() {
        let resolver = resolver();
        assert_eq!(resolver.noise_tier("explorer.exe"), Some(NoiseTier::Core));
        assert_eq!(resolver.noise_tier("DWM"), Some(NoiseTier::Core));
        assert_eq!(
            resolver.noise_tier("conhost"),
            Some(NoiseTier::Contextual)
        );
        assert_eq!(resolver.noise_tier("firefox"), None);
        assert!(resolver.is_noise("svchost"));
    }

    #[test]
    fn synthetic_rules_drive_resolution() {
        let rules = ResolverRules {
            alias_groups: vec![AliasGroup {
                canonical: "paint".into(),
                members: vec!["mspaint".into(), "pbrush".into()],
            }],
            always_consolidate: HashSet::new(),
            noise_core: ["myshell".into()].into_iter().collect(),
            noise_contextual: HashSet::new(),
        };
        let resolver = IdentityResolver::new(rules);
        assert_eq!(resolver.normalize("PBRUSH.EXE"), "paint".into());
        assert_eq!(resolver.noise_tier("myshell"), Some(NoiseTier::Core));
        assert_eq!(resolver.noise_tier("explorer"), None);
    }

    #[test]
    fn title_containment_is_similar() {
        assert!(titles_similar("Inbox - Chrome", "inbox"));
    }

    #[test]
    fn title_token_overlap_is_similar() {
        assert!(titles_similar(
            "final quarterly report draft v2",
            "quarterly report: draft v2, final",
        ));
        assert!(!titles_similar(
            "quarterly report",
            "holiday photos 2024 edit"
        ));
    }

    #[test]
    fn title_shared_trailing_segment_is_similar() {
        assert!(titles_similar(
            "main.rs - focustally - editor",
            "lib.rs - editor"
        ));
        assert!(titles_similar("Downloads | Files", "Pictures | Files"));
    }

    #[test]
    fn empty_titles_are_never_similar() {
        assert!(!titles_similar("", ""));
        assert!(!titles_similar("something", " "));
    }
}
