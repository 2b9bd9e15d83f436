use std::{collections::HashSet, path::Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A set of process-name variants known to represent one logical application, like
/// a main executable plus its helper and updater processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasGroup {
    pub canonical: String,
    pub members: Vec<String>,
}

/// How aggressively a process is hidden from reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseTier {
    /// Shell, compositor and broker processes. Always excluded.
    Core,
    /// Terminals, input-method hosts, update services. Excluded unless strict
    /// filtering would otherwise empty the result.
    Contextual,
}

/// The tables driving identity resolution. Loaded as data so synthetic tables can
/// be injected in tests; a partial override file keeps the built-in defaults for
/// any field it leaves out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverRules {
    pub alias_groups: Vec<AliasGroup>,
    /// Applications whose processes are folded together whenever their window
    /// titles look alike: browsers, editors, office and chat apps.
    pub always_consolidate: HashSet<String>,
    pub noise_core: HashSet<String>,
    pub noise_contextual: HashSet<String>,
}

impl ResolverRules {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn group(canonical: &str, members: &[&str]) -> AliasGroup {
    AliasGroup {
        canonical: canonical.into(),
        members: members.iter().map(|v| (*v).into()).collect(),
    }
}

fn names(values: &[&str]) -> HashSet<String> {
    values.iter().map(|v| (*v).into()).collect()
}

impl Default for ResolverRules {
    fn default() -> Self {
        Self {
            alias_groups: vec![
                group("chrome", &["chrome", "chromium", "googlechrome"]),
                group("firefox", &["firefox", "firefox-esr", "firefox-bin"]),
                group("msedge", &["msedge", "msedgewebview2"]),
                group("code", &["code", "code-insiders", "vscodium"]),
                group("idea", &["idea", "ideau"]),
                group("teams", &["teams", "msteams", "ms-teams"]),
                group("discord", &["discord", "discordptb", "discordcanary"]),
                group("steam", &["steam", "steamwebhelper"]),
            ],
            always_consolidate: names(&[
                "chrome", "firefox", "msedge", "code", "devenv", "idea", "winword", "excel",
                "powerpnt", "outlook", "teams", "slack", "discord",
            ]),
            noise_core: names(&[
                "explorer",
                "dwm",
                "shellexperiencehost",
                "startmenuexperiencehost",
                "searchhost",
                "searchui",
                "applicationframehost",
                "runtimebroker",
                "taskhostw",
                "sihost",
                "lockapp",
                "winlogon",
            ]),
            noise_contextual: names(&[
                "windowsterminal",
                "cmd",
                "conhost",
                "powershell",
                "pwsh",
                "ctfmon",
                "textinputhost",
                "googleupdate",
                "msedgeupdate",
                "onedrive",
                "securityhealthsystray",
                "svchost",
            ]),
        }
    }
}
